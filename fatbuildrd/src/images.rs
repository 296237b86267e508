//! Container base images and per-distribution build environments.
//!
//! Grounded on `images.py` (`Image`, `BuildEnv`, `ImagesManager`). Image
//! creation/update/shell/exec and build environment creation/update/shell/
//! exec are all templated command sequences (`minijinja` via
//! `templates::Templeter`, mirroring the original's own `Templeter`), run
//! inside a container through `containers::ContainerRunner`. Command output
//! is logged line-by-line with `log::info!`, the way `builder.rs` captures
//! and prints `docker` output; the per-task-thread logging wrapper (see
//! `log.rs`) duplicates these records into the running task's console
//! journal, so no separate output-plumbing is needed here.

use std::path::{Path, PathBuf};

use duct::cmd;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::config::{Config, FormatConfig};
use crate::pipelines::InstancePipelines;
use crate::specifics::ArchMap;
use crate::templates::{TemplateContext, Templeter};
use crate::utils::current_user_group;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("image {path:?} already exists, use force to recreate"))]
    AlreadyExists { path: PathBuf },

    #[snafu(display("image definition file {path:?} not found"))]
    DefinitionMissing { path: PathBuf },

    #[snafu(display("image {path:?} does not exist, create it first"))]
    NotCreated { path: PathBuf },

    #[snafu(display("init_cmds is not defined for format {format}"))]
    NoInitCmds { format: String },

    #[snafu(display("exec_cmd is not defined for format {format}"))]
    NoExecCmd { format: String },

    #[snafu(display("shell_cmd is not defined for format {format}"))]
    NoShellCmd { format: String },

    #[snafu(display("build environment {name} has no on-disk path configured"))]
    NoEnvPath { name: String },

    #[snafu(display("unable to render template: {source}"))]
    Render { source: crate::templates::Error },

    #[snafu(display("unable to write skeleton archive {path:?}: {source}"))]
    Skeleton {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to run command for format {format}: {source}"))]
    Command {
        format: String,
        source: std::io::Error,
    },

    #[snafu(transparent)]
    Container { source: crate::containers::Error },

    #[snafu(transparent)]
    Pipelines { source: crate::pipelines::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn run_logged(command: &[String], format: &str) -> Result<()> {
    log::debug!("running command: {}", command.join(" "));
    let output = cmd(&command[0], &command[1..])
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked()
        .run()
        .with_context(|_| CommandSnafu {
            format: format.to_string(),
        })?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        log::info!("{line}");
    }
    if !output.status.success() {
        return Err(Error::Command {
            format: format.to_string(),
            source: std::io::Error::other(format!("command exited with {:?}", output.status)),
        });
    }
    Ok(())
}

/// A container image for one packaging format.
pub struct Image {
    pub format: String,
    pub path: PathBuf,
    pub format_libdir: PathBuf,
    pub common_libdir: PathBuf,
    pub def_path: PathBuf,
    pub skel_path: PathBuf,
    format_conf: FormatConfig,
}

impl Image {
    pub fn new(config: &Config, instance_id: &str, format: &str) -> Self {
        Image {
            format: format.to_string(),
            path: config
                .images
                .storage
                .join(instance_id)
                .join(format)
                .with_extension("img"),
            format_libdir: config.images.defs.join(format),
            common_libdir: config.images.defs.join("common"),
            def_path: config.images.defs.join(format).with_extension("mkosi"),
            skel_path: config.images.storage.join("skeleton.tar"),
            format_conf: config.format(format),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn def_exists(&self) -> bool {
        self.def_path.exists()
    }

    pub fn format_conf(&self) -> &FormatConfig {
        &self.format_conf
    }

    /// Write the mkosi skeleton archive declaring the fatbuildr system
    /// user/group, so images are built with the daemon's own UID/GID baked
    /// in (either via `systemd-sysusers` or flat `/etc/passwd`+`/etc/group`).
    fn write_skeleton(&self) -> Result<()> {
        if self.skel_path.exists() {
            std::fs::remove_file(&self.skel_path).context(SkeletonSnafu {
                path: self.skel_path.clone(),
            })?;
        }
        let (uid, user, gid, group) = current_user_group();
        let file = std::fs::File::create(&self.skel_path).context(SkeletonSnafu {
            path: self.skel_path.clone(),
        })?;
        let mut builder = tar::Builder::new(file);

        let mut add = |path: &str, mode: u32, content: String| -> Result<()> {
            let bytes = content.into_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_path(path).context(SkeletonSnafu {
                path: self.skel_path.clone(),
            })?;
            header.set_size(bytes.len() as u64);
            header.set_mode(mode);
            header.set_cksum();
            builder
                .append(&header, bytes.as_slice())
                .context(SkeletonSnafu {
                    path: self.skel_path.clone(),
                })
        };

        if self.format_conf.img_create_use_sysusersd.unwrap_or(false) {
            add(
                "usr/lib/sysusers.d/fatbuildr.conf",
                0o644,
                format!("g {group} {gid}\nu {user} {uid}:{gid} \"Fatbuildr user\"\n"),
            )?;
        } else {
            add(
                "etc/passwd",
                0o644,
                format!("{user}:x:{uid}:{gid}:Fatbuildr system user:/:/bin/false\n"),
            )?;
            add("etc/group", 0o644, format!("{group}:x:{gid}:\n"))?;
            add("etc/gshadow", 0o640, format!("{group}:!*::\n"))?;
        }
        builder.finish().context(SkeletonSnafu {
            path: self.skel_path.clone(),
        })?;
        Ok(())
    }

    pub fn create(&self, config: &Config, force: bool) -> Result<()> {
        log::info!("creating image for {} format", self.format);
        if self.exists() && !force {
            return AlreadyExistsSnafu {
                path: self.path.clone(),
            }
            .fail();
        }
        if !self.def_exists() {
            return DefinitionMissingSnafu {
                path: self.def_path.clone(),
            }
            .fail();
        }

        self.write_skeleton()?;
        let (uid, user, gid, group) = current_user_group();

        let mut ctx = TemplateContext::new();
        ctx.set("format", self.format.as_str());
        ctx.set("definition", self.def_path.display().to_string());
        ctx.set("path", self.path.display().to_string());
        ctx.set("skeleton", self.skel_path.display().to_string());
        ctx.set("user", user.as_str());
        ctx.set("group", group.as_str());
        ctx.set("uid", uid);
        ctx.set("gid", gid);

        let rendered = Templeter::new()
            .srender("create_cmd", &config.images.create_cmd, &ctx.into_map())
            .context(RenderSnafu)?;
        let mut command: Vec<String> = rendered.split(' ').map(String::from).collect();
        if force {
            command.insert(1, "--force".to_string());
        }
        run_logged(&command, &self.format)
    }

    pub fn update(&self) -> Result<()> {
        log::info!("updating image for {} format", self.format);
        if !self.exists() {
            return NotCreatedSnafu {
                path: self.path.clone(),
            }
            .fail();
        }
        let cmds = self
            .format_conf
            .img_update_cmds
            .as_deref()
            .context(NoInitCmdsSnafu {
                format: self.format.clone(),
            })?;
        for part in cmds.split("&&") {
            run_logged(
                &part.trim().split(' ').map(String::from).collect::<Vec<_>>(),
                &self.format,
            )?;
        }
        Ok(())
    }
}

/// A named build environment inside an image, pinned to one architecture.
pub struct BuildEnv<'a> {
    pub image: &'a Image,
    pub environment: String,
    pub architecture: String,
    pipelines: &'a InstancePipelines,
}

impl<'a> BuildEnv<'a> {
    pub fn new(
        image: &'a Image,
        environment: &str,
        architecture: &str,
        pipelines: &'a InstancePipelines,
    ) -> Self {
        BuildEnv {
            image,
            environment: environment.to_string(),
            architecture: architecture.to_string(),
            pipelines,
        }
    }

    pub fn native_architecture(&self) -> String {
        ArchMap::new(&self.image.format).native(&self.architecture)
    }

    pub fn base(&self) -> String {
        format!("{}-{}", self.environment, self.native_architecture())
    }

    pub fn name(&self) -> String {
        format!("fatbuildr-{}", self.base())
    }

    pub fn path(&self) -> Result<Option<PathBuf>> {
        match &self.image.format_conf.env_path {
            Some(tpl) => {
                let mut ctx = TemplateContext::new();
                ctx.set("name", self.name());
                let rendered = Templeter::new()
                    .srender("env_path", tpl, &ctx.into_map())
                    .context(RenderSnafu)?;
                Ok(Some(PathBuf::from(rendered)))
            }
            None => Ok(None),
        }
    }

    fn base_context(&self) -> Result<TemplateContext> {
        let mut ctx = TemplateContext::new();
        ctx.set("name", self.name());
        ctx.set("base", self.base());
        ctx.set("environment", self.environment.as_str());
        ctx.set("architecture", self.native_architecture());
        if let Some(path) = self.path()? {
            ctx.set("path", path.display().to_string());
        }
        Ok(ctx)
    }

    pub fn create(&self) -> Result<()> {
        log::info!(
            "creating build environment {} for architecture {} in {} image",
            self.environment,
            self.architecture,
            self.image.format
        );
        let init_cmds = self
            .image
            .format_conf
            .init_cmds
            .as_deref()
            .context(NoInitCmdsSnafu {
                format: self.image.format.clone(),
            })?;

        let mirror = self
            .pipelines
            .env_mirror(&self.environment)
            .or_else(|| self.image.format_conf.env_default_mirror.clone());
        let components = self
            .pipelines
            .env_components(&self.environment)
            .or_else(|| self.image.format_conf.env_default_components.clone());

        let mut ctx = self.base_context()?;
        if let Some(mirror) = &mirror {
            ctx.set("mirror", mirror.as_str());
        }
        if let Some(components) = &components {
            ctx.set("components", components.join(","));
        }

        for part in init_cmds.split("&&") {
            let rendered = Templeter::new()
                .srender("init_cmds", part.trim(), &ctx.clone().into_map())
                .context(RenderSnafu)?;
            run_logged(
                &rendered.split(' ').map(String::from).collect::<Vec<_>>(),
                &self.image.format,
            )?;
        }
        Ok(())
    }

    pub fn update(&self) -> Result<()> {
        log::info!(
            "updating build environment {} for architecture {} in {} image",
            self.name(),
            self.architecture,
            self.image.format
        );
        let update_cmds =
            self.image
                .format_conf
                .env_update_cmds
                .as_deref()
                .context(NoInitCmdsSnafu {
                    format: self.image.format.clone(),
                })?;
        let ctx = self.base_context()?;
        for part in update_cmds.split("&&") {
            let rendered = Templeter::new()
                .srender("env_update_cmds", part.trim(), &ctx.clone().into_map())
                .context(RenderSnafu)?;
            run_logged(
                &rendered.split(' ').map(String::from).collect::<Vec<_>>(),
                &self.image.format,
            )?;
        }
        Ok(())
    }

    pub fn exec(&self, command: &[String]) -> Result<()> {
        let base_cmd = self
            .image
            .format_conf
            .exec_cmd
            .as_deref()
            .context(NoExecCmdSnafu {
                format: self.image.format.clone(),
            })?;
        let ctx = self.base_context()?;
        let rendered = Templeter::new()
            .srender("exec_cmd", base_cmd, &ctx.into_map())
            .context(RenderSnafu)?;
        let mut full: Vec<String> = rendered.split(' ').map(String::from).collect();
        full.extend(command.iter().cloned());
        run_logged(&full, &self.image.format)
    }
}

pub struct ImagesManager<'a> {
    config: &'a Config,
    instance_id: String,
}

impl<'a> ImagesManager<'a> {
    pub fn new(config: &'a Config, instance_id: &str) -> Self {
        ImagesManager {
            config,
            instance_id: instance_id.to_string(),
        }
    }

    pub fn image(&self, format: &str) -> Image {
        Image::new(self.config, &self.instance_id, format)
    }

    pub fn build_env<'b>(
        &self,
        image: &'b Image,
        name: &str,
        architecture: &str,
        pipelines: &'b InstancePipelines,
    ) -> BuildEnv<'b> {
        BuildEnv::new(image, name, architecture, pipelines)
    }

    /// Create the instance's image storage directory if it is missing,
    /// umask-agnostically.
    pub fn prepare(&self) -> std::io::Result<()> {
        let path = self.config.images.storage.join(&self.instance_id);
        if !path.exists() {
            std::fs::create_dir_all(&path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> Config {
        toml::from_str(
            r#"
            [dirs]
            instances = "/tmp/i"
            workspaces = "/tmp/w"
            cache = "/tmp/c"
            [keyring]
            storage = "/tmp/k"
            type = "rsa"
            size = 4096
            expires = false
            [tokens]
            storage = "/tmp/t"
            audience = "fatbuildr"
            algorithm = "HS256"
            duration = 30
            [registry]
            storage = "/tmp/r"
            conf = "/tmp/rc"
            [images]
            storage = "/tmp/img"
            defs = "/tmp/defs"
            create_cmd = "mkosi --directory {{ definition }}"
            [run]
            policy = "/tmp/p"
            vendor_policy = "/tmp/vp"
            [tasks]
            workspaces = "/tmp/w"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn image_paths_derive_from_instance_and_format() {
        let config = config();
        let image = Image::new(&config, "inst1", "deb");
        assert_eq!(image.path, PathBuf::from("/tmp/img/inst1/deb.img"));
        assert_eq!(image.def_path, PathBuf::from("/tmp/defs/deb.mkosi"));
    }

    #[test]
    fn buildenv_names_include_native_architecture() {
        let config = config();
        let image = Image::new(&config, "inst1", "deb");
        let pipelines_yaml = r#"
gpg: { name: "T", email: "t@example.org" }
formats:
  deb:
    - name: bookworm
      tag: "x"
      env: bookworm-env
"#;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), pipelines_yaml).unwrap();
        let pipelines = InstancePipelines::load(file.path(), "x86_64").unwrap();
        let env = BuildEnv::new(&image, "bookworm-env", "x86_64", &pipelines);
        assert_eq!(env.native_architecture(), "amd64");
        assert_eq!(env.name(), "fatbuildr-bookworm-env-amd64");
    }
}
