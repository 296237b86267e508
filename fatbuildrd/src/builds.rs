//! Artifact build pipeline (C10).
//!
//! Grounded on `builds/__init__.py`'s `ArtifactBuild`/`ArtifactEnvBuild`,
//! the current pipeline per `spec.md` §9's Open Question resolution (the
//! legacy `builder.py`/`builders/*` pipeline is not reproduced). Drives
//! `artifacts.rs` (C1/C10 data model), `patches.rs`/`git.rs` (C6),
//! `templates.rs`, `containers.rs` (C5 execution), `keyring.rs` (C2
//! signing), and the registry layer (C7), in the nine steps of `spec.md`
//! §4.10.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu};
use walkdir::WalkDir;

use crate::archive::{self, ArchiveFormat};
use crate::artifacts::{self, ArtifactDefs, ArtifactDefsFactory, ArtifactVersion};
use crate::config::Config;
use crate::console::{Frame, TaskIo};
use crate::containers::{ContainerRunner, RunOptions};
use crate::git::{GitRepository, PatchesDir};
use crate::instances::RunningInstance;
use crate::registry::PublishContext;
use crate::templates::{TemplateContext, Templeter};
use crate::utils::{self, ChecksumFormat};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to extract artifact definition {path:?}: {source}"))]
    Extract { path: PathBuf, source: archive::Error },

    #[snafu(display("unable to remove artifact definition tarball {path:?}: {source}"))]
    RemoveTarball { path: PathBuf, source: std::io::Error },

    #[snafu(display("no source tarball available for artifact {artifact} and no tarball URL in meta.yml"))]
    NoTarball { artifact: String },

    #[snafu(display("unable to create temporary prescript directory: {source}"))]
    PrescriptScratch { source: std::io::Error },

    #[snafu(display("unable to render template {path:?}: {source}"))]
    Render { path: PathBuf, source: crate::templates::Error },

    #[snafu(display("unable to apply rename index: {source}"))]
    Rename { source: std::io::Error },

    #[snafu(display("unable to walk format subdirectory {path:?}: {source}"))]
    Walk { path: PathBuf, source: walkdir::Error },

    #[snafu(display("no builder command configured for format {format}"))]
    NoBuilder { format: String },

    #[snafu(display("build command {command} failed: {source}"))]
    Command { command: String, source: std::io::Error },

    #[snafu(display("build command {command} exited with a failure status"))]
    CommandFailed { command: String },

    #[snafu(transparent)]
    Artifacts { source: artifacts::Error },

    #[snafu(transparent)]
    Patches { source: crate::patches::Error },

    #[snafu(transparent)]
    Git { source: crate::git::Error },

    #[snafu(transparent)]
    Templates { source: crate::templates::Error },

    #[snafu(transparent)]
    Containers { source: crate::containers::Error },

    #[snafu(transparent)]
    Registry { source: crate::registry::Error },

    #[snafu(transparent)]
    Keyring { source: crate::keyring::Error },

    #[snafu(transparent)]
    Console { source: crate::console::Error },

    #[snafu(transparent)]
    Download { source: utils::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One caller-supplied source tarball, identified by the `source-id` the
/// caller attached to it (`spec.md` §4.10 step 3).
#[derive(Debug, Clone)]
pub struct SourceTarball {
    pub source_id: String,
    pub path: PathBuf,
}

/// Everything a build task needs, independent of how it was submitted
/// (console client, HTTP form — both out of scope here).
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub format: String,
    pub distribution: String,
    pub derivative: String,
    pub architectures: Vec<String>,
    pub artifact: String,
    pub user: String,
    pub email: String,
    pub message: String,
    pub definition_tarball: PathBuf,
    pub source_tarballs: Vec<SourceTarball>,
    pub interactive: bool,
}

lazy_static! {
    /// `<artifact>-<main-version>.tar.xz`, the filename convention a
    /// caller-provided source tarball must follow to be adopted directly.
    static ref PROVIDED_TARBALL_RE: Regex = Regex::new(r"^(?P<artifact>.+)-(?P<version>[^-]+)\.tar\.xz$").unwrap();
}

pub struct ArtifactBuild<'a> {
    config: &'a Config,
    instance: &'a RunningInstance,
    request: BuildRequest,
    workspace: PathBuf,
    io: Arc<TaskIo>,
}

impl<'a> ArtifactBuild<'a> {
    pub fn new(
        config: &'a Config,
        instance: &'a RunningInstance,
        request: BuildRequest,
        workspace: PathBuf,
        io: Arc<TaskIo>,
    ) -> Self {
        ArtifactBuild {
            config,
            instance,
            request,
            workspace,
            io,
        }
    }

    fn log(&self, message: impl AsRef<str>) {
        log::info!("{}", message.as_ref());
        let _ = self.io.dispatch(&Frame::log(20, message.as_ref()));
    }

    /// Loads a fresh view of the instance keyring. The `RunningInstance`
    /// holds its own `InstanceKeyring` but, like the keyring-create/renew
    /// task handlers in `tasks/mod.rs`, a build loads its own local copy
    /// rather than requiring shared mutable access to the long-lived
    /// instance for what is a read-mostly, per-task operation.
    fn keyring(&self) -> Result<crate::keyring::InstanceKeyring> {
        let mut keyring = crate::keyring::InstanceKeyring::new(self.config, self.instance.instance.id());
        keyring.load()?;
        Ok(keyring)
    }

    pub fn run(&self) -> Result<()> {
        let place = self.extract_definition()?;
        let defs = ArtifactDefs::load(&place, &self.request.artifact)?;
        let format_defs = ArtifactDefsFactory::get(&place, &self.request.artifact, &self.request.format)?;

        let version = self.resolve_version(&place, &defs, &format_defs)?;

        let registry = self.instance.registry(self.config, &self.request.format)?;
        registry.check_not_already_published(
            &self.request.distribution,
            &self.request.derivative,
            &self.request.artifact,
            &version,
        )?;

        if place.join("pre.sh").exists() {
            self.run_prescript(&place, &version)?;
        }

        self.apply_rename_index(&place)?;
        self.render_format_templates(&place, &version)?;

        self.run_format_build(&place, &version)?;
        self.sign_outputs(&place)?;

        let derivatives = self.instance.instance.pipelines.recursive_derivatives(&self.request.derivative)?;
        let architectures = &self.instance.instance.pipelines.architectures;
        let keyring = self.keyring()?;
        registry.publish(&PublishContext {
            artifact: &self.request.artifact,
            distribution: &self.request.distribution,
            derivative: &self.request.derivative,
            place: &place,
            derivatives: &derivatives,
            architectures,
            keyring_fingerprint: keyring
                .masterkey
                .as_ref()
                .map(|m| m.subkey.fingerprint.as_str())
                .unwrap_or(""),
            keyring_homedir: keyring.homedir(),
            instance_name: self.instance.instance.id(),
            registry_conf_dir: &self.config.registry.conf,
        })?;

        self.log(format!("published {} {}", self.request.artifact, version.full()));
        Ok(())
    }

    /// Step 1: extract the artifact-definition tarball into the workspace
    /// and unlink it.
    fn extract_definition(&self) -> Result<PathBuf> {
        let format = ArchiveFormat::detect(&self.request.definition_tarball).context(ExtractSnafu {
            path: self.request.definition_tarball.clone(),
        })?;
        archive::safe_extract_tar(&self.request.definition_tarball, &self.workspace, format, 0)
            .context(ExtractSnafu { path: self.request.definition_tarball.clone() })?;
        std::fs::remove_file(&self.request.definition_tarball).context(RemoveTarballSnafu {
            path: self.request.definition_tarball.clone(),
        })?;
        Ok(self.workspace.clone())
    }

    /// Step 3: resolve the version either from a caller-provided tarball,
    /// from `meta.tarball` (downloading to cache if missing), or purely
    /// from `meta.yml` when the format has no tarball (e.g. OSI).
    fn resolve_version(&self, place: &Path, defs: &ArtifactDefs, format_defs: &crate::artifacts::ArtifactFormatDefs) -> Result<ArtifactVersion> {
        let main_version = defs.version(&self.request.derivative)?;

        if let Some(provided) = self.request.source_tarballs.iter().find(|t| {
            t.path
                .file_name()
                .and_then(|f| f.to_str())
                .map(|name| name == format!("{}-{}.tar.xz", self.request.artifact, main_version))
                .unwrap_or(false)
        }) {
            self.log(format!("adopting caller-provided source tarball {:?}", provided.path));
        } else if defs.has_tarball() {
            let cache = self.instance.cache.artifact(&self.request.artifact);
            cache.ensure().ok();
            let filename = defs.tarball_filename(&main_version)?;
            if !cache.has_tarball(&filename) {
                let url = defs.tarball_url(&main_version)?;
                self.log(format!("downloading {url}"));
                utils::dl_file(&url, &cache.tarball(&filename))?;
            }
            let format = defs.checksum_format(&self.request.derivative)?;
            let value = defs.checksum_value(&self.request.derivative)?;
            utils::verify_checksum(
                &cache.tarball(&filename),
                format.parse::<ChecksumFormat>().unwrap_or(ChecksumFormat::Sha256),
                &value,
            )?;
        }

        let release = format_defs.fullversion(&self.request.derivative)?;
        let _ = place;
        Ok(ArtifactVersion::parse(&format!("{main_version}-{release}"))?)
    }

    /// Step 4: extract the upstream source, turn it into a git repository,
    /// import any existing patches, run `pre.sh`, then export the working
    /// tree's changes as one synthetic `fatbuildr-prescript` patch.
    fn run_prescript(&self, place: &Path, version: &ArtifactVersion) -> Result<()> {
        self.log("running prescript");
        let tmpdir = tempfile::Builder::new()
            .prefix(&format!("fatbuildr-prescript-{}-", self.request.artifact))
            .tempdir()
            .context(PrescriptScratchSnafu)?
            .into_path();

        let cache = self.instance.cache.artifact(&self.request.artifact);
        let candidates: Vec<PathBuf> = std::fs::read_dir(cache.dir())
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        let Some(tarball) = candidates.into_iter().find(|p| p.extension().is_some()) else {
            log::warn!("no source tarball found for prescript, skipping");
            return Ok(());
        };

        let format = ArchiveFormat::detect(&tarball).context(ExtractSnafu { path: tarball.clone() })?;
        archive::safe_extract_tar(&tarball, &tmpdir, format, 0).context(ExtractSnafu { path: tarball.clone() })?;
        let repo_path = tmpdir.join(archive::archive_subdir_name(&tarball));

        let gpg = &self.instance.instance.pipelines.gpg;
        let git = GitRepository::init(&repo_path, &gpg.name, &gpg.email, None)?;
        let patches_dir = PatchesDir::new(place, &version.main());
        git.import_patches(&patches_dir)?;

        let status = std::process::Command::new("/bin/sh")
            .arg(place.join("pre.sh"))
            .current_dir(&repo_path)
            .status()
            .context(CommandSnafu { command: "pre.sh".to_string() })?;
        if !status.success() {
            return CommandFailedSnafu { command: "pre.sh".to_string() }.fail();
        }

        let version_subdir = patches_dir.version_subdir();
        let next_index = version_subdir.patches().map(|p| p.len()).unwrap_or(0) as u32 + 1;
        git.commit_export(
            &version_subdir,
            next_index,
            "fatbuildr-prescript",
            &gpg.name,
            &gpg.email,
            "Changes produced by the artifact prescript.",
            None,
        )?;

        std::fs::remove_dir_all(&tmpdir).ok();
        Ok(())
    }

    /// Step 5: render `rename.j2` (if present) and apply the resulting
    /// rename index.
    fn apply_rename_index(&self, place: &Path) -> Result<()> {
        let rename_template = place.join("rename.j2");
        if !rename_template.exists() {
            return Ok(());
        }
        let ctx = TemplateContext::new();
        let content = std::fs::read_to_string(&rename_template).context(RenameSnafu)?;
        let rendered = Templeter::new()
            .srender("rename", &content, &ctx.into_map())
            .context(RenderSnafu { path: rename_template.clone() })?;
        std::fs::write(place.join("rename"), &rendered).context(RenameSnafu)?;

        let rules = artifacts::parse_rename_index(&rendered);
        artifacts::apply_rename_index(place, &rules).context(RenameSnafu)?;
        Ok(())
    }

    /// Step 6: recursively render every `<format>/**/*.j2` template,
    /// preserving the source file's mode on the rendered output.
    fn render_format_templates(&self, place: &Path, version: &ArtifactVersion) -> Result<()> {
        let format_dir = place.join(&self.request.format);
        if !format_dir.exists() {
            return Ok(());
        }

        let mut ctx = TemplateContext::new();
        ctx.set("version", version.full());
        ctx.set("main", version.main());
        ctx.set("release", version.fullrelease());

        let templeter = Templeter::new();
        for entry in WalkDir::new(&format_dir) {
            let entry = entry.context(WalkSnafu { path: format_dir.clone() })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("j2") {
                continue;
            }
            let rendered = templeter
                .frender(path, &ctx.clone().into_map())
                .context(RenderSnafu { path: path.to_path_buf() })?;
            let output_path = path.with_extension("");
            #[cfg(unix)]
            let mode = std::fs::metadata(path).ok().map(|m| {
                use std::os::unix::fs::PermissionsExt;
                m.permissions().mode()
            });
            std::fs::write(&output_path, rendered).context(RenameSnafu)?;
            #[cfg(unix)]
            if let Some(mode) = mode {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&output_path, std::fs::Permissions::from_mode(mode));
            }
            std::fs::remove_file(path).context(RenameSnafu)?;
        }
        Ok(())
    }

    /// Step 7: run the format-specific build inside the container, bind
    /// mounting the workspace, the instance cache, and (if present) the
    /// instance registry tree. The builder command is a configured
    /// `&&`-joined template (`format.builder`), rendered once per part,
    /// the same way `BuildEnv::create`/`update` render their own command
    /// chains in `images.rs`.
    fn run_format_build(&self, place: &Path, version: &ArtifactVersion) -> Result<()> {
        let format_conf = self.config.format(&self.request.format);
        let builder = format_conf.builder.as_deref().context(NoBuilderSnafu {
            format: self.request.format.clone(),
        })?;

        let mut ctx = TemplateContext::new();
        ctx.set("artifact", self.request.artifact.as_str());
        ctx.set("version", version.full());
        ctx.set("main", version.main());
        ctx.set("release", version.fullrelease());
        ctx.set("distribution", self.request.distribution.as_str());
        ctx.set("derivative", self.request.derivative.as_str());
        ctx.set("place", place.display().to_string());

        let registry_path = self.config.registry.storage.join(self.instance.instance.id()).join(&self.request.format);
        let mut binds = vec![self.workspace.clone(), self.instance.cache.artifact(&self.request.artifact).dir().to_path_buf()];
        if registry_path.exists() {
            binds.push(registry_path);
        }

        let templeter = Templeter::new();
        for part in builder.split("&&") {
            let rendered = templeter
                .srender("builder", part.trim(), &ctx.clone().into_map())
                .context(RenderSnafu { path: place.to_path_buf() })?;
            self.log(format!("running build step: {rendered}"));
            let runcmd: Vec<String> = rendered.split(' ').map(String::from).collect();
            let runner = ContainerRunner::new("");
            let image_path = self.config.images.storage.join(self.instance.instance.id()).join(format!("{}.img", self.request.format));
            runner.run(
                &image_path,
                &runcmd,
                &RunOptions {
                    binds: binds.clone(),
                    chdir: Some(PathBuf::from("/build")),
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    /// Step 8: sign build outputs with the agent-preloaded signing subkey.
    /// Deb signs implicitly during `reprepro include`; RPM and OSI sign
    /// explicitly here.
    fn sign_outputs(&self, place: &Path) -> Result<()> {
        if self.request.format == "deb" {
            return Ok(());
        }
        self.log("preloading signing key into gpg-agent");
        let keyring = self.keyring()?;
        keyring.load_agent()?;

        match self.request.format.as_str() {
            "rpm" => {
                for entry in WalkDir::new(place).into_iter().filter_map(|e| e.ok()) {
                    if entry.path().extension().and_then(|e| e.to_str()) == Some("rpm") {
                        self.log(format!("signing {:?}", entry.path()));
                        let status = duct::cmd(
                            "rpmsign",
                            vec!["--addsign".to_string(), entry.path().display().to_string()],
                        )
                        .run()
                        .context(CommandSnafu { command: "rpmsign --addsign".to_string() })?
                        .status;
                        if !status.success() {
                            return CommandFailedSnafu { command: "rpmsign --addsign".to_string() }.fail();
                        }
                    }
                }
            }
            "osi" => {
                let sums = place.join("SHA256SUMS");
                if sums.exists() {
                    self.log("signing SHA256SUMS");
                    let status = duct::cmd(
                        "gpg",
                        vec![
                            "--homedir".to_string(),
                            keyring.homedir().display().to_string(),
                            "--detach-sign".to_string(),
                            "--armor".to_string(),
                            "--output".to_string(),
                            place.join("SHA256SUMS.gpg").display().to_string(),
                            sums.display().to_string(),
                        ],
                    )
                    .run()
                    .context(CommandSnafu { command: "gpg --detach-sign".to_string() })?
                    .status;
                    if !status.success() {
                        return CommandFailedSnafu { command: "gpg --detach-sign".to_string() }.fail();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn provided_tarball_regex_splits_artifact_and_version() {
        let captures = PROVIDED_TARBALL_RE.captures("pkg-1.2.3.tar.xz").unwrap();
        assert_eq!(&captures["artifact"], "pkg");
        assert_eq!(&captures["version"], "1.2.3");
    }
}
