//! Container command execution via `systemd-nspawn`.
//!
//! Grounded on `containers.py::ContainerRunner`, generalized the way
//! `tools/buildsys/src/builder.rs` wraps `docker`: build the argument vector,
//! shell out with `duct::cmd`, and surface a distinguishable error if the
//! child exits non-zero.

use std::path::{Path, PathBuf};

use duct::cmd;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to start systemd-nspawn: {source}"))]
    Start { source: std::io::Error },

    #[snafu(display("systemd-nspawn in {image:?} exited with failure running {command}"))]
    Failed { image: PathBuf, command: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Arguments shared by every invocation against a container image.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub opts: Vec<String>,
    pub binds: Vec<PathBuf>,
    pub chdir: Option<PathBuf>,
    pub envs: Vec<String>,
}

pub struct ContainerRunner {
    init_opts: Vec<String>,
}

impl ContainerRunner {
    pub fn new(init_opts: &str) -> Self {
        ContainerRunner {
            init_opts: init_opts.split(' ').filter(|s| !s.is_empty()).map(String::from).collect(),
        }
    }

    /// Run the image's init sequence (used to boot the container once so
    /// systemd settles services before the build proper starts).
    pub fn run_init(&self, image: &Path, runcmd: &[String]) -> Result<()> {
        self.run(
            image,
            runcmd,
            &RunOptions {
                opts: self.init_opts.clone(),
                ..Default::default()
            },
        )
    }

    /// Generic fully-featured invocation of `systemd-nspawn --directory
    /// <image> ...`.
    pub fn run(&self, image: &Path, runcmd: &[String], options: &RunOptions) -> Result<()> {
        let mut args: Vec<String> = vec![
            "--directory".to_string(),
            image.display().to_string(),
        ];
        args.extend(options.opts.iter().cloned());
        for bind in &options.binds {
            args.push("--bind".to_string());
            args.push(bind.display().to_string());
        }
        if let Some(chdir) = &options.chdir {
            args.push("--chdir".to_string());
            args.push(chdir.display().to_string());
        }
        for env in &options.envs {
            args.push("--setenv".to_string());
            args.push(env.clone());
        }
        args.extend(runcmd.iter().cloned());

        log::debug!("running command: systemd-nspawn {}", args.join(" "));

        let status = cmd("systemd-nspawn", &args)
            .run()
            .context(StartSnafu)?
            .status;

        if !status.success() {
            return FailedSnafu {
                image: image.to_path_buf(),
                command: runcmd.join(" "),
            }
            .fail();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_options_build_expected_flags() {
        let runner = ContainerRunner::new("--quiet --ephemeral");
        assert_eq!(runner.init_opts, vec!["--quiet", "--ephemeral"]);
    }
}
