//! Maintainer-facing patch queue workflow.
//!
//! Grounded on `patches.py::PatchQueue`: extract the upstream tarball into a
//! scratch directory, turn it into a Git repository, replay the artifact's
//! existing patches as commits, drop the maintainer into an interactive
//! shell to make changes, then export the resulting commit history back to
//! patch files on disk.

use std::path::{Path, PathBuf};

use duct::cmd;
use snafu::{ResultExt, Snafu};

use crate::archive::{self, ArchiveFormat};
use crate::cleanup::CleanupRegistry;
use crate::git::{GitRepository, PatchesDir};
use crate::utils::{self, ChecksumFormat};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to create patch queue scratch directory: {source}"))]
    Scratch { source: std::io::Error },

    #[snafu(display("unable to create user cache directory {path:?}: {source}"))]
    Cache { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to remove patch queue scratch directory {path:?}: {source}"))]
    Remove { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to detect archive format of {path:?}: {source}"))]
    Format { path: PathBuf, source: archive::Error },

    #[snafu(display("unable to extract {path:?}: {source}"))]
    Extract { path: PathBuf, source: archive::Error },

    #[snafu(display("unable to launch subshell: {source}"))]
    Subshell { source: std::io::Error },

    #[snafu(transparent)]
    Download { source: utils::Error },

    #[snafu(transparent)]
    Git { source: crate::git::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where to obtain the upstream tarball a patch queue is built against.
pub enum TarballSource {
    /// Already materialized on disk (e.g. produced earlier in the same
    /// build by the client).
    Provided(PathBuf),
    /// Must be downloaded, with the given checksum verified once fetched.
    Download {
        url: String,
        filename: String,
        checksum_format: ChecksumFormat,
        checksum_value: String,
    },
}

pub struct PatchQueue {
    artifact_path: PathBuf,
    derivative: String,
    artifact: String,
    user: String,
    email: String,
    version: String,
    tarball: TarballSource,
}

impl PatchQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        artifact_path: PathBuf,
        derivative: impl Into<String>,
        artifact: impl Into<String>,
        user: impl Into<String>,
        email: impl Into<String>,
        version: impl Into<String>,
        tarball: TarballSource,
    ) -> Self {
        PatchQueue {
            artifact_path,
            derivative: derivative.into(),
            artifact: artifact.into(),
            user: user.into(),
            email: email.into(),
            version: version.into(),
            tarball,
        }
    }

    /// Run the full workflow: extract, import existing patches, optionally
    /// open an interactive shell, then export the updated patch queue.
    pub fn run(&self, cleanup: &CleanupRegistry, launch_subshell: bool) -> Result<()> {
        log::debug!("running patch queue for artifact {}", self.artifact);

        let tarball_path = match &self.tarball {
            TarballSource::Provided(path) => path.clone(),
            TarballSource::Download {
                url,
                filename,
                checksum_format,
                checksum_value,
            } => self.dl_tarball(url, filename, *checksum_format, checksum_value)?,
        };

        let tmpdir = tempfile::Builder::new()
            .prefix(&format!("fatbuildr-pq-{}-", self.artifact))
            .tempdir()
            .context(ScratchSnafu)?
            .into_path();
        cleanup.add_tmpdir(tmpdir.clone());
        log::debug!("created temporary directory {}", tmpdir.display());

        let format = ArchiveFormat::detect(&tarball_path).context(FormatSnafu { path: tarball_path.clone() })?;
        archive::safe_extract_tar(&tarball_path, &tmpdir, format, 0)
            .context(ExtractSnafu { path: tarball_path.clone() })?;
        let repo_path = tmpdir.join(archive::archive_subdir_name(&tarball_path));

        let git = GitRepository::init(&repo_path, &self.user, &self.email, None)?;

        let patches_dir = PatchesDir::new(&self.artifact_path, &self.version);
        git.import_patches(&patches_dir)?;

        if launch_subshell {
            self.launch_subshell(&repo_path)?;
        }

        git.export_queue(&patches_dir)?;

        log::debug!("removing temporary directory {}", tmpdir.display());
        std::fs::remove_dir_all(&tmpdir).context(RemoveSnafu { path: tmpdir.clone() })?;
        cleanup.del_tmpdir(&tmpdir);

        Ok(())
    }

    fn default_user_cache() -> PathBuf {
        if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
            PathBuf::from(xdg).join("fatbuildr")
        } else {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "~".to_string()))
                .join(".local")
                .join("fatbuildr")
        }
    }

    /// Download the tarball into the user's local cache, unless already
    /// present there, then verify its checksum.
    fn dl_tarball(
        &self,
        url: &str,
        filename: &str,
        checksum_format: ChecksumFormat,
        checksum_value: &str,
    ) -> Result<PathBuf> {
        let cache_dir = Self::default_user_cache();
        if !cache_dir.exists() {
            log::debug!("creating user cache directory {}", cache_dir.display());
            std::fs::create_dir_all(&cache_dir).context(CacheSnafu { path: cache_dir.clone() })?;
        }

        let tarball_path = cache_dir.join(filename);
        if !tarball_path.exists() {
            utils::dl_file(url, &tarball_path)?;
        }
        utils::verify_checksum(&tarball_path, checksum_format, checksum_value)?;
        Ok(tarball_path)
    }

    fn launch_subshell(&self, repo_path: &Path) -> Result<()> {
        log::info!(
            "\n\nWelcome to the Fatbuildr patch queue shell!\n\n  Artifact: {}\n  Derivative: {}\n  Version: {}\n\nPerform all the modifications in the Git repository and exit the shell when you are done.\n",
            self.artifact,
            self.derivative,
            self.version
        );
        cmd("/bin/bash", Vec::<String>::new())
            .dir(repo_path)
            .env("FATBUILDR_PQ", &self.artifact)
            .run()
            .context(SubshellSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_user_cache_respects_xdg_cache_home() {
        std::env::set_var("XDG_CACHE_HOME", "/tmp/xdg-cache-test");
        assert_eq!(
            PatchQueue::default_user_cache(),
            PathBuf::from("/tmp/xdg-cache-test/fatbuildr")
        );
        std::env::remove_var("XDG_CACHE_HOME");
    }
}
