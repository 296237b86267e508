//! Format-native artifact registries: Deb (APT), RPM (yum/dnf), OSI (flat
//! files).
//!
//! Grounded on `registry/manager.py::RegistryManager` and
//! `registry/formats/__init__.py::Registry`. Each format's publish/query
//! logic shells out to that format's own host-side tooling (`reprepro`,
//! `createrepo_c`, `rpm`) directly with `duct::cmd`, the way `keyring.rs`
//! shells out to `gpg`/`gpg-agent` — these are host tools, not part of the
//! containerized format builder invocation (that lives in `builds.rs`).

pub mod deb;
pub mod osi;
pub mod rpm;

use std::path::{Path, PathBuf};

use snafu::Snafu;

use crate::artifacts::ArtifactVersion;
use crate::specifics::ArchMap;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unsupported registry format {format}"))]
    UnsupportedFormat { format: String },

    #[snafu(display("unknown distribution {distribution} in registry"))]
    UnknownDistribution { distribution: String },

    #[snafu(display("unknown derivative {derivative} for distribution {distribution}"))]
    UnknownDerivative {
        distribution: String,
        derivative: String,
    },

    #[snafu(display("artifact {artifact} already published with version {version} in {distribution}/{derivative}: refusing to republish"))]
    AlreadyPublished {
        artifact: String,
        version: String,
        distribution: String,
        derivative: String,
    },

    #[snafu(display("unable to run command {command}: {source}"))]
    Command {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("unable to find {what} for {artifact}"))]
    NotFound { what: String, artifact: String },

    #[snafu(display("unable to read {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to write {path:?}: {source}"))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(transparent)]
    Templates { source: crate::templates::Error },

    #[snafu(transparent)]
    Artifacts { source: crate::artifacts::Error },

    #[snafu(transparent)]
    Keyring { source: crate::keyring::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// `(name, architecture, version)`, per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryArtifact {
    pub name: String,
    pub architecture: String,
    pub version: String,
}

impl RegistryArtifact {
    pub fn new(name: impl Into<String>, architecture: impl Into<String>, version: impl Into<String>) -> Self {
        RegistryArtifact {
            name: name.into(),
            architecture: architecture.into(),
            version: version.into(),
        }
    }
}

/// `(version, author, date-epoch, changes)`, per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogEntry {
    pub version: String,
    pub author: String,
    pub date: i64,
    pub changes: Vec<String>,
}

/// Everything a format's `publish()` needs from the build that produced the
/// artifacts, without depending on `builds.rs`'s own types (registries are a
/// lower layer than the build pipeline, per `spec.md`'s C1-C10 dependency
/// order).
pub struct PublishContext<'a> {
    pub artifact: &'a str,
    pub distribution: &'a str,
    pub derivative: &'a str,
    /// Build workspace directory, where `*.changes`/`*.rpm`/`*.tar.*` live.
    pub place: &'a Path,
    /// Recursive derivative chain (most to least specific), used to order
    /// dependency resolution precedence.
    pub derivatives: &'a [String],
    /// Instance pipeline architectures, host architecture first.
    pub architectures: &'a [String],
    pub keyring_fingerprint: &'a str,
    pub keyring_homedir: &'a Path,
    pub instance_name: &'a str,
    pub registry_conf_dir: &'a Path,
}

/// Common behavior of a per-format registry, per `spec.md` §4.7.
pub trait Registry {
    fn format(&self) -> &str;
    fn path(&self) -> &Path;
    fn archmap(&self) -> &ArchMap;

    fn exists(&self) -> bool {
        self.path().exists()
    }

    fn distributions(&self) -> Result<Vec<String>>;
    fn derivatives(&self, distribution: &str) -> Result<Vec<String>>;
    fn publish(&self, ctx: &PublishContext) -> Result<()>;
    fn artifacts(&self, distribution: &str, derivative: &str) -> Result<Vec<RegistryArtifact>>;
    fn artifact_bins(
        &self,
        distribution: &str,
        derivative: &str,
        src_artifact: &str,
    ) -> Result<Vec<RegistryArtifact>>;
    fn artifact_src(
        &self,
        distribution: &str,
        derivative: &str,
        bin_artifact: &str,
    ) -> Result<Option<RegistryArtifact>>;
    fn source_version(
        &self,
        distribution: &str,
        derivative: &str,
        artifact: &str,
    ) -> Result<Option<ArtifactVersion>>;
    fn changelog(
        &self,
        distribution: &str,
        derivative: &str,
        architecture: &str,
        artifact: &str,
    ) -> Result<Vec<ChangelogEntry>>;
    fn delete_artifact(
        &self,
        distribution: &str,
        derivative: &str,
        artifact: &RegistryArtifact,
    ) -> Result<()>;

    /// Refuse to publish an identical `(distribution, derivative, name,
    /// version)` twice, ignoring `build`, per `spec.md` §3 and E3.
    fn check_not_already_published(
        &self,
        distribution: &str,
        derivative: &str,
        artifact: &str,
        version: &ArtifactVersion,
    ) -> Result<()> {
        if let Some(existing) = self.source_version(distribution, derivative, artifact)? {
            if &existing == version {
                return AlreadyPublishedSnafu {
                    artifact: artifact.to_string(),
                    version: version.full(),
                    distribution: distribution.to_string(),
                    derivative: derivative.to_string(),
                }
                .fail();
            }
        }
        Ok(())
    }
}

/// Owns the registry storage root and hands out per-format `Registry`
/// implementations, mirroring `RegistryManager`.
pub struct RegistryManager {
    storage: PathBuf,
    conf: PathBuf,
}

impl RegistryManager {
    pub fn new(storage: PathBuf, conf: PathBuf) -> Self {
        RegistryManager { storage, conf }
    }

    pub fn factory(&self, format: &str, instance_id: &str) -> Result<Box<dyn Registry>> {
        let instance_dir = self.storage.join(instance_id);
        match format {
            "deb" => Ok(Box::new(deb::RegistryDeb::new(instance_dir, self.conf.clone()))),
            "rpm" => Ok(Box::new(rpm::RegistryRpm::new(instance_dir))),
            "osi" => Ok(Box::new(osi::RegistryOsi::new(instance_dir))),
            other => UnsupportedFormatSnafu {
                format: other.to_string(),
            }
            .fail(),
        }
    }

    pub fn instances(&self) -> std::io::Result<Vec<String>> {
        if !self.storage.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.storage)? {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }

    pub fn formats(&self, instance_id: &str) -> std::io::Result<Vec<String>> {
        let dir = self.storage.join(instance_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_artifact_equality() {
        let a = RegistryArtifact::new("pkg", "amd64", "1.0-1");
        let b = RegistryArtifact::new("pkg", "amd64", "1.0-1");
        assert_eq!(a, b);
    }
}
