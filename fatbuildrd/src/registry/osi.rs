//! Flat-file registry for OS images (mkosi outputs).
//!
//! Grounded on `registry/formats/osi.py::RegistryOsi`: no package-manager
//! tooling involved, just files copied under `<dist>/<derivative>/` plus a
//! detached checksum manifest, matching the way `images.rs` already treats
//! image artifacts as plain files on disk.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use snafu::ResultExt;

use crate::artifacts::ArtifactVersion;
use crate::specifics::ArchMap;

use super::{
    ChangelogEntry, NotFoundSnafu, PublishContext, ReadSnafu, Registry, RegistryArtifact, Result,
    WriteSnafu,
};

lazy_static! {
    /// `<name>_<version>.<arch>` (before the extension), matching the
    /// original's `re.match(r"(.+)_(.+)\.(.+)", stem)`.
    static ref FILENAME_RE: Regex = Regex::new(r"^(?P<name>.+)_(?P<version>.+)\.(?P<arch>[^.]+)$").unwrap();
}

pub struct RegistryOsi {
    path: PathBuf,
    archmap: ArchMap,
}

impl RegistryOsi {
    pub fn new(instance_dir: PathBuf) -> Self {
        RegistryOsi {
            path: instance_dir.join("osi"),
            archmap: ArchMap::new("osi"),
        }
    }

    fn deriv_path(&self, distribution: &str, derivative: &str) -> PathBuf {
        self.path.join(distribution).join(derivative)
    }

    fn entries(&self, distribution: &str, derivative: &str) -> Result<Vec<(String, String, String, PathBuf)>> {
        let path = self.deriv_path(distribution, derivative);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for entry in std::fs::read_dir(&path).context(ReadSnafu { path: path.clone() })? {
            let entry = entry.context(ReadSnafu { path: path.clone() })?;
            let entry_path = entry.path();
            let Some(filename) = entry_path.file_name().and_then(|f| f.to_str()) else { continue };
            if filename == "SHA256SUMS" || filename == "SHA256SUMS.gpg" || filename.ends_with(".manifest") {
                continue;
            }
            let stem = entry_path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
            let Some(captures) = FILENAME_RE.captures(stem) else { continue };
            result.push((
                captures["name"].to_string(),
                self.archmap.normalized(&captures["arch"]),
                captures["version"].to_string(),
                entry_path,
            ));
        }
        Ok(result)
    }
}

impl Registry for RegistryOsi {
    fn format(&self) -> &str {
        "osi"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn archmap(&self) -> &ArchMap {
        &self.archmap
    }

    fn distributions(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Ok(std::fs::read_dir(&self.path)
            .context(ReadSnafu { path: self.path.clone() })?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect())
    }

    fn derivatives(&self, distribution: &str) -> Result<Vec<String>> {
        let path = self.path.join(distribution);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(std::fs::read_dir(&path)
            .context(ReadSnafu { path: path.clone() })?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect())
    }

    fn publish(&self, ctx: &PublishContext) -> Result<()> {
        let deriv_path = self.deriv_path(ctx.distribution, ctx.derivative);
        if !deriv_path.exists() {
            log::debug!("creating osi registry directory {deriv_path:?}");
            std::fs::create_dir_all(&deriv_path).context(WriteSnafu { path: deriv_path.clone() })?;
        }

        for entry in std::fs::read_dir(ctx.place).context(ReadSnafu { path: ctx.place.to_path_buf() })? {
            let entry = entry.context(ReadSnafu { path: ctx.place.to_path_buf() })?;
            let path = entry.path();
            let Some(filename) = path.file_name().and_then(|f| f.to_str()) else { continue };
            let is_image = path.is_file()
                && (filename.ends_with(".tar.xz")
                    || filename.ends_with(".tar.gz")
                    || filename.ends_with(".raw")
                    || filename == "SHA256SUMS"
                    || filename == "SHA256SUMS.gpg"
                    || filename.ends_with(".manifest"));
            if !is_image {
                continue;
            }
            log::debug!("copying {path:?} to {deriv_path:?}");
            std::fs::copy(&path, deriv_path.join(filename)).context(WriteSnafu { path: deriv_path.clone() })?;
        }
        Ok(())
    }

    fn artifacts(&self, distribution: &str, derivative: &str) -> Result<Vec<RegistryArtifact>> {
        Ok(self
            .entries(distribution, derivative)?
            .into_iter()
            .map(|(name, arch, version, _)| RegistryArtifact::new(name, arch, version))
            .collect())
    }

    fn artifact_bins(&self, distribution: &str, derivative: &str, src_artifact: &str) -> Result<Vec<RegistryArtifact>> {
        // OS images have no source/binary split: the image itself is both.
        Ok(self
            .entries(distribution, derivative)?
            .into_iter()
            .filter(|(name, ..)| name == src_artifact)
            .map(|(name, arch, version, _)| RegistryArtifact::new(name, arch, version))
            .collect())
    }

    fn artifact_src(&self, distribution: &str, derivative: &str, bin_artifact: &str) -> Result<Option<RegistryArtifact>> {
        Ok(self
            .entries(distribution, derivative)?
            .into_iter()
            .find(|(name, ..)| name == bin_artifact)
            .map(|(name, arch, version, _)| RegistryArtifact::new(name, arch, version)))
    }

    fn source_version(&self, distribution: &str, derivative: &str, artifact: &str) -> Result<Option<ArtifactVersion>> {
        for (name, _, version, _) in self.entries(distribution, derivative)? {
            if name == artifact {
                return Ok(Some(ArtifactVersion::parse(&version)?));
            }
        }
        Ok(None)
    }

    fn changelog(&self, _distribution: &str, _derivative: &str, _architecture: &str, _artifact: &str) -> Result<Vec<ChangelogEntry>> {
        Ok(Vec::new())
    }

    fn delete_artifact(&self, distribution: &str, derivative: &str, artifact: &RegistryArtifact) -> Result<()> {
        let mut found = false;
        for (name, arch, version, path) in self.entries(distribution, derivative)? {
            if name == artifact.name && arch == artifact.architecture && version == artifact.version {
                found = true;
                log::info!("removing osi artifact {path:?}");
                std::fs::remove_file(&path).context(ReadSnafu { path: path.clone() })?;
                let manifest = path.with_extension("manifest");
                if manifest.exists() {
                    std::fs::remove_file(&manifest).context(ReadSnafu { path: manifest })?;
                }
            }
        }
        if !found {
            return NotFoundSnafu {
                what: "osi artifact".to_string(),
                artifact: artifact.name.clone(),
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
    fn filename_regex_splits_name_version_arch() {
        let captures = FILENAME_RE.captures("myimage_1.2.3.x86_64").unwrap();
        assert_eq!(&captures["name"], "myimage");
        assert_eq!(&captures["version"], "1.2.3");
        assert_eq!(&captures["arch"], "x86_64");
    }

    #[test]
    fn ignores_sha256sums_and_manifest() {
        assert!(FILENAME_RE.captures("SHA256SUMS").is_none());
    }
}
