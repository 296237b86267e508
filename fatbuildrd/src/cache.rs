//! Per-instance, per-artifact tarball cache.
//!
//! Grounded on `cache.py::CacheArtefact`: caches the downloaded upstream
//! source tarball for an artifact so repeated builds of the same version do
//! not re-fetch it.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    instance_dir: PathBuf,
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(cache_root: &Path, instance_id: &str, artifact: &str) -> Self {
        let instance_dir = cache_root.join(instance_id);
        let dir = instance_dir.join(artifact);
        ArtifactCache { instance_dir, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tarball(&self, tarball_filename: &str) -> PathBuf {
        self.dir.join(tarball_filename)
    }

    pub fn has_tarball(&self, tarball_filename: &str) -> bool {
        self.tarball(tarball_filename).exists()
    }

    /// Create the instance and artifact cache directories if missing,
    /// umask-agnostically (mode 0755 regardless of the process umask).
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.instance_dir, &self.dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
                }
            }
        }
        Ok(())
    }
}

/// Owns the cache root directory for an instance, handing out per-artifact
/// `ArtifactCache` handles.
pub struct CacheManager {
    root: PathBuf,
    instance_id: String,
}

impl CacheManager {
    pub fn new(root: PathBuf, instance_id: String) -> Self {
        CacheManager { root, instance_id }
    }

    pub fn artifact(&self, artifact: &str) -> ArtifactCache {
        ArtifactCache::new(&self.root, &self.instance_id, artifact)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ensure_creates_nested_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = CacheManager::new(tmp.path().to_path_buf(), "inst1".to_string());
        let cache = mgr.artifact("hello");
        cache.ensure().unwrap();
        assert!(cache.dir().is_dir());
        assert!(!cache.has_tarball("hello-1.0.tar.xz"));
    }
}
