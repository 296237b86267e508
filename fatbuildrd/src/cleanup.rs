//! Registry of temporary directories to remove before the process exits.
//!
//! Grounded on `cleanup.py::CleanupRegistry`. The original is a process-wide
//! singleton backed by a class-level list; here it is an explicit
//! `Arc<Mutex<..>>`-backed registry so ownership stays visible at call
//! sites instead of relying on global mutable state, while keeping the
//! same register/unregister/clean-on-exit shape.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    tmpdirs: Arc<Mutex<Vec<PathBuf>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tmpdir(&self, tmpdir: PathBuf) {
        debug!("registering tmpdir {}", tmpdir.display());
        self.tmpdirs.lock().unwrap().push(tmpdir);
    }

    pub fn del_tmpdir(&self, tmpdir: &PathBuf) {
        debug!("unregistering tmpdir {}", tmpdir.display());
        self.tmpdirs.lock().unwrap().retain(|d| d != tmpdir);
    }

    /// Remove every still-registered temporary directory. Called on normal
    /// shutdown and from a signal handler on interruption.
    pub fn clean(&self) {
        for dir in self.tmpdirs.lock().unwrap().iter() {
            if dir.exists() {
                debug!("removing temporary directory {}", dir.display());
                if let Err(err) = std::fs::remove_dir_all(dir) {
                    warn!("failed to remove temporary directory {}: {err}", dir.display());
                }
            } else {
                warn!(
                    "temporary directory {} registered for removal does not exist",
                    dir.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registers_and_cleans_tmpdir() {
        let registry = CleanupRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("child");
        std::fs::create_dir(&path).unwrap();
        registry.add_tmpdir(path.clone());
        registry.clean();
        assert!(!path.exists());
    }

    #[test]
    fn unregister_skips_cleanup() {
        let registry = CleanupRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("child");
        std::fs::create_dir(&path).unwrap();
        registry.add_tmpdir(path.clone());
        registry.del_tmpdir(&path);
        registry.clean();
        assert!(path.exists());
    }
}
