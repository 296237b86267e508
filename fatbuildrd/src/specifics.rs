//! Per-format architecture naming.
//!
//! Each packaging format has its own architecture vocabulary (Debian's
//! `amd64`/`arm64` vs. RPM's `x86_64`/`aarch64`). `ArchMap` translates
//! between Fatbuildr's normalized architecture names (matching
//! `uname -m`, e.g. `x86_64`) and a format's native names, plus the
//! directory name a format's tooling expects on disk for a given
//! architecture (only RPM repositories nest per-arch directories with a
//! different name than the native arch string, e.g. `src` packages live
//! under `SRPMS`).

use std::collections::HashMap;

pub struct ArchMap {
    format: String,
    native_by_normalized: HashMap<&'static str, &'static str>,
    normalized_by_native: HashMap<&'static str, &'static str>,
}

impl ArchMap {
    pub fn new(format: &str) -> Self {
        let pairs: &[(&str, &str)] = match format {
            "deb" => &[
                ("x86_64", "amd64"),
                ("aarch64", "arm64"),
                ("armv7l", "armhf"),
                ("i686", "i386"),
                ("noarch", "all"),
            ],
            _ => &[
                ("x86_64", "x86_64"),
                ("aarch64", "aarch64"),
                ("armv7l", "armv7hl"),
                ("i686", "i686"),
                ("noarch", "noarch"),
                ("src", "src"),
            ],
        };
        let mut native_by_normalized = HashMap::new();
        let mut normalized_by_native = HashMap::new();
        for (normalized, native) in pairs {
            native_by_normalized.insert(*normalized, *native);
            normalized_by_native.insert(*native, *normalized);
        }
        ArchMap {
            format: format.to_string(),
            native_by_normalized,
            normalized_by_native,
        }
    }

    /// Translate a normalized architecture to this format's native name.
    /// Unknown architectures pass through unmodified, so new architectures
    /// do not require a code change to be usable.
    pub fn native(&self, normalized: &str) -> String {
        self.native_by_normalized
            .get(normalized)
            .map(|s| s.to_string())
            .unwrap_or_else(|| normalized.to_string())
    }

    /// Translate a format-native architecture name back to normalized form.
    pub fn normalized(&self, native: &str) -> String {
        self.normalized_by_native
            .get(native)
            .map(|s| s.to_string())
            .unwrap_or_else(|| native.to_string())
    }

    /// Directory name used on disk for the given normalized architecture.
    /// RPM repositories nest source packages under a directory also named
    /// after the native arch in this implementation (matching
    /// `createrepo_c`'s own layout), so this currently mirrors `native`.
    pub fn nativedir(&self, normalized: &str) -> String {
        self.native(normalized)
    }

    pub fn format(&self) -> &str {
        &self.format
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deb_arch_roundtrip() {
        let map = ArchMap::new("deb");
        assert_eq!(map.native("x86_64"), "amd64");
        assert_eq!(map.normalized("amd64"), "x86_64");
    }

    #[test]
    fn rpm_arch_identity() {
        let map = ArchMap::new("rpm");
        assert_eq!(map.native("x86_64"), "x86_64");
    }

    #[test]
    fn unknown_arch_passthrough() {
        let map = ArchMap::new("deb");
        assert_eq!(map.native("riscv64"), "riscv64");
    }
}
