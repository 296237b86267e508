//! Deb (APT) registry, backed by a `reprepro` tree.
//!
//! Grounded on `registry/formats/deb.py::RegistryDeb`. `reprepro` owns the
//! whole on-disk tree (`conf/`, `dists/`, `pool/`); this module only ever
//! shells out to it and parses its `--list-format` output, never touching
//! the pool layout directly.

use std::io::Read as _;
use std::path::{Path, PathBuf};

use duct::cmd;
use lazy_static::lazy_static;
use regex::Regex;
use snafu::ResultExt;

use crate::archive::{self, ArchiveFormat};
use crate::specifics::ArchMap;
use crate::templates::{TemplateContext, Templeter};

use super::{
    ArtifactVersion, ChangelogEntry, CommandSnafu, NotFoundSnafu, PublishContext, ReadSnafu,
    Registry, RegistryArtifact, Result, WriteSnafu,
};

pub struct RegistryDeb {
    path: PathBuf,
    archmap: ArchMap,
}

impl RegistryDeb {
    pub fn new(instance_dir: PathBuf, _conf_dir: PathBuf) -> Self {
        RegistryDeb {
            path: instance_dir.join("deb"),
            archmap: ArchMap::new("deb"),
        }
    }

    fn dists_conf(&self) -> PathBuf {
        self.path().join("conf").join("distributions")
    }

    fn components(&self) -> Vec<String> {
        let pool = self.path().join("pool");
        if !pool.exists() {
            return Vec::new();
        }
        std::fs::read_dir(pool)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reprepro(&self, args: &[String]) -> Result<String> {
        let mut full = vec!["--basedir".to_string(), self.path().display().to_string()];
        full.extend(args.iter().cloned());
        let output = cmd("reprepro", &full)
            .stdout_capture()
            .stderr_capture()
            .run()
            .context(CommandSnafu {
                command: format!("reprepro {}", full.join(" ")),
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn reprepro_logged(&self, args: &[String], extra_env: &[(&str, &str)]) -> Result<()> {
        let mut full = vec![
            "--verbose".to_string(),
            "--basedir".to_string(),
            self.path().display().to_string(),
        ];
        full.extend(args.iter().cloned());
        let mut command = cmd("reprepro", &full);
        for (k, v) in extra_env {
            command = command.env(k, v);
        }
        let output = command.stdout_capture().stderr_capture().unchecked().run().context(CommandSnafu {
            command: format!("reprepro {}", full.join(" ")),
        })?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            log::debug!("{line}");
        }
        if !output.status.success() {
            return Err(super::Error::Command {
                command: format!("reprepro {}", full.join(" ")),
                source: std::io::Error::other("reprepro exited with failure"),
            });
        }
        Ok(())
    }

    fn package_dsc_path(&self, distribution: &str, derivative: &str, src_artifact: &str) -> Result<PathBuf> {
        let output = self.reprepro(&[
            "--component".to_string(),
            derivative.to_string(),
            "--list-format".to_string(),
            "${$architecture}|${$fullfilename}\n".to_string(),
            "list".to_string(),
            distribution.to_string(),
            src_artifact.to_string(),
        ])?;
        for line in output.trim().lines() {
            if let Some((locarch, path)) = line.split_once('|') {
                if locarch == "source" {
                    return Ok(PathBuf::from(path));
                }
            }
        }
        NotFoundSnafu {
            what: "dsc path".to_string(),
            artifact: src_artifact.to_string(),
        }
        .fail()
    }

    fn package_deb_path(
        &self,
        distribution: &str,
        derivative: &str,
        architecture: &str,
        bin_artifact: &str,
    ) -> Result<PathBuf> {
        let output = self.reprepro(&[
            "--component".to_string(),
            derivative.to_string(),
            "--list-format".to_string(),
            "${Architecture}|${$fullfilename}\n".to_string(),
            "list".to_string(),
            distribution.to_string(),
            bin_artifact.to_string(),
        ])?;
        let native = self.archmap.native(architecture);
        for line in output.trim().lines() {
            if let Some((arch, path)) = line.split_once('|') {
                if arch == native {
                    return Ok(PathBuf::from(path));
                }
            }
        }
        NotFoundSnafu {
            what: "deb path".to_string(),
            artifact: bin_artifact.to_string(),
        }
        .fail()
    }

    /// Parses a `.dsc` file to find the path of the archive carrying the
    /// Debian packaging (i.e. not the `.orig.` upstream tarball).
    fn debian_archive_path(&self, dsc_path: &Path) -> Result<PathBuf> {
        let content = std::fs::read_to_string(dsc_path).context(ReadSnafu {
            path: dsc_path.to_path_buf(),
        })?;
        let mut in_files = false;
        for line in content.lines() {
            if line.starts_with("Files:") {
                in_files = true;
                continue;
            }
            if !in_files {
                continue;
            }
            if !line.starts_with(' ') {
                break;
            }
            // " <md5> <size> <name>"
            if let Some(name) = line.split_whitespace().nth(2) {
                if !name.contains(".orig.") {
                    return Ok(dsc_path.parent().unwrap_or(Path::new(".")).join(name));
                }
            }
        }
        NotFoundSnafu {
            what: "debian archive".to_string(),
            artifact: dsc_path.display().to_string(),
        }
        .fail()
    }

    fn extract_archive_changelog(&self, arch_path: &Path) -> Result<Vec<u8>> {
        let format = archive::ArchiveFormat::detect(arch_path).unwrap_or(ArchiveFormat::TarXz);
        archive::read_tar_member(arch_path, "debian/changelog", format).map_err(|_| {
            super::Error::NotFound {
                what: "debian/changelog".to_string(),
                artifact: arch_path.display().to_string(),
            }
        })
    }

    fn source_changelog(&self, distribution: &str, derivative: &str, src_artifact: &str) -> Result<Vec<u8>> {
        let dsc_path = self.package_dsc_path(distribution, derivative, src_artifact)?;
        let arch_path = self.debian_archive_path(&dsc_path)?;
        self.extract_archive_changelog(&arch_path)
    }

    /// Extracts `debian/changelog` from a `.deb`'s data tarball via
    /// `dpkg-deb`, the way the original used `python-debian`'s
    /// `DebFile(...).changelog()`.
    fn binary_changelog(&self, distribution: &str, derivative: &str, architecture: &str, bin_artifact: &str) -> Result<Vec<u8>> {
        let deb_path = self.package_deb_path(distribution, derivative, architecture, bin_artifact)?;
        let output = cmd(
            "dpkg-deb",
            vec!["--fsys-tarfile".to_string(), deb_path.display().to_string()],
        )
        .stdout_capture()
        .run()
        .context(CommandSnafu {
            command: "dpkg-deb --fsys-tarfile".to_string(),
        })?;
        let mut archive = tar::Archive::new(&output.stdout[..]);
        for entry in archive.entries().context(ReadSnafu { path: deb_path.clone() })? {
            let mut entry = entry.context(ReadSnafu { path: deb_path.clone() })?;
            let path = entry.path().context(ReadSnafu { path: deb_path.clone() })?.to_path_buf();
            if path.ends_with("changelog.Debian.gz") || path.ends_with("changelog.gz") {
                let mut compressed = Vec::new();
                entry.read_to_end(&mut compressed).context(ReadSnafu { path: deb_path.clone() })?;
                let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
                let mut text = Vec::new();
                decoder.read_to_end(&mut text).context(ReadSnafu { path: deb_path.clone() })?;
                return Ok(text);
            }
        }
        NotFoundSnafu {
            what: "debian changelog".to_string(),
            artifact: bin_artifact.to_string(),
        }
        .fail()
    }
}

impl Registry for RegistryDeb {
    fn format(&self) -> &str {
        "deb"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn archmap(&self) -> &ArchMap {
        &self.archmap
    }

    fn distributions(&self) -> Result<Vec<String>> {
        let dists_path = self.path().join("dists");
        if !dists_path.exists() {
            return Ok(Vec::new());
        }
        Ok(std::fs::read_dir(dists_path)
            .context(ReadSnafu { path: self.path().to_path_buf() })?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect())
    }

    fn derivatives(&self, _distribution: &str) -> Result<Vec<String>> {
        Ok(self.components())
    }

    fn publish(&self, ctx: &PublishContext) -> Result<()> {
        log::info!(
            "publishing deb packages for {} in distribution {}",
            ctx.artifact,
            ctx.distribution
        );

        let dists_tpl_path = ctx.registry_conf_dir.join("apt").join("distributions.j2");
        let dists_conf = self.dists_conf();
        if let Some(parent) = dists_conf.parent() {
            std::fs::create_dir_all(parent).context(WriteSnafu { path: parent.to_path_buf() })?;
        }

        let mut distributions: Vec<String> = self.distributions()?;
        if !distributions.contains(&ctx.distribution.to_string()) {
            distributions.push(ctx.distribution.to_string());
        }
        let mut components = self.components();
        for d in ctx.derivatives {
            if !components.contains(d) {
                components.push(d.clone());
            }
        }
        let architectures: Vec<String> = ctx.architectures.iter().map(|a| self.archmap.native(a)).collect();

        let mut tctx = TemplateContext::new();
        tctx.set("distributions", distributions);
        tctx.set("architectures", architectures);
        tctx.set("components", components);
        tctx.set("key", ctx.keyring_fingerprint);
        tctx.set("instance", ctx.instance_name);
        let rendered = Templeter::new()
            .frender(&dists_tpl_path, &tctx.into_map())
            .context(super::TemplatesSnafu)?;
        std::fs::write(&dists_conf, rendered).context(WriteSnafu { path: dists_conf.clone() })?;

        for entry in std::fs::read_dir(ctx.place).context(ReadSnafu { path: ctx.place.to_path_buf() })? {
            let entry = entry.context(ReadSnafu { path: ctx.place.to_path_buf() })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".changes") || name.ends_with("_source.changes") {
                continue;
            }
            log::debug!("publishing deb changes file {name}");
            self.reprepro_logged(
                &[
                    "--component".to_string(),
                    ctx.derivative.to_string(),
                    "include".to_string(),
                    ctx.distribution.to_string(),
                    entry.path().display().to_string(),
                ],
                &[("GNUPGHOME", &ctx.keyring_homedir.display().to_string())],
            )?;
        }
        Ok(())
    }

    fn artifacts(&self, distribution: &str, derivative: &str) -> Result<Vec<RegistryArtifact>> {
        if !self.dists_conf().exists() {
            return Ok(Vec::new());
        }
        let output = self.reprepro(&[
            "--component".to_string(),
            derivative.to_string(),
            "--list-format".to_string(),
            "${package}|${Architecture}|${$architecture}|${version}\n".to_string(),
            "list".to_string(),
            distribution.to_string(),
        ])?;
        let mut artifacts = Vec::new();
        for line in output.trim().lines() {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() != 4 {
                continue;
            }
            let (name, arch, locarch, version) = (parts[0], parts[1], parts[2], parts[3]);
            let normalized = if locarch == "source" {
                "source".to_string()
            } else {
                self.archmap.normalized(arch)
            };
            let artifact = RegistryArtifact::new(name, normalized, version);
            if !artifacts.contains(&artifact) {
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }

    fn artifact_bins(&self, distribution: &str, derivative: &str, src_artifact: &str) -> Result<Vec<RegistryArtifact>> {
        let output = self.reprepro(&[
            "--component".to_string(),
            derivative.to_string(),
            "--list-format".to_string(),
            "${package}|${Architecture}|${$architecture}|${$source}|${version}\n".to_string(),
            "list".to_string(),
            distribution.to_string(),
        ])?;
        let mut artifacts = Vec::new();
        for line in output.trim().lines() {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() != 5 {
                continue;
            }
            let (name, arch, locarch, source, version) = (parts[0], parts[1], parts[2], parts[3], parts[4]);
            if locarch == "source" || source != src_artifact {
                continue;
            }
            let artifact = RegistryArtifact::new(name, self.archmap.normalized(arch), version);
            if !artifacts.contains(&artifact) {
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }

    fn artifact_src(&self, distribution: &str, derivative: &str, bin_artifact: &str) -> Result<Option<RegistryArtifact>> {
        let output = self.reprepro(&[
            "--component".to_string(),
            derivative.to_string(),
            "--list-format".to_string(),
            "${$architecture}|${$source}|${version}\n".to_string(),
            "list".to_string(),
            distribution.to_string(),
            bin_artifact.to_string(),
        ])?;
        for line in output.trim().lines() {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() != 3 || parts[0] == "source" {
                continue;
            }
            return Ok(Some(RegistryArtifact::new(parts[1], "src", parts[2])));
        }
        Ok(None)
    }

    fn source_version(&self, distribution: &str, derivative: &str, artifact: &str) -> Result<Option<ArtifactVersion>> {
        if !self.dists_conf().exists() || !self.distributions()?.contains(&distribution.to_string()) {
            return Ok(None);
        }
        if !self.derivatives(distribution)?.contains(&derivative.to_string()) {
            return Ok(None);
        }
        let output = self.reprepro(&[
            "--component".to_string(),
            derivative.to_string(),
            "--list-format".to_string(),
            "${$architecture}|${version}\n".to_string(),
            "list".to_string(),
            distribution.to_string(),
            artifact.to_string(),
        ])?;
        for line in output.trim().lines() {
            if let Some((locarch, version)) = line.split_once('|') {
                if locarch == "source" {
                    return Ok(Some(ArtifactVersion::parse(version)?));
                }
            }
        }
        Ok(None)
    }

    fn changelog(&self, distribution: &str, derivative: &str, architecture: &str, artifact: &str) -> Result<Vec<ChangelogEntry>> {
        let raw = if architecture == "src" {
            self.source_changelog(distribution, derivative, artifact)?
        } else {
            self.binary_changelog(distribution, derivative, architecture, artifact)?
        };
        Ok(DebChangelog::parse(&String::from_utf8_lossy(&raw)))
    }

    fn delete_artifact(&self, distribution: &str, derivative: &str, artifact: &RegistryArtifact) -> Result<()> {
        let archs: Vec<String> = if artifact.architecture == "all" {
            vec!["source".to_string(), "*".to_string()]
        } else {
            vec![self.archmap.native(&artifact.architecture)]
        };
        for arch in archs {
            self.reprepro_logged(
                &[
                    "--component".to_string(),
                    derivative.to_string(),
                    "--architecture".to_string(),
                    arch,
                    "remove".to_string(),
                    distribution.to_string(),
                    artifact.name.clone(),
                ],
                &[],
            )?;
        }
        Ok(())
    }
}

lazy_static! {
    static ref CHANGELOG_HEADER_RE: Regex =
        Regex::new(r"^(?P<source>\S+) \((?P<version>[^)]+)\) .*$").unwrap();
    static ref CHANGELOG_TRAILER_RE: Regex =
        Regex::new(r"^ -- (?P<author>.+)  (?P<date>.+)$").unwrap();
}

/// Minimal parser for the standard `dpkg-parsechangelog` text format,
/// grounded on the shape `DebChangelog(...).entries()` exposed in the
/// original — entries separated by a trailer line, bullet lines collected
/// as `changes`.
struct DebChangelog;

impl DebChangelog {
    fn parse(text: &str) -> Vec<ChangelogEntry> {
        let mut entries = Vec::new();
        let mut version = None;
        let mut changes: Vec<String> = Vec::new();
        for line in text.lines() {
            if let Some(caps) = CHANGELOG_HEADER_RE.captures(line) {
                version = Some(caps["version"].to_string());
                changes.clear();
                continue;
            }
            if let Some(caps) = CHANGELOG_TRAILER_RE.captures(line) {
                if let Some(v) = version.take() {
                    let date = chrono::DateTime::parse_from_rfc2822(caps["date"].trim())
                        .map(|d| d.timestamp())
                        .unwrap_or(0);
                    entries.push(ChangelogEntry {
                        version: v,
                        author: caps["author"].to_string(),
                        date,
                        changes: changes.clone(),
                    });
                }
                continue;
            }
            let trimmed = line.trim();
            if trimmed.starts_with('*') || trimmed.starts_with('-') {
                changes.push(trimmed.to_string());
            }
        }
        entries
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_standard_changelog_entry() {
        let text = "pkg (1.0-1) unstable; urgency=medium\n\n  * Initial release\n\n -- A Maintainer <a@example.org>  Mon, 01 Jan 2024 00:00:00 +0000\n";
        let entries = DebChangelog::parse(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, "1.0-1");
        assert_eq!(entries[0].author, "A Maintainer <a@example.org>");
        assert_eq!(entries[0].changes, vec!["* Initial release".to_string()]);
    }
}
