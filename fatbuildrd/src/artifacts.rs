//! Artifact definitions: `meta.yml` parsing and the version grammar.
//!
//! Grounded on `artifact.py` (`ArtifactDefs`/`ArtifactFormatDefs`/
//! `ArtifactDebDefs`/`ArtifactRpmDefs`/`ArtifactOsiDefs`/
//! `ArtifactDefsFactory`) and `registry/formats/__init__.py::ArtifactVersion`.
//! `ArtifactVersion` is kept here rather than under `registry/` since both
//! the build pipeline and the registry layer depend on it equally, and this
//! module is the one both already depend on for `ArtifactDefs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::templates::{TemplateContext, Templeter};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to read artifact definitions {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to parse artifact definitions {path:?}: {source}"))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("unable to parse version {value:?}"))]
    InvalidVersion { value: String },

    #[snafu(display("checksum of version {version} not found in artifact definition"))]
    NoChecksum { version: String },

    #[snafu(display("version not defined for derivative {derivative}"))]
    NoVersion { derivative: String },

    #[snafu(display("release not defined for format {format}"))]
    NoRelease { format: String },

    #[snafu(display("tarball not defined in artifact definition"))]
    NoTarball,

    #[snafu(display("artifact definition format {format} is not supported"))]
    UnsupportedFormat { format: String },

    #[snafu(display("unable to read {path:?}: {source}"))]
    ReadCheck {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(transparent)]
    Render { source: crate::templates::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"^(?P<main>.+)-(?P<release>.+)$").unwrap();
    static ref RELEASE_RE: Regex =
        Regex::new(r"^(?P<release>.+?)(\.(?P<dist>\w+))?(\+build(?P<build>\d+))?$").unwrap();
}

/// Parsed `main-release[.dist][+buildN]` version grammar, per `spec.md` §6.4.
/// Equality ignores `build`, matching the original's use of version equality
/// for republish-protection checks (E3): two builds that only differ by
/// build number are considered the same published artifact.
#[derive(Debug, Clone)]
pub struct ArtifactVersion {
    pub main: String,
    pub release: String,
    pub dist: Option<String>,
    pub build: i64,
}

impl ArtifactVersion {
    pub fn parse(value: &str) -> Result<Self> {
        let version_caps = VERSION_RE.captures(value).context(InvalidVersionSnafu {
            value: value.to_string(),
        })?;
        let main = version_caps["main"].to_string();
        let release_part = &version_caps["release"];
        let release_caps = RELEASE_RE
            .captures(release_part)
            .context(InvalidVersionSnafu {
                value: value.to_string(),
            })?;
        let release = release_caps["release"].to_string();
        let dist = release_caps.name("dist").map(|m| m.as_str().to_string());
        let build = release_caps
            .name("build")
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(-1);
        Ok(ArtifactVersion {
            main,
            release,
            dist,
            build,
        })
    }

    /// First numeric component of `main`, e.g. `major("1.2.3") == 1`.
    pub fn major(&self) -> Option<i64> {
        self.main.split('.').next()?.parse().ok()
    }

    pub fn fullrelease(&self) -> String {
        let mut result = self.release.clone();
        if let Some(dist) = &self.dist {
            result.push('.');
            result.push_str(dist);
        }
        if self.build >= 0 {
            result.push_str(&format!("+build{}", self.build));
        }
        result
    }

    pub fn full(&self) -> String {
        format!("{}-{}", self.main, self.fullrelease())
    }
}

impl PartialEq for ArtifactVersion {
    /// Ignores `build`, per `spec.md` §3 `ArtifactVersion` invariant.
    fn eq(&self, other: &Self) -> bool {
        self.main == other.main && self.release == other.release && self.dist == other.dist
    }
}
impl Eq for ArtifactVersion {}

impl std::fmt::Display for ArtifactVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FormatMeta {
    release: serde_yaml::Value,
    #[serde(default)]
    buildargs: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MetaYml {
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    versions: HashMap<String, serde_yaml::Value>,
    tarball: Option<String>,
    #[serde(default)]
    checksums: HashMap<String, HashMap<String, String>>,
    #[serde(flatten)]
    formats: HashMap<String, serde_yaml::Value>,
}

/// Parsed `meta.yml` of one artifact, before per-format specialization.
#[derive(Debug, Clone)]
pub struct ArtifactDefs {
    place: PathBuf,
    artifact: String,
    meta: MetaYml,
}

impl ArtifactDefs {
    pub fn load(place: &Path, artifact: &str) -> Result<Self> {
        let path = place.join("meta.yml");
        let content = std::fs::read_to_string(&path).context(ReadSnafu { path: path.clone() })?;
        let meta: MetaYml = serde_yaml::from_str(&content).context(ParseSnafu { path })?;
        Ok(ArtifactDefs {
            place: place.to_path_buf(),
            artifact: artifact.to_string(),
            meta,
        })
    }

    pub fn has_tarball(&self) -> bool {
        self.meta.tarball.is_some()
    }

    /// All `meta.yml` top-level keys that are not the reserved
    /// `version`/`versions`/`tarball`/`checksums`, i.e. the per-format
    /// sections actually present for this artifact.
    pub fn supported_formats(&self) -> Vec<String> {
        self.meta.formats.keys().cloned().collect()
    }

    pub fn derivatives(&self) -> Vec<String> {
        if self.meta.versions.is_empty() {
            vec!["main".to_string()]
        } else {
            self.meta.versions.keys().cloned().collect()
        }
    }

    pub fn version(&self, derivative: &str) -> Result<String> {
        if derivative == "main" {
            if let Some(v) = &self.meta.version {
                return Ok(yaml_to_string(v));
            }
        }
        self.meta
            .versions
            .get(derivative)
            .map(yaml_to_string)
            .context(NoVersionSnafu {
                derivative: derivative.to_string(),
            })
    }

    pub fn checksum_format(&self, derivative: &str) -> Result<String> {
        let version = self.version(derivative)?;
        let entry = self.meta.checksums.get(&version).context(NoChecksumSnafu {
            version: version.clone(),
        })?;
        // Pick up the first declared format, the way the original's
        // `list(...keys())[0]` did on Python's insertion-ordered dict.
        entry
            .keys()
            .next()
            .cloned()
            .context(NoChecksumSnafu { version })
    }

    pub fn checksum_value(&self, derivative: &str) -> Result<String> {
        let version = self.version(derivative)?;
        let format = self.checksum_format(derivative)?;
        Ok(self.meta.checksums[&version][&format].clone())
    }

    /// Renders `meta.tarball` against `version`, splitting off the
    /// `!renamed-file` suffix if present.
    fn tarball_rendered(&self, version: &str) -> Result<String> {
        let tarball = self.meta.tarball.as_deref().context(NoTarballSnafu)?;
        let mut ctx = TemplateContext::new();
        ctx.set("version", version);
        Templeter::new()
            .srender("tarball", tarball, &ctx.into_map())
            .map_err(Into::into)
    }

    pub fn tarball_url(&self, version: &str) -> Result<String> {
        let rendered = self.tarball_rendered(version)?;
        Ok(rendered.split('!').next().unwrap_or(&rendered).to_string())
    }

    pub fn tarball_filename(&self, version: &str) -> Result<String> {
        let rendered = self.tarball_rendered(version)?;
        match rendered.split_once('!') {
            Some((_, name)) => Ok(name.to_string()),
            None => Ok(Path::new(&rendered)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or(rendered)),
        }
    }

    pub fn place(&self) -> &Path {
        &self.place
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn architecture_dependent(&self, format: &str) -> Result<bool> {
        match format {
            "deb" => self.deb_architecture_dependent(),
            "rpm" => self.rpm_architecture_dependent(),
            _ => Ok(false),
        }
    }

    fn deb_architecture_dependent(&self) -> Result<bool> {
        let path = self.place.join("deb").join("control");
        let content = std::fs::read_to_string(&path).context(ReadCheckSnafu { path })?;
        Ok(content
            .lines()
            .any(|line| line.starts_with("Architecture:") && !line.starts_with("Architecture: all")))
    }

    fn rpm_architecture_dependent(&self) -> Result<bool> {
        let path = self.place.join("rpm").join(format!("{}.spec", self.artifact));
        let content = std::fs::read_to_string(&path).context(ReadCheckSnafu { path })?;
        for line in content.lines() {
            let squashed: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            if squashed.starts_with("BuildArch:noarch") {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn yaml_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        other => other
            .as_f64()
            .map(|f| {
                if f.fract() == 0.0 {
                    format!("{f:.0}")
                } else {
                    f.to_string()
                }
            })
            .unwrap_or_else(|| format!("{other:?}")),
    }
}

/// Format-specialized view over an `ArtifactDefs`, adding the per-format
/// `release`/`buildargs` section, mirroring `ArtifactFormatDefs`.
pub struct ArtifactFormatDefs {
    pub defs: ArtifactDefs,
    pub format: String,
}

impl ArtifactFormatDefs {
    fn format_section(&self) -> Result<FormatMeta> {
        let raw = self
            .defs
            .meta
            .formats
            .get(&self.format)
            .cloned()
            .context(NoReleaseSnafu {
                format: self.format.clone(),
            })?;
        serde_yaml::from_value(raw).map_err(|_| Error::NoRelease {
            format: self.format.clone(),
        })
    }

    pub fn release(&self) -> Result<String> {
        Ok(yaml_to_string(&self.format_section()?.release))
    }

    pub fn fullversion(&self, derivative: &str) -> Result<String> {
        Ok(format!("{}-{}", self.defs.version(derivative)?, self.release()?))
    }

    pub fn has_buildargs(&self) -> bool {
        self.format_section()
            .ok()
            .and_then(|s| s.buildargs)
            .is_some()
    }

    pub fn buildargs(&self) -> Vec<String> {
        self.format_section()
            .ok()
            .and_then(|s| s.buildargs)
            .map(|s| s.split(' ').map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn architecture_dependent(&self) -> Result<bool> {
        self.defs.architecture_dependent(&self.format)
    }
}

pub struct ArtifactDefsFactory;

impl ArtifactDefsFactory {
    pub fn get(place: &Path, artifact: &str, format: &str) -> Result<ArtifactFormatDefs> {
        if !matches!(format, "deb" | "rpm" | "osi") {
            return UnsupportedFormatSnafu {
                format: format.to_string(),
            }
            .fail();
        }
        let defs = ArtifactDefs::load(place, artifact)?;
        Ok(ArtifactFormatDefs {
            defs,
            format: format.to_string(),
        })
    }
}

/// A single `<src> <dest>` rule from a rename index, per `spec.md` §6.6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRule {
    pub src: String,
    pub dest: String,
}

/// Parse a rename index's content, warning (by returning `None` entries
/// that the caller skips) on blank lines, unparseable lines.
pub fn parse_rename_index(content: &str) -> Vec<RenameRule> {
    let mut rules = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        match (parts.next(), parts.next()) {
            (Some(src), Some(dest)) if !dest.contains(' ') => rules.push(RenameRule {
                src: src.to_string(),
                dest: dest.to_string(),
            }),
            _ => log::warn!("unable to parse rename index rule '{line}'"),
        }
    }
    rules
}

/// Apply rename rules relative to `root`, warning and skipping rules whose
/// source does not exist.
pub fn apply_rename_index(root: &Path, rules: &[RenameRule]) -> std::io::Result<()> {
    for rule in rules {
        let src_path = root.join(&rule.src);
        let dest_path = root.join(&rule.dest);
        if !src_path.exists() {
            log::warn!("source file {src_path:?} in rename index not found");
            continue;
        }
        log::info!("renaming {src_path:?} -> {dest_path:?}");
        std::fs::rename(&src_path, &dest_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plain_version() {
        let v = ArtifactVersion::parse("1.2.3-1").unwrap();
        assert_eq!(v.main, "1.2.3");
        assert_eq!(v.release, "1");
        assert_eq!(v.dist, None);
        assert_eq!(v.build, -1);
        assert_eq!(v.full(), "1.2.3-1");
    }

    #[test]
    fn parses_dist_and_build() {
        let v = ArtifactVersion::parse("1.2.3-1.bookworm+build4").unwrap();
        assert_eq!(v.release, "1");
        assert_eq!(v.dist.as_deref(), Some("bookworm"));
        assert_eq!(v.build, 4);
        assert_eq!(v.full(), "1.2.3-1.bookworm+build4");
    }

    #[test]
    fn equality_ignores_build() {
        let a = ArtifactVersion::parse("1.0-1+build1").unwrap();
        let b = ArtifactVersion::parse("1.0-1+build2").unwrap();
        assert_eq!(a, b);
        let c = ArtifactVersion::parse("1.0-2+build1").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn major_extracts_leading_integer() {
        let v = ArtifactVersion::parse("12.4.0-1").unwrap();
        assert_eq!(v.major(), Some(12));
    }

    #[test]
    fn rename_index_skips_blank_and_malformed_lines() {
        let rules = parse_rename_index("a.tar b.tar\n\nmalformed-line\n");
        assert_eq!(
            rules,
            vec![RenameRule {
                src: "a.tar".to_string(),
                dest: "b.tar".to_string(),
            }]
        );
    }

    #[test]
    fn rename_index_applies_to_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.tar"), b"x").unwrap();
        let rules = vec![RenameRule {
            src: "a.tar".to_string(),
            dest: "b.tar".to_string(),
        }];
        apply_rename_index(tmp.path(), &rules).unwrap();
        assert!(tmp.path().join("b.tar").exists());
        assert!(!tmp.path().join("a.tar").exists());
    }
}
