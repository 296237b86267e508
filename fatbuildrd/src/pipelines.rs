//! Instance pipeline definitions: which formats/distributions/derivatives an
//! instance builds, and how they relate to build environments.
//!
//! Grounded on `pipelines.py` (the superseded top-level helper) and the
//! richer `instances.py::InstancePipelines`, which is the version actually
//! wired into `RunningInstance`. Loaded from a `pipelines.yml` file per
//! instance directory, the way `images.rs`/`keyring.rs` load their own
//! per-instance YAML/TOML state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to read pipelines definitions {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to parse pipelines definitions {path:?}: {source}"))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("unable to find format corresponding to distribution {distribution}"))]
    UnknownDistribution { distribution: String },

    #[snafu(display("unable to find environment corresponding to distribution {distribution}"))]
    NoEnvironment { distribution: String },

    #[snafu(display("unknown derivative {derivative}"))]
    UnknownDerivative { derivative: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Deserialize)]
pub struct GpgDefs {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistributionDefs {
    pub name: String,
    pub tag: String,
    pub env: Option<String>,
    pub mirror: Option<String>,
    pub components: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DerivativeDefs {
    #[serde(default)]
    pub formats: Vec<String>,
    pub extends: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PipelinesFile {
    gpg: GpgDefs,
    formats: HashMap<String, Vec<DistributionDefs>>,
    #[serde(default)]
    derivatives: HashMap<String, DerivativeDefs>,
    #[serde(default)]
    architectures: Vec<String>,
}

/// An instance's pipeline definitions: formats, distributions and
/// derivatives, and the host architecture always pinned at position 0.
#[derive(Debug, Clone)]
pub struct InstancePipelines {
    pub gpg: GpgDefs,
    pub architectures: Vec<String>,
    formats: HashMap<String, Vec<DistributionDefs>>,
    derivatives: HashMap<String, DerivativeDefs>,
}

impl InstancePipelines {
    pub fn load(path: &Path, host_architecture: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        let file: PipelinesFile = serde_yaml::from_str(&content).context(ParseSnafu { path })?;

        let mut architectures = file.architectures;
        architectures.retain(|a| a != host_architecture);
        architectures.insert(0, host_architecture.to_string());

        Ok(InstancePipelines {
            gpg: file.gpg,
            architectures,
            formats: file.formats,
            derivatives: file.derivatives,
        })
    }

    pub fn formats(&self) -> Vec<&str> {
        self.formats.keys().map(String::as_str).collect()
    }

    pub fn dist_format(&self, distribution: &str) -> Result<String> {
        for (format, dists) in &self.formats {
            if dists.iter().any(|d| d.name == distribution) {
                return Ok(format.clone());
            }
        }
        UnknownDistributionSnafu { distribution }.fail()
    }

    pub fn dist_env(&self, distribution: &str) -> Result<String> {
        for dists in self.formats.values() {
            if let Some(dist) = dists.iter().find(|d| d.name == distribution) {
                if let Some(env) = &dist.env {
                    return Ok(env.clone());
                }
            }
        }
        NoEnvironmentSnafu { distribution }.fail()
    }

    pub fn dist_tag(&self, distribution: &str) -> Result<String> {
        for dists in self.formats.values() {
            if let Some(dist) = dists.iter().find(|d| d.name == distribution) {
                return Ok(dist.tag.clone());
            }
        }
        UnknownDistributionSnafu { distribution }.fail()
    }

    pub fn dist_derivatives(&self, distribution: &str) -> Result<Vec<String>> {
        let mut result = vec!["main".to_string()];
        if self.derivatives.is_empty() {
            return Ok(result);
        }
        let format = self.dist_format(distribution)?;
        for (derivative, items) in &self.derivatives {
            if items.formats.iter().any(|f| f == &format) {
                result.push(derivative.clone());
            }
        }
        Ok(result)
    }

    pub fn env_mirror(&self, environment: &str) -> Option<String> {
        for dists in self.formats.values() {
            for dist in dists {
                if dist.env.as_deref() == Some(environment) {
                    return dist.mirror.clone();
                }
            }
        }
        None
    }

    pub fn env_components(&self, environment: &str) -> Option<Vec<String>> {
        for dists in self.formats.values() {
            for dist in dists {
                if dist.env.as_deref() == Some(environment) {
                    return dist.components.clone();
                }
            }
        }
        None
    }

    pub fn format_dists(&self, format: &str) -> Vec<String> {
        self.formats
            .get(format)
            .map(|dists| dists.iter().map(|d| d.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Formats supported by a derivative, intersected recursively with the
    /// derivative(s) it extends (or `main` if it does not extend anything).
    pub fn derivative_formats(&self, derivative: &str) -> Result<std::collections::HashSet<String>> {
        if derivative == "main" {
            return Ok(self.formats.keys().cloned().collect());
        }
        let defs = self
            .derivatives
            .get(derivative)
            .context(UnknownDerivativeSnafu { derivative })?;
        let own: std::collections::HashSet<String> = defs.formats.iter().cloned().collect();
        let parent = match &defs.extends {
            Some(parent) => self.derivative_formats(parent)?,
            None => self.derivative_formats("main")?,
        };
        Ok(own.intersection(&parent).cloned().collect())
    }

    /// The chain of derivatives from `derivative` up through its `extends`
    /// ancestry, ending at (and including) `main`.
    pub fn recursive_derivatives(&self, derivative: &str) -> Result<Vec<String>> {
        if derivative == "main" {
            return Ok(vec!["main".to_string()]);
        }
        let defs = self
            .derivatives
            .get(derivative)
            .context(UnknownDerivativeSnafu { derivative })?;
        let mut result = vec![derivative.to_string()];
        match &defs.extends {
            Some(parent) => result.extend(self.recursive_derivatives(parent)?),
            None => result.extend(self.recursive_derivatives("main")?),
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_fixture() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
gpg:
  name: Fatbuildr Test
  email: test@example.org
architectures:
  - aarch64
formats:
  deb:
    - name: bookworm
      tag: "~fatbuildr+bookworm"
      env: bookworm-env
      mirror: "http://deb.debian.org/debian"
      components: [main]
  rpm:
    - name: el9
      tag: "fatbuildr.el9"
      env: el9-env
derivatives:
  extra:
    formats: [deb]
    extends: main
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn loads_and_pins_host_architecture_first() {
        let file = write_fixture();
        let pipelines = InstancePipelines::load(file.path(), "x86_64").unwrap();
        assert_eq!(pipelines.architectures[0], "x86_64");
        assert!(pipelines.architectures.contains(&"aarch64".to_string()));
    }

    #[test]
    fn resolves_distribution_format_and_env() {
        let file = write_fixture();
        let pipelines = InstancePipelines::load(file.path(), "x86_64").unwrap();
        assert_eq!(pipelines.dist_format("bookworm").unwrap(), "deb");
        assert_eq!(pipelines.dist_env("bookworm").unwrap(), "bookworm-env");
        assert!(pipelines.dist_format("unknown").is_err());
    }

    #[test]
    fn derivative_extends_intersects_with_main() {
        let file = write_fixture();
        let pipelines = InstancePipelines::load(file.path(), "x86_64").unwrap();
        let formats = pipelines.derivative_formats("extra").unwrap();
        assert!(formats.contains("deb"));
        assert!(!formats.contains("rpm"));
        assert_eq!(
            pipelines.recursive_derivatives("extra").unwrap(),
            vec!["extra".to_string(), "main".to_string()]
        );
    }
}
