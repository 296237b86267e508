//! Daemon configuration.
//!
//! Replaces the original `conf.py` hand-rolled INI parser with a `toml` +
//! `serde` struct, the way `buildsys` itself parses its manifests. `spec.md`
//! §6.2 specifies the on-disk directory layout this struct must resolve to;
//! it does not mandate the config file's own syntax.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to read config file {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to parse config file {path:?}: {source}"))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Directory layout, per `spec.md` §6.2.
#[derive(Debug, Clone, Deserialize)]
pub struct Dirs {
    pub instances: PathBuf,
    pub workspaces: PathBuf,
    pub cache: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyringConfig {
    pub storage: PathBuf,
    #[serde(rename = "type")]
    pub key_type: String,
    pub size: u32,
    /// Either `false` (never expires) or a number of days.
    pub expires: KeyExpiry,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum KeyExpiry {
    Never(bool),
    Days(u64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokensConfig {
    pub storage: PathBuf,
    pub audience: String,
    pub algorithm: String,
    pub duration: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub storage: PathBuf,
    pub conf: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    pub storage: PathBuf,
    pub defs: PathBuf,
    pub create_cmd: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub policy: PathBuf,
    pub vendor_policy: PathBuf,
}

/// Task engine settings: the pre/post hook script and the history purge
/// policy applied on idle shutdown.
#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    pub workspaces: PathBuf,
    #[serde(default)]
    pub hook: Option<PathBuf>,
    #[serde(default = "TasksConfig::default_purge_policy")]
    pub purge_policy: String,
    #[serde(default = "TasksConfig::default_purge_value")]
    pub purge_value: String,
}

impl TasksConfig {
    fn default_purge_policy() -> String {
        "last".to_string()
    }

    fn default_purge_value() -> String {
        "10".to_string()
    }
}

/// Per-format build tool settings (one entry per `deb`/`rpm`/`osi`).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FormatConfig {
    pub builder: Option<String>,
    pub prescript_deps: Option<Vec<String>>,
    pub init_cmds: Option<String>,
    pub env_update_cmds: Option<String>,
    pub img_update_cmds: Option<String>,
    pub img_create_use_sysusersd: Option<bool>,
    pub env_path: Option<String>,
    pub env_as_root: Option<bool>,
    pub env_default_mirror: Option<String>,
    pub env_default_components: Option<Vec<String>>,
    pub env_default_modules: Option<Vec<String>>,
    pub shell_cmd: Option<String>,
    pub exec_cmd: Option<String>,
    pub exec_tmpfile: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub dirs: Dirs,
    pub keyring: KeyringConfig,
    pub tokens: TokensConfig,
    pub registry: RegistryConfig,
    pub images: ImagesConfig,
    pub run: RunConfig,
    pub tasks: TasksConfig,
    #[serde(default)]
    pub formats: HashMap<String, FormatConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        toml::from_str(&content).context(ParseSnafu { path })
    }

    pub fn format(&self, name: &str) -> FormatConfig {
        self.formats.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            [dirs]
            instances = "/etc/fatbuildr/instances.d"
            workspaces = "/var/lib/fatbuildr/workspaces"
            cache = "/var/cache/fatbuildr"

            [keyring]
            storage = "/var/lib/fatbuildr/keyring"
            type = "rsa"
            size = 4096
            expires = false

            [tokens]
            storage = "/var/lib/fatbuildr/tokens"
            audience = "fatbuildr"
            algorithm = "HS256"
            duration = 30

            [registry]
            storage = "/var/lib/fatbuildr/registry"
            conf = "/etc/fatbuildr/registry"

            [images]
            storage = "/var/lib/fatbuildr/images"
            defs = "/usr/lib/fatbuildr/images"
            create_cmd = "mkosi --directory {definition}"

            [run]
            policy = "/etc/fatbuildr/policy.ini"
            vendor_policy = "/usr/lib/fatbuildr/policy.ini"

            [tasks]
            workspaces = "/var/lib/fatbuildr/workspaces"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.keyring.size, 4096);
        assert!(matches!(config.keyring.expires, KeyExpiry::Never(false)));
        assert_eq!(config.tasks.purge_policy, "last");
        assert_eq!(config.tasks.purge_value, "10");
    }
}
