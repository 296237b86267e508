//! Instance definitions and the composition object wiring every per-instance
//! subsystem together.
//!
//! Grounded on `instances.py`: `Instance`/`RunningInstance` own a keyring, a
//! token manager, an images manager, pipelines, a cache, a registry
//! manager, and a task engine, all scoped to one instance id. `Instances`
//! loads every `<id>.yml` in the configured instances directory, per
//! `spec.md` §6.2.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::cache::CacheManager;
use crate::config::Config;
use crate::images::ImagesManager;
use crate::keyring::InstanceKeyring;
use crate::pipelines::InstancePipelines;
use crate::policy::PolicyManager;
use crate::registry::RegistryManager;
use crate::tasks::queue::TaskQueue;
use crate::tokens::TokensManager;
use crate::utils::host_architecture;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to read instances directory {path:?}: {source}"))]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to read instance definition {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to parse instance definition {path:?}: {source}"))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("unknown instance {id}"))]
    Unknown { id: String },

    #[snafu(transparent)]
    Pipelines { source: crate::pipelines::Error },

    #[snafu(transparent)]
    Policy { source: crate::policy::Error },

    #[snafu(transparent)]
    Queue { source: crate::tasks::queue::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One `<id>.yml` instance definition, per `spec.md` §6.2.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceDef {
    pub id: String,
    pub name: String,
}

/// A loaded, not-yet-running instance: everything needed to build its
/// `RunningInstance` once a worker thread picks it up.
pub struct Instance {
    pub def: InstanceDef,
    pub pipelines: InstancePipelines,
}

impl Instance {
    pub fn load(config: &Config, def: InstanceDef) -> Result<Self> {
        let pipelines_path = config.dirs.instances.join(format!("{}.pipelines.yml", def.id));
        let pipelines = InstancePipelines::load(&pipelines_path, &host_architecture())?;
        Ok(Instance { def, pipelines })
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }
}

/// The fully wired set of per-instance subsystems, handed to a worker
/// thread. Owns everything the task engine needs to run builds, publish,
/// and manage the keyring/images/registry for this one instance.
pub struct RunningInstance {
    pub instance: Instance,
    pub keyring: InstanceKeyring,
    pub tokens: TokensManager,
    pub policy: PolicyManager,
    pub cache: CacheManager,
    pub queue: TaskQueue,
}

impl RunningInstance {
    pub fn new(config: &Config, instance: Instance) -> Result<Self> {
        let id = instance.id().to_string();
        let keyring = InstanceKeyring::new(config, &id);
        let tokens = TokensManager::new(
            &config.tokens.storage,
            &id,
            &config.tokens.audience,
            &config.tokens.algorithm,
            config.tokens.duration,
        );
        let policy = PolicyManager::load(&config.run.policy, &config.run.vendor_policy)?;
        let cache = CacheManager::new(config.dirs.cache.clone(), id.clone());
        let workspace = config.dirs.workspaces.join(&id);
        std::fs::create_dir_all(&workspace).ok();
        let queue = TaskQueue::load(&workspace)?;

        Ok(RunningInstance {
            instance,
            keyring,
            tokens,
            policy,
            cache,
            queue,
        })
    }

    pub fn images_manager<'a>(&self, config: &'a Config) -> ImagesManager<'a> {
        ImagesManager::new(config, self.instance.id())
    }

    pub fn registry(&self, config: &Config, format: &str) -> crate::registry::Result<Box<dyn crate::registry::Registry>> {
        RegistryManager::new(config.registry.storage.clone(), config.registry.conf.clone())
            .factory(format, self.instance.id())
    }

    pub fn workspace(&self, config: &Config) -> PathBuf {
        config.dirs.workspaces.join(self.instance.id())
    }
}

/// Loads every `<id>.yml` under the configured instances directory.
pub struct Instances {
    by_id: HashMap<String, Instance>,
}

impl Instances {
    pub fn load(config: &Config) -> Result<Self> {
        let dir = &config.dirs.instances;
        let mut by_id = HashMap::new();
        if !dir.exists() {
            return Ok(Instances { by_id });
        }
        for entry in std::fs::read_dir(dir).context(ReadDirSnafu { path: dir.clone() })? {
            let entry = entry.context(ReadDirSnafu { path: dir.clone() })?;
            let path = entry.path();
            let Some(filename) = path.file_name().and_then(|f| f.to_str()) else { continue };
            // instance definitions are `<id>.yml`; pipeline files
            // (`<id>.pipelines.yml`) live alongside them and are skipped here.
            if !filename.ends_with(".yml") || filename.ends_with(".pipelines.yml") {
                continue;
            }
            let content = std::fs::read_to_string(&path).context(ReadSnafu { path: path.clone() })?;
            let def: InstanceDef = serde_yaml::from_str(&content).context(ParseSnafu { path: path.clone() })?;
            let instance = Instance::load(config, def)?;
            by_id.insert(instance.id().to_string(), instance);
        }
        Ok(Instances { by_id })
    }

    pub fn get(&self, id: &str) -> Result<&Instance> {
        self.by_id.get(id).context(UnknownSnafu { id: id.to_string() })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.by_id.keys().map(String::as_str).collect()
    }

    pub fn into_iter(self) -> impl Iterator<Item = (String, Instance)> {
        self.by_id.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_instance_fixture(dir: &Path, id: &str) {
        let mut def_file = std::fs::File::create(dir.join(format!("{id}.yml"))).unwrap();
        writeln!(def_file, "id: {id}\nname: Test Instance").unwrap();
        let mut pipelines_file = std::fs::File::create(dir.join(format!("{id}.pipelines.yml"))).unwrap();
        writeln!(
            pipelines_file,
            "gpg:\n  name: Test\n  email: test@example.org\nformats:\n  deb:\n    - name: bookworm\n      tag: \"~fb\"\n"
        )
        .unwrap();
    }

    #[test]
    fn loads_instance_definitions_and_skips_pipelines_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_instance_fixture(tmp.path(), "myinstance");

        let config_toml = format!(
            r#"
            [dirs]
            instances = "{instances}"
            workspaces = "{instances}"
            cache = "{instances}"
            [keyring]
            storage = "{instances}"
            type = "rsa"
            size = 4096
            expires = false
            [tokens]
            storage = "{instances}"
            audience = "fatbuildr"
            algorithm = "HS256"
            duration = 30
            [registry]
            storage = "{instances}"
            conf = "{instances}"
            [images]
            storage = "{instances}"
            defs = "{instances}"
            create_cmd = "mkosi"
            [run]
            policy = "{instances}/policy.ini"
            vendor_policy = "{instances}/policy.ini"
            [tasks]
            workspaces = "{instances}"
            "#,
            instances = tmp.path().display()
        );
        let config: Config = toml::from_str(&config_toml).unwrap();

        let instances = Instances::load(&config).unwrap();
        assert_eq!(instances.ids(), vec!["myinstance"]);
        assert_eq!(instances.get("myinstance").unwrap().def.name, "Test Instance");
        assert!(instances.get("unknown").is_err());
    }
}
