//! Per-instance GPG keyring management.
//!
//! Grounded on `keyring.py`. The original shells out to the `gpg` Python
//! binding (`python-gpg`/`gpgme`); no equivalent crate exists in the
//! example pack, so this talks to `gpg`/`gpgconf`/`gpg-agent` via `duct`,
//! the way `containers.rs` shells out to `docker`.
//!
//! Unlike `InstanceKeyring.load()` in the original, which logs and
//! swallows a missing/broken keyring, `InstanceKeyring::load` here
//! propagates a distinct error so a broken keyring fails instance
//! construction loudly instead of silently degrading signing later.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use duct::cmd;
use rand::Rng;
use snafu::{ResultExt, Snafu};

use crate::config::{Config, KeyExpiry};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to create keyring directory {path:?}: {source}"))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("keyring already exists at {path:?}"))]
    AlreadyExists { path: PathBuf },

    #[snafu(display("unable to write passphrase file {path:?}: {source}"))]
    WritePassphrase {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to read passphrase file {path:?}: {source}"))]
    ReadPassphrase {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to set permissions on {path:?}: {source}"))]
    SetPermissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("no key found in keyring {homedir:?}"))]
    NoKey { homedir: PathBuf },

    #[snafu(display("multiple keys found in keyring {homedir:?}"))]
    MultipleKeys { homedir: PathBuf },

    #[snafu(display("masterkey in {homedir:?} does not have exactly two subkeys"))]
    UnexpectedSubkeys { homedir: PathBuf },

    #[snafu(display("gpg invocation failed ({command}): {source}"))]
    Gpg {
        command: String,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Default)]
pub struct KeyringSubKey {
    pub fingerprint: String,
    pub keygrip: String,
    pub algo: String,
    pub expires: Option<DateTime<Utc>>,
    pub creation: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct KeyringMasterKey {
    pub userid: String,
    pub id: String,
    pub fingerprint: String,
    pub algo: String,
    pub expires: Option<DateTime<Utc>>,
    pub creation: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub subkey: KeyringSubKey,
}

pub struct InstanceKeyring {
    homedir: PathBuf,
    passphrase_path: PathBuf,
    algorithm: String,
    expires: bool,
    expires_in: u64,
    pub masterkey: Option<KeyringMasterKey>,
}

impl InstanceKeyring {
    pub fn new(config: &Config, instance_id: &str) -> Self {
        let homedir = config.keyring.storage.join(instance_id);
        let passphrase_path = homedir.join("passphrase");
        let algorithm = format!("{}{}", config.keyring.key_type, config.keyring.size);
        let (expires, expires_in) = match config.keyring.expires {
            KeyExpiry::Never(b) => (b, 0),
            KeyExpiry::Days(days) => (true, days),
        };
        InstanceKeyring {
            homedir,
            passphrase_path,
            algorithm,
            expires,
            expires_in,
            masterkey: None,
        }
    }

    pub fn homedir(&self) -> &Path {
        &self.homedir
    }

    fn passphrase(&self) -> Result<String> {
        std::fs::read_to_string(&self.passphrase_path).context(ReadPassphraseSnafu {
            path: self.passphrase_path.clone(),
        })
    }

    /// Create the keyring directory, a random passphrase, and the
    /// master/sub GPG key pair.
    pub fn create(&mut self, userid: &str) -> Result<()> {
        if !self.homedir.exists() {
            std::fs::create_dir_all(&self.homedir).context(CreateDirSnafu {
                path: self.homedir.clone(),
            })?;
            set_mode(&self.homedir, 0o700)?;
        }

        if self.list_key_ids()?.len() > 0 {
            return AlreadyExistsSnafu {
                path: self.homedir.clone(),
            }
            .fail();
        }

        let alphabet: Vec<char> = ('a'..='z').chain('A'..='Z').chain('0'..='9').collect();
        let mut rng = rand::thread_rng();
        let passphrase: String = (0..32).map(|_| alphabet[rng.gen_range(0..alphabet.len())]).collect();
        std::fs::write(&self.passphrase_path, &passphrase).context(WritePassphraseSnafu {
            path: self.passphrase_path.clone(),
        })?;
        set_mode(&self.passphrase_path, 0o400)?;

        let expire_spec = if self.expires {
            format!("{}d", self.expires_in)
        } else {
            "0".to_string()
        };

        self.run_gpg(&[
            "--batch",
            "--pinentry-mode",
            "loopback",
            "--passphrase",
            &passphrase,
            "--quick-generate-key",
            userid,
            &self.algorithm,
            "cert",
            &expire_spec,
        ])?;

        let masterkeys: Vec<_> = self.query_keys()?.into_iter().filter(|k| k.is_master).collect();
        let master_fingerprint = masterkeys
            .first()
            .ok_or_else(|| Error::NoKey {
                homedir: self.homedir.clone(),
            })?
            .fingerprint
            .clone();

        self.run_gpg(&[
            "--batch",
            "--pinentry-mode",
            "loopback",
            "--passphrase",
            &passphrase,
            "--quick-add-key",
            &master_fingerprint,
            &self.algorithm,
            "sign",
            &expire_spec,
        ])?;

        self.load()
    }

    /// Run the `--list-secret-keys` colon-listing and parse it, shared by
    /// `create` (before the signing subkey exists) and `load`.
    fn query_keys(&self) -> Result<Vec<ParsedKey>> {
        let output = cmd!(
            "gpg",
            "--homedir",
            &self.homedir,
            "--with-colons",
            "--fixed-list-mode",
            "--list-secret-keys",
            "--with-fingerprint"
        )
        .stdout_capture()
        .unchecked()
        .run()
        .context(GpgSnafu {
            command: "gpg --list-secret-keys".to_string(),
        })?;

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_colon_listing(&text))
    }

    fn list_key_ids(&self) -> Result<Vec<String>> {
        let output = cmd!(
            "gpg",
            "--homedir",
            &self.homedir,
            "--with-colons",
            "--list-secret-keys"
        )
        .stdout_capture()
        .unchecked()
        .run()
        .context(GpgSnafu {
            command: "gpg --list-secret-keys".to_string(),
        })?;

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .filter(|line| line.starts_with("sec:"))
            .map(|line| line.to_string())
            .collect())
    }

    /// Load the masterkey and its signing subkey, failing loudly if the
    /// keyring is missing, broken, or ambiguous.
    pub fn load(&mut self) -> Result<()> {
        let parsed = self.query_keys()?;

        let masterkeys: Vec<_> = parsed.iter().filter(|k| k.is_master).collect();
        if masterkeys.is_empty() {
            return NoKeySnafu {
                homedir: self.homedir.clone(),
            }
            .fail();
        }
        if masterkeys.len() > 1 {
            return MultipleKeysSnafu {
                homedir: self.homedir.clone(),
            }
            .fail();
        }

        let subkeys: Vec<_> = parsed.iter().filter(|k| !k.is_master).collect();
        if subkeys.len() != 1 {
            return UnexpectedSubkeysSnafu {
                homedir: self.homedir.clone(),
            }
            .fail();
        }

        let master = masterkeys[0];
        let sub = subkeys[0];

        self.masterkey = Some(KeyringMasterKey {
            userid: master.userid.clone(),
            id: master.id.clone(),
            fingerprint: master.fingerprint.clone(),
            algo: master.algo.clone(),
            expires: master.expires,
            creation: master.creation,
            last_update: master.creation,
            subkey: KeyringSubKey {
                fingerprint: sub.fingerprint.clone(),
                keygrip: sub.id.clone(),
                algo: sub.algo.clone(),
                expires: sub.expires,
                creation: sub.creation,
            },
        });
        Ok(())
    }

    /// Return the armored public key of the masterkey.
    pub fn export(&mut self) -> Result<String> {
        self.load()?;
        let fingerprint = self.masterkey_fingerprint()?;
        let output = cmd!(
            "gpg",
            "--homedir",
            &self.homedir,
            "--armor",
            "--export",
            &fingerprint
        )
        .stdout_capture()
        .run()
        .context(GpgSnafu {
            command: "gpg --export".to_string(),
        })?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Extend the masterkey and subkey expiry by `duration` (a gpg
    /// duration string, e.g. `"180d"`), via the same interactive
    /// `--edit-key` state machine a human operator would drive by hand:
    /// `expire/<duration>/save/quit` for the master key, then
    /// `key 1/expire/<duration>/save/quit` for the signing subkey.
    pub fn renew(&mut self, duration: &str) -> Result<()> {
        let passphrase = self.passphrase()?;
        let fingerprint = self.masterkey_fingerprint()?;
        self.edit_key(&fingerprint, &passphrase, &format!("expire\n{duration}\nsave\n"))?;
        self.edit_key(&fingerprint, &passphrase, &format!("key 1\nexpire\n{duration}\nsave\n"))?;
        self.load()
    }

    /// Drive `gpg --command-fd 0 --edit-key` with a scripted sequence of
    /// edit-key commands fed over stdin, non-interactively via
    /// `--pinentry-mode loopback`.
    fn edit_key(&self, fingerprint: &str, passphrase: &str, script: &str) -> Result<()> {
        let stdin = format!("{script}quit\n");
        cmd!(
            "gpg",
            "--homedir",
            &self.homedir,
            "--batch",
            "--pinentry-mode",
            "loopback",
            "--passphrase",
            passphrase,
            "--command-fd",
            "0",
            "--edit-key",
            fingerprint
        )
        .stdin_bytes(stdin.into_bytes())
        .stdout_capture()
        .run()
        .context(GpgSnafu {
            command: format!("gpg --edit-key {fingerprint}"),
        })?;
        Ok(())
    }

    fn masterkey_fingerprint(&self) -> Result<String> {
        Ok(self
            .masterkey
            .as_ref()
            .ok_or_else(|| Error::NoKey {
                homedir: self.homedir.clone(),
            })?
            .fingerprint
            .clone())
    }

    /// Load the signing subkey into a throwaway `gpg-agent` with
    /// `--allow-preset-passphrase`, so downstream signing tools (e.g.
    /// `reprepro`) can use the key non-interactively.
    pub fn load_agent(&self) -> Result<()> {
        let sock = self.homedir.join("S.gpg-agent");
        if sock.exists() {
            cmd!("gpgconf", "--kill", "--homedir", &self.homedir, "gpg-agent")
                .run()
                .context(GpgSnafu {
                    command: "gpgconf --kill".to_string(),
                })?;
        }

        cmd!(
            "gpg-agent",
            "--homedir",
            &self.homedir,
            "--allow-preset-passphrase",
            "--daemon"
        )
        .run()
        .context(GpgSnafu {
            command: "gpg-agent --daemon".to_string(),
        })?;

        let keygrip = self
            .masterkey
            .as_ref()
            .ok_or_else(|| Error::NoKey {
                homedir: self.homedir.clone(),
            })?
            .subkey
            .keygrip
            .clone();
        let passphrase = self.passphrase()?;

        cmd!(
            "/usr/lib/gnupg/gpg-preset-passphrase",
            "--preset",
            &keygrip
        )
        .env("GNUPGHOME", &self.homedir)
        .stdin_bytes(passphrase.into_bytes())
        .run()
        .context(GpgSnafu {
            command: "gpg-preset-passphrase".to_string(),
        })?;

        Ok(())
    }

    fn run_gpg(&self, args: &[&str]) -> Result<()> {
        let mut full_args: Vec<String> = vec!["--homedir".to_string(), self.homedir.to_string_lossy().to_string()];
        full_args.extend(args.iter().map(|s| s.to_string()));
        cmd("gpg", full_args).run().context(GpgSnafu {
            command: "gpg".to_string(),
        })?;
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)
        .context(SetPermissionsSnafu {
            path: path.to_path_buf(),
        })?
        .permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, mode);
    std::fs::set_permissions(path, perms).context(SetPermissionsSnafu {
        path: path.to_path_buf(),
    })
}

struct ParsedKey {
    is_master: bool,
    id: String,
    userid: String,
    fingerprint: String,
    algo: String,
    expires: Option<DateTime<Utc>>,
    creation: Option<DateTime<Utc>>,
}

/// Minimal parser for `gpg --with-colons` output, enough to recover the
/// fields `KeyringMasterKey`/`KeyringSubKey` expose.
fn parse_colon_listing(text: &str) -> Vec<ParsedKey> {
    let mut keys = Vec::new();
    let mut current: Option<ParsedKey> = None;
    let mut pending_fingerprint: Option<String> = None;

    for line in text.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first() {
            Some(&"sec") | Some(&"ssb") => {
                if let Some(key) = current.take() {
                    keys.push(key);
                }
                let is_master = fields[0] == "sec";
                let creation = fields.get(5).and_then(|s| parse_epoch(s));
                let expires = fields.get(6).and_then(|s| parse_epoch(s));
                let algo = fields.get(3).copied().unwrap_or_default().to_string();
                let id = fields.get(4).copied().unwrap_or_default().to_string();
                current = Some(ParsedKey {
                    is_master,
                    id,
                    userid: String::new(),
                    fingerprint: String::new(),
                    algo,
                    expires,
                    creation,
                });
            }
            Some(&"fpr") => {
                pending_fingerprint = fields.get(9).map(|s| s.to_string());
                if let Some(key) = current.as_mut() {
                    if key.fingerprint.is_empty() {
                        if let Some(fp) = pending_fingerprint.take() {
                            key.fingerprint = fp;
                        }
                    }
                }
            }
            Some(&"uid") => {
                if let Some(key) = current.as_mut() {
                    key.userid = fields.get(9).copied().unwrap_or_default().to_string();
                }
            }
            _ => {}
        }
    }
    if let Some(key) = current.take() {
        keys.push(key);
    }
    keys
}

fn parse_epoch(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_colon_listing() {
        let listing = "sec:u:4096:1:AAAA1111BBBB2222:1600000000:1700000000::u:::scESC:::::::\n\
                        fpr:::::::::0123456789ABCDEF0123456789ABCDEF01234567:\n\
                        uid:u::::1600000000::HASH::Fatbuildr <fatbuildr@example.org>::::::::::0:\n\
                        ssb:u:4096:1:CCCC3333DDDD4444:1600000001:1700000001:::::s:::::::\n\
                        fpr:::::::::FEDCBA9876543210FEDCBA9876543210FEDCBA98:\n";
        let keys = parse_colon_listing(listing);
        assert_eq!(keys.len(), 2);
        assert!(keys[0].is_master);
        assert_eq!(keys[0].userid, "Fatbuildr <fatbuildr@example.org>");
        assert!(!keys[1].is_master);
    }

    #[test]
    fn epoch_parses_to_datetime() {
        assert!(parse_epoch("1700000000").is_some());
        assert!(parse_epoch("").is_none());
    }
}
