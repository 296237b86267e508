//! JWT token issuance and verification.
//!
//! Grounded on `tokens.py`: `TokensManager` is the server-side piece that
//! owns a per-instance symmetric encryption key and signs/verifies tokens
//! for that instance's users; `ClientTokensManager` is the client-side
//! piece that caches one token per remote URI on disk, keyed by a
//! base64-encoded filename. Ported onto `jsonwebtoken` in place of
//! PyJWT.

use std::path::{Path, PathBuf};

use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to create tokens directory {path:?}: {source}"))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to set permissions on {path:?}: {source}"))]
    SetPermissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("token encryption key file {path:?} not found"))]
    KeyNotFound { path: PathBuf },

    #[snafu(display("unable to read {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to write {path:?}: {source}"))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("token is invalid"))]
    Invalid,

    #[snafu(display("token is expired"))]
    Expired,

    #[snafu(display("unsupported JWT algorithm {algorithm}"))]
    UnsupportedAlgorithm { algorithm: String },

    #[snafu(display("unable to encode token: {source}"))]
    Encode { source: jsonwebtoken::errors::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    iat: i64,
    exp: i64,
    aud: String,
    sub: String,
}

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => UnsupportedAlgorithmSnafu {
            algorithm: other.to_string(),
        }
        .fail(),
    }
}

/// Server-side JWT issuance/verification for one instance.
pub struct TokensManager {
    path: PathBuf,
    audience: String,
    algorithm: String,
    duration_days: i64,
    encryption_key: Option<String>,
}

impl TokensManager {
    pub fn new(storage: &Path, instance_id: &str, audience: &str, algorithm: &str, duration_days: i64) -> Self {
        TokensManager {
            path: storage.join(instance_id),
            audience: audience.to_string(),
            algorithm: algorithm.to_string(),
            duration_days,
            encryption_key: None,
        }
    }

    /// Load the instance's symmetric encryption key, creating the
    /// directory and key file if `create` is true and they do not exist.
    pub fn load(&mut self, create: bool) -> Result<()> {
        if !self.path.exists() && create {
            std::fs::create_dir_all(&self.path).context(CreateDirSnafu {
                path: self.path.clone(),
            })?;
            set_mode(&self.path, 0o755)?;
        }

        let key_path = self.path.join("key");
        if !key_path.exists() {
            if create {
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                std::fs::write(&key_path, hex::encode(bytes)).context(WriteSnafu {
                    path: key_path.clone(),
                })?;
                set_mode(&key_path, 0o400)?;
            } else {
                return KeyNotFoundSnafu { path: key_path }.fail();
            }
        }

        self.encryption_key = Some(
            std::fs::read_to_string(&key_path).context(ReadSnafu { path: key_path })?,
        );
        Ok(())
    }

    /// Decode `token` and return the `sub` claim (the user it was issued
    /// for), rejecting invalid signatures and expired tokens distinctly.
    pub fn decode(&self, token: &str) -> Result<String> {
        let key = self.encryption_key.as_deref().ok_or(Error::Invalid)?;
        let algorithm = parse_algorithm(&self.algorithm)?;
        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[&self.audience]);

        let data = decode::<Claims>(token, &DecodingKey::from_secret(key.as_bytes()), &validation)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::Expired,
                _ => Error::Invalid,
            })?;
        Ok(data.claims.sub)
    }

    /// Issue a token for `user`, valid for the configured audience and
    /// duration.
    pub fn generate(&self, user: &str, now: chrono::DateTime<chrono::Utc>) -> Result<String> {
        let key = self.encryption_key.as_deref().ok_or(Error::Invalid)?;
        let algorithm = parse_algorithm(&self.algorithm)?;
        let claims = Claims {
            iat: now.timestamp(),
            exp: (now + chrono::Duration::days(self.duration_days)).timestamp(),
            aud: self.audience.clone(),
            sub: user.to_string(),
        };
        encode(
            &Header::new(algorithm),
            &claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .context(EncodeSnafu)
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

/// A token cached on disk client-side, with its decoded (but
/// signature-unverified) claims, matching `ClientToken` in the original:
/// client-side code trusts the server to have issued it and only reads
/// the claims back for display/expiry bookkeeping.
#[derive(Debug, Clone)]
pub struct ClientToken {
    pub path: PathBuf,
    pub uri: String,
    pub raw: String,
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
    pub sub: String,
}

impl std::fmt::Display for ClientToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "path: {}", self.path.display())?;
        writeln!(f, "uri: {}", self.uri)?;
        writeln!(f, "user: {}", self.sub)?;
        writeln!(f, "issued at: {}", self.iat)?;
        writeln!(f, "expiration: {}", self.exp)?;
        write!(f, "audience: {}", self.aud)
    }
}

const TOKEN_EXTENSION: &str = ".token";

/// Client-side cache of one JWT per remote URI.
pub struct ClientTokensManager {
    path: PathBuf,
}

impl ClientTokensManager {
    pub fn new(path: PathBuf) -> Self {
        ClientTokensManager { path }
    }

    fn uri_filename(uri: &str) -> String {
        format!(
            "{}{}",
            base64::engine::general_purpose::STANDARD.encode(uri.as_bytes()),
            TOKEN_EXTENSION
        )
    }

    fn path_uri(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(stem).ok()?;
        String::from_utf8(decoded).ok()
    }

    fn load_path(path: &Path) -> Result<(String, i64, i64, String, String)> {
        if !path.exists() {
            return Err(Error::Read {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "token file not found"),
            });
        }
        let token = std::fs::read_to_string(path)
            .context(ReadSnafu {
                path: path.to_path_buf(),
            })?
            .trim()
            .to_string();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = std::collections::HashSet::new();

        let data = decode::<Claims>(&token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|_| Error::Invalid)?;
        Ok((token, data.claims.iat, data.claims.exp, data.claims.aud, data.claims.sub))
    }

    /// Every token cached in this manager's directory.
    pub fn tokens(&self) -> Result<Vec<ClientToken>> {
        let mut tokens = Vec::new();
        if !self.path.exists() {
            return Ok(tokens);
        }
        for entry in std::fs::read_dir(&self.path).context(ReadSnafu {
            path: self.path.clone(),
        })? {
            let entry = entry.context(ReadSnafu {
                path: self.path.clone(),
            })?;
            let path = entry.path();
            if path.extension().map(|e| e == "token").unwrap_or(false) {
                if let Some(uri) = Self::path_uri(&path) {
                    if let Ok((raw, iat, exp, aud, sub)) = Self::load_path(&path) {
                        tokens.push(ClientToken {
                            path,
                            uri,
                            raw,
                            iat,
                            exp,
                            aud,
                            sub,
                        });
                    }
                }
            }
        }
        Ok(tokens)
    }

    /// Load the token cached for `uri`, returning `None` if absent or
    /// unreadable (matching the original's "best effort" client-side
    /// cache lookup).
    pub fn load(&self, uri: &str) -> Option<String> {
        let token_path = self.path.join(Self::uri_filename(uri));
        Self::load_path(&token_path).ok().map(|(raw, ..)| raw)
    }

    /// Cache `token` under `uri`, creating the manager directory if
    /// missing (but never its parents, mirroring the original's refusal
    /// to silently create unrelated ancestor directories).
    pub fn save(&self, uri: &str, token: &str) -> Result<()> {
        if !self.path.exists() {
            std::fs::create_dir(&self.path).context(CreateDirSnafu {
                path: self.path.clone(),
            })?;
            set_mode(&self.path, 0o700)?;
        }
        let token_path = self.path.join(Self::uri_filename(uri));
        std::fs::write(&token_path, token).context(WriteSnafu { path: token_path.clone() })?;
        set_mode(&token_path, 0o600)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uri_filename_roundtrips() {
        let uri = "https://build.example.org";
        let filename = ClientTokensManager::uri_filename(uri);
        assert!(filename.ends_with(".token"));
        let recovered = ClientTokensManager::path_uri(Path::new(&filename)).unwrap();
        assert_eq!(recovered, uri);
    }

    #[test]
    fn generate_and_decode_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = TokensManager::new(dir.path(), "default", "fatbuildr", "HS256", 30);
        manager.load(true).unwrap();
        let now = chrono::Utc::now();
        let token = manager.generate("alice", now).unwrap();
        let user = manager.decode(&token).unwrap();
        assert_eq!(user, "alice");
    }

    #[test]
    fn expired_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = TokensManager::new(dir.path(), "default", "fatbuildr", "HS256", -1);
        manager.load(true).unwrap();
        let now = chrono::Utc::now() - chrono::Duration::days(2);
        let token = manager.generate("alice", now).unwrap();
        let err = manager.decode(&token).unwrap_err();
        assert!(matches!(err, Error::Expired));
    }
}
