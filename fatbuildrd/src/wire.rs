//! Wire DTOs exchanged between the console protocol and clients.
//!
//! Grounded on `protocols/wire.py`: plain serializable structs, one per
//! domain object the daemon reports over the socket (instances, builds,
//! artifacts, changelog entries, keyring info). Where the original used a
//! `to_dict`/`load_from_json` pair by hand, `serde` derives both directions.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireInstance {
    pub id: String,
    pub name: String,
    pub userid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBuild {
    pub id: String,
    pub state: String,
    pub place: String,
    #[serde(default)]
    pub logfile: Option<String>,
    pub user: String,
    pub email: String,
    pub distribution: String,
    pub derivative: String,
    pub format: String,
    pub artifact: String,
    /// Unix timestamp, matching `int(build.submission.timestamp())`.
    pub submission: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireArtifact {
    pub name: String,
    pub architecture: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireChangelogEntry {
    pub version: String,
    pub author: String,
    /// ISO8601 timestamp, rendered by the changelog parser for the format
    /// in question (Debian RFC2822 dates, RPM dates from `createrepo_c`).
    pub date: String,
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSubKeyring {
    pub fingerprint: String,
    pub algo: String,
    pub expires: Option<String>,
    pub creation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireKeyring {
    pub userid: String,
    pub id: String,
    pub fingerprint: String,
    pub algo: String,
    pub expires: Option<String>,
    pub creation: String,
    pub last_update: String,
    pub subkey: WireSubKeyring,
}

/// Submission form accompanying a new build request, grounded on
/// `builds/form.py`'s `BuildSubmissionForm` / `ArtifactForm` pair: the
/// fields a client must supply to enqueue an artifact build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBuildForm {
    pub distribution: String,
    pub derivative: String,
    pub artifact: String,
    pub user: String,
    pub email: String,
    pub message: String,
    #[serde(default)]
    pub fatbuildr_version: Option<String>,
}

/// Frame kinds exchanged over the console protocol, grounded on
/// `console/server.py`/`console/client.py`'s interleaving of task stdout,
/// log records, and end-of-stream markers onto a single stream socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConsoleFrame {
    Output { data: String },
    Log { level: u8, message: String },
    End { code: i32 },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_roundtrips_through_toml() {
        let build = WireBuild {
            id: "abc123".into(),
            state: "running".into(),
            place: "/var/lib/fatbuildr/workspaces/abc123".into(),
            logfile: None,
            user: "alice".into(),
            email: "alice@example.org".into(),
            distribution: "bullseye".into(),
            derivative: "main".into(),
            format: "deb".into(),
            artifact: "fatbuildr".into(),
            submission: 1_700_000_000,
            message: "rebuild".into(),
        };
        let serialized = toml::to_string(&build).unwrap();
        let restored: WireBuild = toml::from_str(&serialized).unwrap();
        assert_eq!(restored.id, "abc123");
        assert_eq!(restored.submission, 1_700_000_000);
    }

    #[test]
    fn console_frame_tag_roundtrips() {
        let frame = ConsoleFrame::Log {
            level: 30,
            message: "disk almost full".into(),
        };
        let serialized = toml::to_string(&frame).unwrap();
        assert!(serialized.contains("kind = \"log\""));
        let restored: ConsoleFrame = toml::from_str(&serialized).unwrap();
        match restored {
            ConsoleFrame::Log { level, message } => {
                assert_eq!(level, 30);
                assert_eq!(message, "disk almost full");
            }
            _ => panic!("expected log frame"),
        }
    }
}
