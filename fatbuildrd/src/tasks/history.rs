//! Finished-task history listing and purge policies.
//!
//! Grounded on `history.py`: every subdirectory of an instance's workspace
//! holding a `task.yml` is a historical task record; sorted newest-first by
//! submission time. Four purge policies govern which records survive an
//! idle-triggered sweep, per `spec.md` §4.9 and this crate's supplemental
//! expansion in `SPEC_FULL.md` §2.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to read workspaces directory {path:?}: {source}"))]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to read task record {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("malformed task record {path:?}: {source}"))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("unable to remove task workspace {path:?}: {source}"))]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unsupported purge policy {policy}"))]
    UnknownPolicy { policy: String },

    #[snafu(display("malformed purge value {value:?} for policy {policy}"))]
    MalformedValue { policy: String, value: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The archivable fields of `task.yml`, per `spec.md` §9's resolution of
/// the "archivable task fields" Open Question: a typed record rather than
/// a dynamically-reflected field set.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Task kind name (`build`, `artifact-delete`, `keyring-create`, ...),
    /// used by the `each` purge policy to group by `histid`.
    pub histid: String,
    pub submission: i64,
    pub result: String,
}

/// Lists every `task.yml` under an instance's workspace directory, newest
/// submission first. A malformed record is logged and skipped rather than
/// aborting the whole listing.
pub fn list(workspace: &Path) -> Result<Vec<(PathBuf, TaskRecord)>> {
    if !workspace.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in std::fs::read_dir(workspace).context(ReadDirSnafu { path: workspace.to_path_buf() })? {
        let entry = entry.context(ReadDirSnafu { path: workspace.to_path_buf() })?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let record_path = dir.join("task.yml");
        if !record_path.exists() {
            continue;
        }
        match std::fs::read_to_string(&record_path) {
            Ok(content) => match serde_yaml::from_str::<TaskRecord>(&content) {
                Ok(record) => records.push((dir, record)),
                Err(err) => log::warn!("skipping malformed task record {record_path:?}: {err}"),
            },
            Err(err) => log::warn!("unable to read task record {record_path:?}: {err}"),
        }
    }
    records.sort_by(|a, b| b.1.submission.cmp(&a.1.submission));
    Ok(records)
}

lazy_static! {
    static ref OLDER_RE: Regex = Regex::new(r"^(?P<n>\d+)(?P<unit>[hdmy])$").unwrap();
    static ref SIZE_RE: Regex = Regex::new(r"^(?P<n>\d+)(?P<unit>[KMGT]B|[KMGT]b)$").unwrap();
}

/// One of the four purge policies named in `spec.md` §4.9.
#[derive(Debug, Clone)]
pub enum PurgePolicy {
    Older(chrono::Duration),
    Last(usize),
    Each(usize),
    Size(u64),
}

impl PurgePolicy {
    pub fn parse(policy: &str, value: &str) -> Result<Self> {
        match policy {
            "older" => {
                let captures = OLDER_RE
                    .captures(value)
                    .with_context(|| MalformedValueSnafu {
                        policy: policy.to_string(),
                        value: value.to_string(),
                    })?;
                let n: i64 = captures["n"].parse().unwrap();
                let duration = match &captures["unit"] {
                    "h" => chrono::Duration::hours(n),
                    "d" => chrono::Duration::days(n),
                    "m" => chrono::Duration::days(n * 30),
                    "y" => chrono::Duration::days(n * 365),
                    _ => unreachable!(),
                };
                Ok(PurgePolicy::Older(duration))
            }
            "last" => Ok(PurgePolicy::Last(parse_count(policy, value)?)),
            "each" => Ok(PurgePolicy::Each(parse_count(policy, value)?)),
            "size" => {
                let captures = SIZE_RE
                    .captures(value)
                    .with_context(|| MalformedValueSnafu {
                        policy: policy.to_string(),
                        value: value.to_string(),
                    })?;
                let n: u64 = captures["n"].parse().unwrap();
                let multiplier = match &captures["unit"].to_ascii_uppercase()[..] {
                    "KB" => 1024u64,
                    "MB" => 1024 * 1024,
                    "GB" => 1024 * 1024 * 1024,
                    "TB" => 1024 * 1024 * 1024 * 1024,
                    _ => unreachable!(),
                };
                Ok(PurgePolicy::Size(n * multiplier))
            }
            other => UnknownPolicySnafu { policy: other.to_string() }.fail(),
        }
    }

    /// Apply the policy to a workspace's task history, removing every
    /// task workspace the policy says should be pruned, and returning the
    /// number removed.
    pub fn purge(&self, workspace: &Path, now: i64) -> Result<usize> {
        let records = list(workspace)?;
        let mut removed = 0;
        match self {
            PurgePolicy::Older(duration) => {
                let cutoff = now - duration.num_seconds();
                for (dir, record) in &records {
                    if record.submission < cutoff {
                        remove_workspace(dir)?;
                        removed += 1;
                    }
                }
            }
            PurgePolicy::Last(n) => {
                for (dir, _) in records.iter().skip(*n) {
                    remove_workspace(dir)?;
                    removed += 1;
                }
            }
            PurgePolicy::Each(n) => {
                let mut seen_per_kind: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
                for (dir, record) in &records {
                    let count = seen_per_kind.entry(record.histid.clone()).or_insert(0);
                    *count += 1;
                    if *count > *n {
                        remove_workspace(dir)?;
                        removed += 1;
                    }
                }
            }
            PurgePolicy::Size(budget) => {
                let mut cumulative = 0u64;
                for (dir, _) in &records {
                    let size = dir_size(dir);
                    cumulative += size;
                    if cumulative > *budget {
                        remove_workspace(dir)?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

fn parse_count(policy: &str, value: &str) -> Result<usize> {
    value.parse::<usize>().map_err(|_| Error::MalformedValue {
        policy: policy.to_string(),
        value: value.to_string(),
    })
}

fn remove_workspace(dir: &Path) -> Result<()> {
    log::info!("purging task workspace {dir:?}");
    std::fs::remove_dir_all(dir).context(RemoveSnafu { path: dir.to_path_buf() })
}

fn dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_task(workspace: &Path, id: &str, histid: &str, submission: i64, result: &str) {
        let dir = workspace.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("task.yml"),
            format!("id: {id}\nhistid: {histid}\nsubmission: {submission}\nresult: {result}\n"),
        )
        .unwrap();
    }

    #[test]
    fn last_policy_keeps_n_newest_overall() {
        let tmp = tempfile::tempdir().unwrap();
        write_task(tmp.path(), "t1", "build", 100, "success");
        write_task(tmp.path(), "t2", "build", 200, "success");
        write_task(tmp.path(), "t3", "keyring-create", 300, "success");

        let policy = PurgePolicy::parse("last", "2").unwrap();
        let removed = policy.purge(tmp.path(), 1000).unwrap();
        assert_eq!(removed, 1);
        assert!(!tmp.path().join("t1").exists());
        assert!(tmp.path().join("t2").exists());
        assert!(tmp.path().join("t3").exists());
    }

    #[test]
    fn each_policy_keeps_n_newest_per_histid() {
        let tmp = tempfile::tempdir().unwrap();
        write_task(tmp.path(), "t1", "build", 100, "success");
        write_task(tmp.path(), "t2", "build", 200, "success");
        write_task(tmp.path(), "t3", "keyring-create", 300, "success");

        let policy = PurgePolicy::parse("each", "1").unwrap();
        let removed = policy.purge(tmp.path(), 1000).unwrap();
        assert_eq!(removed, 1);
        assert!(!tmp.path().join("t1").exists());
        assert!(tmp.path().join("t2").exists());
        assert!(tmp.path().join("t3").exists());
    }

    #[test]
    fn older_policy_parses_days_and_drops_stale_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        write_task(tmp.path(), "old", "build", 0, "success");
        write_task(tmp.path(), "new", "build", 1_000_000, "success");

        let policy = PurgePolicy::parse("older", "1d").unwrap();
        let removed = policy.purge(tmp.path(), 1_000_000).unwrap();
        assert_eq!(removed, 1);
        assert!(!tmp.path().join("old").exists());
    }

    #[test]
    fn size_policy_rejects_malformed_unit() {
        assert!(PurgePolicy::parse("size", "10").is_err());
        assert!(PurgePolicy::parse("size", "10MB").is_ok());
    }
}
