//! Small stateless helpers shared across modules.
//!
//! Grounded on `fatbuildr/utils.py`: host architecture detection, checksum
//! verification, tarball download, and command-line quoting for log
//! messages (the original's `shelljoin`, used throughout `exec.py` and
//! `builds/__init__.py` for human-readable command logging).

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256, Sha512};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to download {url}: {source}"))]
    Download { url: String, source: std::io::Error },

    #[snafu(display("checksum mismatch for {path:?}: expected {expected}, got {actual}"))]
    ChecksumMismatch {
        path: std::path::PathBuf,
        expected: String,
        actual: String,
    },

    #[snafu(display("unsupported checksum format {format}"))]
    UnsupportedChecksumFormat { format: String },

    #[snafu(display("unable to read {path:?}: {source}"))]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Returns the host machine architecture normalized the way `uname -m`
/// reports it (e.g. `x86_64`, `aarch64`).
pub fn host_architecture() -> String {
    std::env::consts::ARCH.to_string()
}

/// Quote a command and its arguments for inclusion in a single log line,
/// the way the original's `shelljoin()` did for `exec.py`'s debug logging.
pub fn shelljoin<S: AsRef<str>>(cmd: &[S]) -> String {
    cmd.iter()
        .map(|s| {
            let s = s.as_ref();
            if s.contains(' ') || s.is_empty() {
                format!("'{s}'")
            } else {
                s.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Download a file over HTTP(S) to `dest`. Left as a thin synchronous
/// wrapper so callers (which already run on a worker thread, never the
/// async runtime) do not need to juggle a tokio handle.
pub fn dl_file(url: &str, dest: &Path) -> Result<()> {
    let response = ureq::get(url).call().map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
    }).context(DownloadSnafu { url })?;
    let mut reader = response.into_reader();
    let mut file = std::fs::File::create(dest).context(DownloadSnafu { url })?;
    std::io::copy(&mut reader, &mut file).context(DownloadSnafu { url })?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumFormat {
    Sha256,
    Sha512,
}

impl std::str::FromStr for ChecksumFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(ChecksumFormat::Sha256),
            "sha512" => Ok(ChecksumFormat::Sha512),
            other => UnsupportedChecksumFormatSnafu {
                format: other.to_string(),
            }
            .fail(),
        }
    }
}

/// Verify the checksum of a downloaded file against the value declared in
/// an artifact's meta.yml, per `spec.md` §6.3.
pub fn verify_checksum(path: &Path, format: ChecksumFormat, expected: &str) -> Result<()> {
    let mut file = std::fs::File::open(path).context(ReadSnafu { path })?;
    let actual = match format {
        ChecksumFormat::Sha256 => {
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = file.read(&mut buf).context(ReadSnafu { path })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }
        ChecksumFormat::Sha512 => {
            let mut hasher = Sha512::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = file.read(&mut buf).context(ReadSnafu { path })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }
    };
    if !actual.eq_ignore_ascii_case(expected) {
        return ChecksumMismatchSnafu {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        }
        .fail();
    }
    Ok(())
}

/// Returns the current process user's name and group, falling back to the
/// numeric uid/gid if the passwd/group database lookup fails, matching
/// `current_user_group()`'s use in `images.py` to template the in-container
/// unprivileged build user.
pub fn current_user_group() -> (u32, String, u32, String) {
    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };
    let user = std::env::var("USER").unwrap_or_else(|_| uid.to_string());
    let group = std::env::var("GROUP").unwrap_or_else(|_| gid.to_string());
    (uid, user, gid, group)
}

/// Sanitize an archive's top-level stem into a string safe for use as a
/// filesystem path component (no `/`, collapse whitespace to `-`).
pub fn sanitized_stem(stem: &str) -> String {
    stem.chars()
        .map(|c| if c.is_whitespace() || c == '/' { '-' } else { c })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shelljoin_quotes_spaces() {
        assert_eq!(
            shelljoin(&["docker", "build", "--tag", "my tag"]),
            "docker build --tag 'my tag'"
        );
    }

    #[test]
    fn checksum_format_parses() {
        assert_eq!("sha256".parse::<ChecksumFormat>().unwrap(), ChecksumFormat::Sha256);
        assert!("md5".parse::<ChecksumFormat>().is_err());
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitized_stem("my package v1"), "my-package-v1");
    }
}
