//! Source archive handling: tar/zip extraction and repackaging.
//!
//! Grounded on `fatbuildr/archive.py`. The most important piece is the
//! two-phase safe extraction of tar archives: skip members that would
//! escape the destination directory, extract everything with permissive
//! transient directory permissions, and only apply the archive's real
//! owner/mtime/mode metadata in a second pass once every member exists, in
//! deepest-directory-first order. Doing it in one pass would let a
//! restrictive directory mode in the archive block extraction of its own
//! children.

use std::fs::File;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tar::Archive;

use crate::utils::sanitized_stem;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to open archive {path:?}: {source}"))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to read archive {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to extract {path:?} to {dest:?}: {source}"))]
    Extract {
        path: PathBuf,
        dest: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unrecognized archive format for {path:?}"))]
    UnknownFormat { path: PathBuf },

    #[snafu(display("unable to create archive {path:?}: {source}"))]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("archive {path:?} has no single top-level directory"))]
    NoSingleToplevel { path: PathBuf },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    Zip,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Ok(ArchiveFormat::TarXz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Ok(ArchiveFormat::TarBz2)
        } else if name.ends_with(".tar") {
            Ok(ArchiveFormat::Tar)
        } else if name.ends_with(".zip") {
            Ok(ArchiveFormat::Zip)
        } else {
            UnknownFormatSnafu {
                path: path.to_path_buf(),
            }
            .fail()
        }
    }

    fn tar_decoder(self, file: File) -> Option<Box<dyn std::io::Read>> {
        match self {
            ArchiveFormat::Tar => Some(Box::new(file)),
            ArchiveFormat::TarGz => Some(Box::new(flate2::read::GzDecoder::new(file))),
            ArchiveFormat::TarXz => Some(Box::new(xz2::read::XzDecoder::new(file))),
            ArchiveFormat::TarBz2 => Some(Box::new(bzip2::read::BzDecoder::new(file))),
            ArchiveFormat::Zip => None,
        }
    }
}

/// A tar or zip archive on disk, exposing the same primitives regardless of
/// which container format it is: its bare name, whether it unpacks into a
/// single top-level directory, and extraction with optional leading-path
/// stripping.
pub struct ArchiveFile {
    path: PathBuf,
    format: ArchiveFormat,
}

impl ArchiveFile {
    pub fn open(path: &Path) -> Result<Self> {
        let format = ArchiveFormat::detect(path)?;
        Ok(ArchiveFile {
            path: path.to_path_buf(),
            format,
        })
    }

    /// Filesystem-safe stem derived from the archive's file name, with
    /// compression/container suffixes stripped.
    pub fn stem(&self) -> String {
        archive_subdir_name(&self.path)
    }

    /// Top-level path components across every member of the archive.
    fn toplevel_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for member in list_members(&self.path, self.format)? {
            if let Some(first) = member.components().next() {
                let name = first.as_os_str().to_string_lossy().to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// True if every member of the archive lives under exactly one
    /// top-level directory name.
    pub fn has_single_toplevel(&self) -> Result<bool> {
        Ok(self.toplevel_names()?.len() == 1)
    }

    /// The single top-level directory name. Fails if the archive does not
    /// unpack into exactly one.
    pub fn subdir(&self) -> Result<String> {
        let names = self.toplevel_names()?;
        if names.len() == 1 {
            Ok(names.into_iter().next().unwrap())
        } else {
            NoSingleToplevelSnafu {
                path: self.path.clone(),
            }
            .fail()
        }
    }

    /// Extract into `output`, optionally stripping `strip` leading path
    /// components from every member.
    pub fn extract(&self, output: &Path, strip: usize) -> Result<()> {
        match self.format {
            ArchiveFormat::Zip => extract_zip(&self.path, output, strip),
            _ => safe_extract_tar(&self.path, output, self.format, strip),
        }
    }

    /// Reproducible zip -> tar.xz conversion: per-entry size and mtime are
    /// derived from the zip directory entry; directories get mode 0o755,
    /// files mode 0o644.
    pub fn to_tar_xz(&self, output: &Path) -> Result<()> {
        if self.format != ArchiveFormat::Zip {
            return UnknownFormatSnafu {
                path: self.path.clone(),
            }
            .fail();
        }
        zip_to_tar_xz(&self.path, output)
    }
}

fn list_members(path: &Path, format: ArchiveFormat) -> Result<Vec<PathBuf>> {
    match format {
        ArchiveFormat::Zip => {
            let file = File::open(path).context(OpenSnafu { path })?;
            let archive = zip::ZipArchive::new(file)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
                .context(ReadSnafu { path })?;
            Ok(archive
                .file_names()
                .map(PathBuf::from)
                .collect::<Vec<_>>())
        }
        other => {
            let file = File::open(path).context(OpenSnafu { path })?;
            let reader = other.tar_decoder(file).ok_or_else(|| Error::UnknownFormat {
                path: path.to_path_buf(),
            })?;
            let mut archive = Archive::new(reader);
            let mut members = Vec::new();
            for entry in archive.entries().context(ReadSnafu { path })? {
                let entry = entry.context(ReadSnafu { path })?;
                members.push(entry.path().context(ReadSnafu { path })?.to_path_buf());
            }
            Ok(members)
        }
    }
}

/// Reject a tar member whose path is absolute or contains a `..` component,
/// the way `tar_safe_extractall()` does before trusting anything in the
/// member's header.
fn is_member_safe(member_path: &Path) -> bool {
    if member_path.is_absolute() {
        return false;
    }
    !member_path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

/// Remove the first `strip` components of `member_path`, or return `None`
/// if the member has fewer separators than `strip` (it is skipped).
fn stripped(member_path: &Path, strip: usize) -> Option<PathBuf> {
    if strip == 0 {
        return Some(member_path.to_path_buf());
    }
    let components: Vec<_> = member_path.components().collect();
    let separators = components.len().saturating_sub(1);
    if separators < strip {
        return None;
    }
    let rest: PathBuf = components.into_iter().skip(strip).collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Extract a tar-family archive into `dest`, applying the two-phase safe
/// extraction described above. `dest` must already exist.
pub fn safe_extract_tar(path: &Path, dest: &Path, format: ArchiveFormat, strip: usize) -> Result<()> {
    let file = File::open(path).context(OpenSnafu { path })?;
    let reader = match format.tar_decoder(file) {
        Some(reader) => reader,
        None => return extract_zip(path, dest, strip),
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_unpack_xattrs(false);

    let mut directories: Vec<(PathBuf, u32, u64)> = Vec::new();

    for entry in archive.entries().context(ReadSnafu { path })? {
        let mut entry = entry.context(ReadSnafu { path })?;
        let member_path = entry.path().context(ReadSnafu { path })?.to_path_buf();

        if !is_member_safe(&member_path) {
            log::warn!("skipping unsafe archive member {member_path:?} in {path:?}: escapes destination");
            continue;
        }

        let member_path = match stripped(&member_path, strip) {
            Some(p) => p,
            None => {
                log::info!("skipping archive member {member_path:?}: fewer than {strip} leading components");
                continue;
            }
        };

        let target = dest.join(&member_path);

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target).context(ExtractSnafu {
                path: path.to_path_buf(),
                dest: target.clone(),
            })?;
            // Record the member's real mode/mtime now, while the tar entry is
            // in hand, then apply a transient permissive mode so later
            // members nested under a restrictively-permissioned directory
            // can still be written. The real mode/mtime are reapplied in the
            // deepest-first pass below.
            let mode = entry.header().mode().unwrap_or(0o755);
            let mtime = entry.header().mtime().unwrap_or(0);
            let mut perms = std::fs::metadata(&target)
                .context(ExtractSnafu {
                    path: path.to_path_buf(),
                    dest: target.clone(),
                })?
                .permissions();
            std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
            std::fs::set_permissions(&target, perms).context(ExtractSnafu {
                path: path.to_path_buf(),
                dest: target.clone(),
            })?;
            directories.push((target, mode, mtime));
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).context(ExtractSnafu {
                path: path.to_path_buf(),
                dest: parent.to_path_buf(),
            })?;
        }

        entry.unpack(&target).context(ExtractSnafu {
            path: path.to_path_buf(),
            dest: target.clone(),
        })?;
    }

    // Second pass: apply real directory mode/mtime deepest-first, so a
    // restrictive parent mode never blocks fixing up its own children. The
    // root `.` entry, if present among `directories`, is left untouched.
    directories.sort_by_key(|(p, _, _)| std::cmp::Reverse(p.components().count()));
    for (dir, mode, mtime) in directories {
        if dir == dest {
            continue;
        }
        let mut perms = std::fs::metadata(&dir)
            .context(ExtractSnafu {
                path: path.to_path_buf(),
                dest: dir.clone(),
            })?
            .permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, mode);
        std::fs::set_permissions(&dir, perms).context(ExtractSnafu {
            path: path.to_path_buf(),
            dest: dir.clone(),
        })?;
        let mtime = filetime::FileTime::from_unix_time(mtime as i64, 0);
        filetime::set_file_mtime(&dir, mtime).context(ExtractSnafu {
            path: path.to_path_buf(),
            dest: dir.clone(),
        })?;
    }

    Ok(())
}

fn extract_zip(path: &Path, dest: &Path, strip: usize) -> Result<()> {
    let file = File::open(path).context(OpenSnafu { path })?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
        .context(ReadSnafu { path })?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
            .context(ReadSnafu { path })?;

        // Normalize: `enclosed_name()` already strips drive letters and
        // rejects absolute/`..` components, collapsing empty/`.` parts.
        let member_path = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => {
                log::warn!("skipping unsafe zip member {:?} in {path:?}", entry.name());
                continue;
            }
        };

        let member_path = match stripped(&member_path, strip) {
            Some(p) => p,
            None => {
                log::info!("skipping zip member {member_path:?}: fewer than {strip} leading components");
                continue;
            }
        };

        let target = dest.join(&member_path);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).context(ExtractSnafu {
                path: path.to_path_buf(),
                dest: target.clone(),
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).context(ExtractSnafu {
                path: path.to_path_buf(),
                dest: parent.to_path_buf(),
            })?;
        }

        let mut out = File::create(&target).context(ExtractSnafu {
            path: path.to_path_buf(),
            dest: target.clone(),
        })?;
        std::io::copy(&mut entry, &mut out).context(ExtractSnafu {
            path: path.to_path_buf(),
            dest: target.clone(),
        })?;
    }

    Ok(())
}

/// Repackage a zip archive as a reproducible tar.xz: per-entry size and
/// mtime come from the zip directory entry rather than wall-clock time,
/// directories get mode 0o755 and files mode 0o644.
fn zip_to_tar_xz(path: &Path, output: &Path) -> Result<()> {
    let file = File::open(path).context(OpenSnafu { path })?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
        .context(ReadSnafu { path })?;

    let out = File::create(output).context(CreateSnafu {
        path: output.to_path_buf(),
    })?;
    let xz = xz2::write::XzEncoder::new(out, 6);
    let mut builder = tar::Builder::new(xz);

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
            .context(ReadSnafu { path })?;

        let member_path = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => {
                log::warn!("skipping unsafe zip member {:?} in {path:?}", entry.name());
                continue;
            }
        };

        let dos_time = entry.last_modified();
        let mtime = chrono::NaiveDate::from_ymd_opt(
            dos_time.year() as i32,
            dos_time.month() as u32,
            dos_time.day() as u32,
        )
        .and_then(|date| {
            date.and_hms_opt(
                dos_time.hour() as u32,
                dos_time.minute() as u32,
                dos_time.second() as u32,
            )
        })
        .map(|dt| dt.and_utc().timestamp().max(0) as u64)
        .unwrap_or(0);

        let mut header = tar::Header::new_gnu();
        header.set_mtime(mtime);
        header.set_path(&member_path).context(CreateSnafu {
            path: output.to_path_buf(),
        })?;

        if entry.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            header.set_cksum();
            builder
                .append(&header, std::io::empty())
                .context(CreateSnafu {
                    path: output.to_path_buf(),
                })?;
            continue;
        }

        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(entry.size());
        header.set_cksum();

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).context(ReadSnafu { path })?;
        builder
            .append(&header, buf.as_slice())
            .context(CreateSnafu {
                path: output.to_path_buf(),
            })?;
    }

    builder.finish().context(CreateSnafu {
        path: output.to_path_buf(),
    })?;
    Ok(())
}

/// Read the content of a single file inside a tar archive, without
/// extracting the rest of it (used to peek at `meta.yml` from an uploaded
/// source archive before fully unpacking it).
pub fn read_tar_member(path: &Path, member: &str, format: ArchiveFormat) -> Result<Vec<u8>> {
    let file = File::open(path).context(OpenSnafu { path })?;
    let reader = format.tar_decoder(file).ok_or_else(|| Error::UnknownFormat {
        path: path.to_path_buf(),
    })?;
    let mut archive = Archive::new(reader);
    for entry in archive.entries().context(ReadSnafu { path })? {
        let mut entry = entry.context(ReadSnafu { path })?;
        if entry.path().context(ReadSnafu { path })?.ends_with(member) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).context(ReadSnafu { path })?;
            return Ok(buf);
        }
    }
    Err(Error::Read {
        path: path.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("member {member} not found"),
        ),
    })
}

/// Returns a filesystem-safe directory name derived from an archive's
/// top-level stem, used when extracting an uploaded source archive into a
/// workspace subdirectory.
pub fn archive_subdir_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    sanitized_stem(&stem)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_known_formats() {
        assert_eq!(
            ArchiveFormat::detect(Path::new("foo.tar.gz")).unwrap(),
            ArchiveFormat::TarGz
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("foo.tar.xz")).unwrap(),
            ArchiveFormat::TarXz
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("foo.zip")).unwrap(),
            ArchiveFormat::Zip
        );
        assert!(ArchiveFormat::detect(Path::new("foo.rar")).is_err());
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(!is_member_safe(Path::new("../../etc/passwd")));
        assert!(!is_member_safe(Path::new("/etc/passwd")));
        assert!(is_member_safe(Path::new("src/main.rs")));
    }

    #[test]
    fn sanitizes_subdir_name() {
        assert_eq!(archive_subdir_name(Path::new("/tmp/my pkg 1.0.tar.gz")), "my-pkg-1.0.tar");
    }

    #[test]
    fn strip_skips_shallow_members_and_removes_leading_components() {
        assert_eq!(
            stripped(Path::new("pkg-1.0/src/main.rs"), 1),
            Some(PathBuf::from("src/main.rs"))
        );
        assert_eq!(stripped(Path::new("pkg-1.0"), 1), None);
        assert_eq!(
            stripped(Path::new("a/b/c"), 0),
            Some(PathBuf::from("a/b/c"))
        );
    }
}
