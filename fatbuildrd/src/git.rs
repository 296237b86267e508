//! Patch queue and the Git repository that backs it.
//!
//! Grounded on `git.py`: a build's patch queue is a small Git repository
//! created under the build place, one commit per patch, with deb822-style
//! metadata (`Description`, `Author`, `Forwarded`, `Last-Update`, `Generic`)
//! stored in the commit message. Patches on disk and commits in the queue
//! convert back and forth via `import_patches`/`export_queue`.
//!
//! There is no `git2`/`libgit2` binding anywhere in the dependency stack, so
//! every operation shells out to the `git` binary with `duct`, following the
//! same capture-and-check idiom as `containers.rs`/`images.rs`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use duct::cmd;
use lazy_static::lazy_static;
use minijinja::Value;
use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::templates::Templeter;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to run git {args}: {source}"))]
    Command { args: String, source: std::io::Error },

    #[snafu(display("git {args} failed: {stderr}"))]
    Failed { args: String, stderr: String },

    #[snafu(display("commit {hash} has no parent to diff against"))]
    NoParent { hash: String },

    #[snafu(display("patch queue has no commits"))]
    EmptyHistory,

    #[snafu(display("unable to read patch file {path:?}: {source}"))]
    ReadPatch { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to write patch file {path:?}: {source}"))]
    WritePatch { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to rename patch file {path:?}: {source}"))]
    RenamePatch { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to remove patch file {path:?}: {source}"))]
    RemovePatch { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to create patches directory {path:?}: {source}"))]
    CreateDir { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to list patches directory {path:?}: {source}"))]
    ListDir { path: PathBuf, source: std::io::Error },

    #[snafu(display("malformed author field {field:?}"))]
    MalformedAuthor { field: String },

    #[snafu(transparent)]
    Render { source: crate::templates::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A deb822-style metadata paragraph: an ordered list of `Key: value`
/// fields, in insertion order (matching `debian.deb822.Deb822`'s dict
/// behaviour, which Python preserves in declaration order).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchMeta(Vec<(String, String)>);

impl PatchMeta {
    pub fn new() -> Self {
        PatchMeta::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.0.push((key.to_string(), value));
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|(k, _)| k != key);
    }

    /// Parse the header paragraph of a patch file: `Key: value` lines up to
    /// the first blank line.
    pub fn parse(text: &str) -> Self {
        let mut meta = PatchMeta::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                meta.set(key.trim(), value.trim());
            }
        }
        meta
    }
}

impl fmt::Display for PatchMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.0 {
            writeln!(f, "{key}: {value}")?;
        }
        Ok(())
    }
}

/// Extracts the deb822 metadata carried in a patch-queue commit message: the
/// title occupies the first line, a blank line follows, then the fields.
fn parse_commit_meta(message: &str) -> PatchMeta {
    match message.splitn(3, '\n').nth(2) {
        Some(rest) => PatchMeta::parse(rest),
        None => PatchMeta::new(),
    }
}

fn is_meta_generic(meta: &PatchMeta) -> bool {
    meta.get("Generic") == Some("yes")
}

lazy_static! {
    static ref AUTHOR_RE: Regex = Regex::new(r"^(?P<author>.+) <(?P<email>.+)>$").unwrap();
}

fn parse_author(field: &str) -> Result<(String, String)> {
    let caps = AUTHOR_RE
        .captures(field)
        .context(MalformedAuthorSnafu { field: field.to_string() })?;
    Ok((caps["author"].to_string(), caps["email"].to_string()))
}

/// The `<artifact build place>/patches` directory and its two subdirectories:
/// `generic` (applies to every version) and one named after the artifact's
/// version (applies only to that version).
#[derive(Debug, Clone)]
pub struct PatchesDir {
    path: PathBuf,
    version: String,
}

impl PatchesDir {
    pub fn new(place: &Path, version: &str) -> Self {
        PatchesDir {
            path: place.join("patches"),
            version: version.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generic_subdir(&self) -> PatchesSubdir {
        PatchesSubdir::new(self.path.clone(), "generic".to_string())
    }

    pub fn version_subdir(&self) -> PatchesSubdir {
        PatchesSubdir::new(self.path.clone(), self.version.clone())
    }

    pub fn subdirs(&self) -> [PatchesSubdir; 2] {
        [self.generic_subdir(), self.version_subdir()]
    }

    pub fn empty(&self) -> bool {
        !self.generic_subdir().exists() && !self.version_subdir().exists()
    }

    pub fn ensure(&self) -> Result<()> {
        if !self.path.exists() {
            log::debug!("creating artifact patches directory {}", self.path.display());
            std::fs::create_dir(&self.path).context(CreateDirSnafu { path: self.path.clone() })?;
            set_mode_0755(&self.path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PatchesSubdir {
    parent: PathBuf,
    path: PathBuf,
}

impl PatchesSubdir {
    fn new(parent: PathBuf, name: String) -> Self {
        let path = parent.join(&name);
        PatchesSubdir { parent, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn patches(&self) -> Result<Vec<PatchFile>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut patches: Vec<PatchFile> = std::fs::read_dir(&self.path)
            .context(ListDirSnafu { path: self.path.clone() })?
            .filter_map(|entry| entry.ok())
            .map(|entry| PatchFile::new(entry.path()))
            .collect();
        patches.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(patches)
    }

    pub fn ensure(&self) -> Result<()> {
        if !self.parent.exists() {
            log::debug!("creating artifact patches directory {}", self.parent.display());
            std::fs::create_dir(&self.parent).context(CreateDirSnafu { path: self.parent.clone() })?;
            set_mode_0755(&self.parent)?;
        }
        if !self.path.exists() {
            log::debug!("creating patches subdirectory {}", self.path.display());
            std::fs::create_dir(&self.path).context(CreateDirSnafu { path: self.path.clone() })?;
            set_mode_0755(&self.path)?;
        }
        Ok(())
    }

    pub fn clean(&self) -> Result<()> {
        for patch in self.patches()? {
            log::debug!("removing old patch {}", patch.fullname());
            patch.remove()?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode_0755(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .context(CreateDirSnafu { path: path.to_path_buf() })
}

#[cfg(not(unix))]
fn set_mode_0755(_path: &Path) -> Result<()> {
    Ok(())
}

/// A single patch file on disk: deb822 metadata header, blank line, unified
/// diff body.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PatchFile {
    path: PathBuf,
}

impl PatchFile {
    pub fn new(path: PathBuf) -> Self {
        PatchFile { path }
    }

    pub fn create(subdir: &PatchesSubdir, title: &str) -> Self {
        PatchFile::new(subdir.path().join(title))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn fullname(&self) -> String {
        let parent = self
            .path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{parent}/{}", self.name())
    }

    pub fn content(&self) -> Result<String> {
        std::fs::read_to_string(&self.path).context(ReadPatchSnafu { path: self.path.clone() })
    }

    /// First line of the commit title embedded in the filename, i.e. the
    /// filename with its leading `NNNN-` ordinal stripped.
    pub fn title(&self) -> String {
        self.name().splitn(2, '-').nth(1).unwrap_or("").to_string()
    }

    pub fn meta(&self) -> Result<PatchMeta> {
        let content = self.content()?;
        let header = match content.split_once("\n\n") {
            Some((header, _)) => header,
            None => &content,
        };
        Ok(PatchMeta::parse(header))
    }

    pub const TEMPLATE_KEY: &'static str = "Template";

    pub fn is_template(&self) -> Result<bool> {
        Ok(self.meta()?.get(Self::TEMPLATE_KEY) == Some("yes"))
    }

    pub fn render(&self, context: &BTreeMap<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("swp");
        std::fs::rename(&self.path, &tmp).context(RenamePatchSnafu { path: self.path.clone() })?;
        log::info!("rendering patch template {}", self.path.display());
        let rendered = Templeter::new().frender(&tmp, context)?;
        std::fs::write(&self.path, rendered).context(WritePatchSnafu { path: self.path.clone() })?;
        std::fs::remove_file(&tmp).context(RemovePatchSnafu { path: tmp })?;
        Ok(())
    }

    pub fn in_field(&self, field: &str, value: &str) -> Result<bool> {
        Ok(self
            .meta()?
            .get(field)
            .map(|v| v.split(' ').any(|part| part == value))
            .unwrap_or(false))
    }

    pub fn generic(&self) -> bool {
        self.path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n == "generic")
            .unwrap_or(false)
    }

    pub fn write(&self, meta: &PatchMeta, diff: &str) -> Result<()> {
        let content = format!("{meta}\n{diff}");
        std::fs::write(&self.path, content).context(WritePatchSnafu { path: self.path.clone() })
    }

    pub fn rename(&self, to: &Path) -> Result<()> {
        std::fs::rename(&self.path, to).context(RenamePatchSnafu { path: self.path.clone() })
    }

    pub fn remove(&self) -> Result<()> {
        std::fs::remove_file(&self.path).context(RemovePatchSnafu { path: self.path.clone() })
    }
}

/// A commit read back from the patch-queue repository.
#[derive(Debug, Clone)]
pub struct Commit {
    pub hash: String,
    pub parents: Vec<String>,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
}

/// The Git repository backing a build's patch queue.
pub struct GitRepository {
    path: PathBuf,
}

impl GitRepository {
    /// Initialize a fresh repository at `path` (which must already exist),
    /// with an empty initial commit and, if given, a commit message
    /// template registered in the repository's local config.
    pub fn init(
        path: &Path,
        author: &str,
        email: &str,
        message_template: Option<&Path>,
    ) -> Result<Self> {
        let gitignore = path.join(".gitignore");
        if gitignore.exists() {
            log::info!(
                "removing .gitignore before initializing git repository {}",
                path.display()
            );
            std::fs::remove_file(&gitignore).context(RemovePatchSnafu { path: gitignore })?;
        }

        let repo = GitRepository { path: path.to_path_buf() };
        repo.run_checked(&["init"])?;
        repo.commit("Initial commit", &PatchMeta::new(), author, email, None, true)?;

        if let Some(template) = message_template {
            if !template.exists() {
                log::warn!(
                    "unable to find git commit message template {}, ignoring",
                    template.display()
                );
            } else {
                repo.run_checked(&["config", "commit.template", &template.to_string_lossy()])?;
            }
        }
        Ok(repo)
    }

    fn run_checked(&self, args: &[&str]) -> Result<String> {
        log::debug!("running command: git {}", args.join(" "));
        let output = cmd("git", args)
            .dir(&self.path)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .with_context(|_| CommandSnafu { args: args.join(" ") })?;
        if !output.status.success() {
            return FailedSnafu {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }
            .fail();
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn commit(
        &self,
        title: &str,
        meta: &PatchMeta,
        author: &str,
        email: &str,
        files: Option<&[PathBuf]>,
        allow_empty: bool,
    ) -> Result<()> {
        match files {
            Some(files) => {
                for file in files {
                    self.run_checked(&["add", &file.to_string_lossy()])?;
                }
            }
            None => {
                self.run_checked(&["add", "-A"])?;
            }
        }
        let message = format!("{title}\n\n{meta}");
        let user_name = format!("user.name={author}");
        let user_email = format!("user.email={email}");
        let mut args = vec!["-c", &user_name, "-c", &user_email, "commit", "-m", &message];
        if allow_empty {
            args.push("--allow-empty");
        }
        self.run_checked(&args)?;
        Ok(())
    }

    /// Commits in topological order, newest first (matching `git log`'s
    /// default and `pygit2.GIT_SORT_TOPOLOGICAL`).
    pub fn walker(&self) -> Result<Vec<Commit>> {
        let out = self.run_checked(&["log", "--topo-order", "--format=%H"])?;
        out.lines().map(|hash| self.commit_info(hash)).collect()
    }

    fn commit_info(&self, hash: &str) -> Result<Commit> {
        let format = "--format=%P%x00%an%x00%ae%x00%B";
        let out = self.run_checked(&["show", "-s", format, hash])?;
        let mut parts = out.splitn(4, '\u{0}');
        let parents = parts
            .next()
            .unwrap_or("")
            .split_whitespace()
            .map(String::from)
            .collect();
        let author_name = parts.next().unwrap_or("").to_string();
        let author_email = parts.next().unwrap_or("").to_string();
        let message = parts.next().unwrap_or("").trim_end_matches('\n').to_string();
        Ok(Commit {
            hash: hash.to_string(),
            parents,
            author_name,
            author_email,
            message,
        })
    }

    /// Diff between `commit` and its first parent. `None` when the diff is
    /// empty.
    pub fn diff(&self, commit: &Commit) -> Result<Option<String>> {
        let parent = commit
            .parents
            .first()
            .context(NoParentSnafu { hash: commit.hash.clone() })?;
        let out = self.run_checked(&["diff", parent, &commit.hash])?;
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    pub fn import_patches(&self, patches_dir: &PatchesDir) -> Result<()> {
        for subdir in patches_dir.subdirs() {
            self.import_patches_subdir(&subdir)?;
        }
        Ok(())
    }

    fn import_patches_subdir(&self, subdir: &PatchesSubdir) -> Result<()> {
        if !subdir.exists() {
            return Ok(());
        }
        for patch in subdir.patches()? {
            self.apply_patch(&patch)?;
        }
        Ok(())
    }

    fn apply_patch(&self, patch: &PatchFile) -> Result<()> {
        let mut meta = patch.meta()?;
        let mut author = "Unknown Author".to_string();
        let mut email = "unknown@email.com".to_string();
        let mut author_key = None;
        for key in ["Author", "From"] {
            if meta.contains_key(key) {
                author_key = Some(key);
            }
        }
        if let Some(key) = author_key {
            let (a, e) = parse_author(meta.get(key).unwrap())?;
            author = a;
            email = e;
            meta.remove(key);
        }

        if patch.generic() {
            meta.set("Generic", "yes");
        }

        log::info!("applying patch {}", patch.fullname());
        let content = patch.content()?;
        let output = cmd(
            "patch",
            &["--force", "--no-backup-if-mismatch", "--reject-file=-", "-p1"],
        )
        .dir(&self.path)
        .stdin_bytes(content.into_bytes())
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked()
        .run()
        .with_context(|_| CommandSnafu { args: "patch -p1".to_string() })?;
        if !output.status.success() {
            return FailedSnafu {
                args: format!("patch -p1 < {}", patch.fullname()),
                stderr: String::from_utf8_lossy(&output.stdout).to_string(),
            }
            .fail();
        }

        self.commit(&patch.title(), &meta, &author, &email, None, false)
    }

    /// Export every commit in the repository (but not the root commit) into
    /// successive patch files under `patches_dir`, replacing whatever was
    /// there before.
    pub fn export_queue(&self, patches_dir: &PatchesDir) -> Result<()> {
        patches_dir.ensure()?;
        for subdir in patches_dir.subdirs() {
            subdir.clean()?;
        }

        let commits = self.walker()?;
        let mut index_generic = 0u32;
        let mut index_version = 0u32;
        for commit in &commits {
            if commit.parents.is_empty() {
                break;
            }
            let meta = parse_commit_meta(&commit.message);
            if is_meta_generic(&meta) {
                index_generic += 1;
            } else {
                index_version += 1;
            }
        }

        log::debug!(
            "found {index_generic} generic and {index_version} version specific commits in patch queue"
        );

        for commit in &commits {
            if commit.parents.is_empty() {
                break;
            }
            let meta = parse_commit_meta(&commit.message);
            if is_meta_generic(&meta) {
                self.export_commit(&patches_dir.generic_subdir(), index_generic, commit, meta)?;
                index_generic -= 1;
            } else {
                self.export_commit(&patches_dir.version_subdir(), index_version, commit, meta)?;
                index_version -= 1;
            }
        }
        Ok(())
    }

    fn export_commit(
        &self,
        subdir: &PatchesSubdir,
        index: u32,
        commit: &Commit,
        mut meta: PatchMeta,
    ) -> Result<()> {
        meta.set("Author", format!("{} <{}>", commit.author_name, commit.author_email));
        meta.remove("Generic");

        let patch_name = commit.message.lines().next().unwrap_or("").to_string();
        let patch_file = PatchFile::create(subdir, &format!("{index:04}-{patch_name}"));

        log::info!("generating patch file {}", patch_file.fullname());

        match self.diff(commit)? {
            Some(diff) => {
                subdir.ensure()?;
                patch_file.write(&meta, &diff)?;
            }
            None => log::warn!("patch diff is empty, skipping patch generation"),
        }
        Ok(())
    }

    /// Commit the currently staged/working-tree modifications and export the
    /// resulting commit as a new patch file, in one step. Used by the
    /// prescript workflow to turn a script's side effects into a patch.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_export(
        &self,
        subdir: &PatchesSubdir,
        index: u32,
        title: &str,
        author: &str,
        email: &str,
        description: &str,
        files: Option<&[PathBuf]>,
    ) -> Result<()> {
        let mut meta = PatchMeta::new();
        meta.set("Description", description);
        meta.set("Forwarded", "no");
        meta.set("Last-Update", chrono::Local::now().format("%Y-%m-%d").to_string());

        self.commit(title, &meta, author, email, files, false)?;

        let last = self.walker()?.into_iter().next().context(EmptyHistorySnafu)?;
        let commit_meta = parse_commit_meta(&last.message);
        self.export_commit(subdir, index, &last, commit_meta)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn has_git() -> bool {
        cmd("git", ["--version"])
            .stdout_capture()
            .unchecked()
            .run()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn patch_meta_parses_header_and_stops_at_blank_line() {
        let meta = PatchMeta::parse("Description: fix thing\nAuthor: Jane <jane@example.com>\n\n--- a/x\n+++ b/x\n");
        assert_eq!(meta.get("Description"), Some("fix thing"));
        assert_eq!(meta.get("Author"), Some("Jane <jane@example.com>"));
    }

    #[test]
    fn patch_meta_displays_as_deb822_fields() {
        let mut meta = PatchMeta::new();
        meta.set("Description", "example");
        meta.set("Forwarded", "no");
        assert_eq!(meta.to_string(), "Description: example\nForwarded: no\n");
    }

    #[test]
    fn patch_file_title_strips_ordinal_prefix() {
        let patch = PatchFile::new(PathBuf::from("/tmp/patches/generic/0001-fix-build.patch"));
        assert_eq!(patch.title(), "fix-build.patch");
        assert!(patch.generic());
    }

    #[test]
    fn parse_author_extracts_name_and_email() {
        let (name, email) = parse_author("Jane Doe <jane@example.com>").unwrap();
        assert_eq!(name, "Jane Doe");
        assert_eq!(email, "jane@example.com");
    }

    #[test]
    fn patches_dir_empty_when_no_subdir_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let patches_dir = PatchesDir::new(tmp.path(), "1.0");
        assert!(patches_dir.empty());
    }

    #[test]
    fn init_and_commit_roundtrip() {
        if !has_git() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let repo = GitRepository::init(tmp.path(), "Test Author", "test@example.com", None).unwrap();
        std::fs::write(tmp.path().join("file.txt"), "hello\n").unwrap();
        let mut meta = PatchMeta::new();
        meta.set("Description", "add file");
        repo.commit("Add file", &meta, "Test Author", "test@example.com", None, false)
            .unwrap();

        let commits = repo.walker().unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].author_name, "Test Author");
        assert!(commits[1].parents.is_empty());
        assert!(!commits[0].parents.is_empty());
    }

    #[test]
    fn export_then_import_roundtrips_a_patch() {
        if !has_git() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let repo = GitRepository::init(tmp.path(), "Test Author", "test@example.com", None).unwrap();
        std::fs::write(tmp.path().join("file.txt"), "hello\n").unwrap();
        let mut meta = PatchMeta::new();
        meta.set("Description", "add file");
        repo.commit("Add file", &meta, "Test Author", "test@example.com", None, false)
            .unwrap();

        let patches_dir = PatchesDir::new(tmp.path(), "1.0");
        repo.export_queue(&patches_dir).unwrap();
        assert!(!patches_dir.version_subdir().patches().unwrap().is_empty());
    }
}
