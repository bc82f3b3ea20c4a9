//! In-memory virtual file system for packbox projects.
//!
//! Files live in a flat map keyed by normalised path. There are no real
//! directories: a path "is" a directory when some longer key extends it.
//! Every mutation can optionally be forwarded to a [`VfsMirror`] so an
//! out-of-thread twin stays in sync.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

/// Default working directory for a fresh project FS.
pub const DEFAULT_CWD: &str = "/app";

/// A single stored file. Entry flags survive content rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(default)]
    pub contents: String,
    #[serde(rename = "isEntry", default, skip_serializing_if = "Option::is_none")]
    pub is_entry: Option<bool>,
    #[serde(rename = "isJsEntry", default, skip_serializing_if = "Option::is_none")]
    pub is_js_entry: Option<bool>,
}

impl FileRecord {
    #[must_use]
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            is_entry: None,
            is_js_entry: None,
        }
    }

    fn merge_onto(self, existing: Option<&Self>) -> Self {
        Self {
            contents: self.contents,
            is_entry: self.is_entry.or_else(|| existing.and_then(|x| x.is_entry)),
            is_js_entry: self
                .is_js_entry
                .or_else(|| existing.and_then(|x| x.is_js_entry)),
        }
    }
}

/// A mutation applied to the FS, in the shape it crosses thread boundaries.
///
/// Operation tags carry the mangled `fs__` prefix so a remote twin can expose
/// the same call table transparently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum VfsOp {
    #[serde(rename = "fs__writeFile")]
    WriteFile { path: String, contents: String },
    #[serde(rename = "fs__appendFile")]
    AppendFile { path: String, contents: String },
    #[serde(rename = "fs__deleteFile")]
    DeleteFile { path: String },
    #[serde(rename = "fs__rmdir")]
    Rmdir { path: String },
    #[serde(rename = "fs__setFiles")]
    SetFiles { files: BTreeMap<String, FileRecord> },
    #[serde(rename = "fs__chdir")]
    Chdir { path: String },
}

/// Capability interface for mirroring mutations to a remote FS twin.
///
/// Invoked after the local mutation has been applied. Forwarding is
/// best-effort; implementations must not fail the local operation.
pub trait VfsMirror: Send + Sync {
    fn forward(&self, op: VfsOp);
}

/// Mirror that ships operations over a flume channel.
pub struct ChannelMirror {
    tx: flume::Sender<VfsOp>,
}

impl ChannelMirror {
    #[must_use]
    pub const fn new(tx: flume::Sender<VfsOp>) -> Self {
        Self { tx }
    }
}

impl VfsMirror for ChannelMirror {
    fn forward(&self, op: VfsOp) {
        if let Err(e) = self.tx.send(op) {
            log::debug!("Dropping mirrored fs op, receiver gone: {e:?}");
        }
    }
}

/// The project file system.
#[derive(Clone)]
pub struct Vfs {
    files: BTreeMap<String, FileRecord>,
    cwd: String,
    mirror: Option<Arc<dyn VfsMirror>>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("cwd", &self.cwd)
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn normalize(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

impl Vfs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            cwd: DEFAULT_CWD.to_string(),
            mirror: None,
        }
    }

    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<dyn VfsMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn forward(&self, op: VfsOp) {
        if let Some(mirror) = &self.mirror {
            mirror.forward(op);
        }
    }

    #[must_use]
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn chdir(&mut self, path: &str) {
        self.cwd = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        self.forward(VfsOp::Chdir {
            path: self.cwd.clone(),
        });
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(normalize(path))
    }

    /// A path is a directory when some stored key extends it by more than a
    /// single separator character. Directories are never materialised.
    #[must_use]
    pub fn is_directory(&self, path: &str) -> bool {
        let path = normalize(path);
        self.files
            .keys()
            .any(|key| key.starts_with(path) && key.len() > path.len() + 1)
    }

    /// Every stored key beginning with `path`, not just immediate children.
    /// Callers filter.
    #[must_use]
    pub fn read_dir(&self, path: &str) -> Vec<String> {
        let path = normalize(path);
        self.files
            .keys()
            .filter(|key| key.starts_with(path))
            .cloned()
            .collect()
    }

    /// Stored contents, or the empty string when absent. Absence is
    /// indistinguishable from an empty file.
    #[must_use]
    pub fn read_file(&self, path: &str) -> String {
        self.files
            .get(normalize(path))
            .map(|record| record.contents.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn read_record(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(normalize(path))
    }

    pub fn write_file(&mut self, path: &str, contents: impl Into<String>) {
        let path = normalize(path).to_string();
        let contents = contents.into();
        let record = FileRecord::new(contents.clone()).merge_onto(self.files.get(&path));
        self.files.insert(path.clone(), record);
        self.forward(VfsOp::WriteFile { path, contents });
    }

    pub fn append_file(&mut self, path: &str, contents: &str) {
        let path = normalize(path).to_string();
        let entry = self.files.entry(path.clone()).or_default();
        entry.contents.push_str(contents);
        self.forward(VfsOp::AppendFile {
            path,
            contents: contents.to_string(),
        });
    }

    pub fn delete_file(&mut self, path: &str) {
        let path = normalize(path).to_string();
        self.files.remove(&path);
        self.forward(VfsOp::DeleteFile { path });
    }

    /// Removes every key beneath `path`.
    pub fn rmdir(&mut self, path: &str) {
        let path = normalize(path).to_string();
        self.files.retain(|key, _| !key.starts_with(&path));
        self.forward(VfsOp::Rmdir { path });
    }

    /// Shallow-merges each supplied record onto any existing record for that
    /// path: omitted entry flags preserve the stored ones.
    pub fn set_files(&mut self, files: BTreeMap<String, FileRecord>) {
        let mut normalized = BTreeMap::new();
        for (path, record) in files {
            let path = normalize(&path).to_string();
            let merged = record.merge_onto(self.files.get(&path));
            self.files.insert(path.clone(), merged.clone());
            normalized.insert(path, merged);
        }
        self.forward(VfsOp::SetFiles { files: normalized });
    }

    /// Snapshot of every stored record.
    #[must_use]
    pub fn raw_files(&self) -> BTreeMap<String, FileRecord> {
        self.files.clone()
    }

    /// Snapshot of path to text, for engine consumption.
    #[must_use]
    pub fn text_files(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(path, record)| (path.clone(), record.contents.clone()))
            .collect()
    }

    pub fn reset(&mut self) {
        self.files.clear();
        self.cwd = DEFAULT_CWD.to_string();
    }

    pub fn reset_to(&mut self, files: BTreeMap<String, FileRecord>) {
        self.reset();
        self.set_files(files);
    }

    /// Replays a mirrored operation locally. Does not re-forward.
    pub fn apply(&mut self, op: VfsOp) {
        let mirror = self.mirror.take();
        match op {
            VfsOp::WriteFile { path, contents } => self.write_file(&path, contents),
            VfsOp::AppendFile { path, contents } => self.append_file(&path, &contents),
            VfsOp::DeleteFile { path } => self.delete_file(&path),
            VfsOp::Rmdir { path } => self.rmdir(&path),
            VfsOp::SetFiles { files } => self.set_files(files),
            VfsOp::Chdir { path } => self.chdir(&path),
        }
        self.mirror = mirror;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn normalizes_leading_slash_on_write_and_read() {
        let mut fs = Vfs::new();
        fs.write_file("/a/b", "x");

        assert_eq!(fs.read_file("a/b"), "x");
        assert_eq!(fs.read_file("/a/b"), "x");
        assert!(fs.exists("a/b"));
        assert!(fs.exists("/a/b"));
    }

    #[test_log::test]
    fn read_file_returns_empty_string_for_missing_path() {
        let fs = Vfs::new();
        assert_eq!(fs.read_file("/nope"), "");
    }

    #[test_log::test]
    fn is_directory_requires_a_longer_key() {
        let mut fs = Vfs::new();
        fs.write_file("/app/src/index.js", "x");

        assert!(fs.is_directory("/app"));
        assert!(fs.is_directory("/app/src"));
        assert!(!fs.is_directory("/app/src/index.js"));
        assert!(!fs.is_directory("/missing"));
    }

    #[test_log::test]
    fn read_dir_returns_every_key_with_prefix() {
        let mut fs = Vfs::new();
        fs.write_file("/app/a.js", "a");
        fs.write_file("/app/sub/b.js", "b");
        fs.write_file("/other/c.js", "c");

        let mut entries = fs.read_dir("/app");
        entries.sort();
        assert_eq!(entries, vec!["app/a.js".to_string(), "app/sub/b.js".to_string()]);
    }

    #[test_log::test]
    fn write_file_preserves_entry_flags() {
        let mut fs = Vfs::new();
        fs.set_files(BTreeMap::from([(
            "/app/index.js".to_string(),
            FileRecord {
                contents: "old".to_string(),
                is_entry: Some(true),
                is_js_entry: Some(true),
            },
        )]));

        fs.write_file("/app/index.js", "new");

        let record = fs.read_record("app/index.js").unwrap();
        assert_eq!(record.contents, "new");
        assert_eq!(record.is_entry, Some(true));
        assert_eq!(record.is_js_entry, Some(true));
    }

    #[test_log::test]
    fn set_files_shallow_merges_onto_existing_records() {
        let mut fs = Vfs::new();
        fs.set_files(BTreeMap::from([(
            "a.js".to_string(),
            FileRecord {
                contents: "one".to_string(),
                is_entry: Some(true),
                is_js_entry: None,
            },
        )]));

        fs.set_files(BTreeMap::from([(
            "/a.js".to_string(),
            FileRecord::new("two"),
        )]));

        let record = fs.read_record("a.js").unwrap();
        assert_eq!(record.contents, "two");
        assert_eq!(record.is_entry, Some(true));
    }

    #[test_log::test]
    fn rmdir_removes_the_whole_subtree() {
        let mut fs = Vfs::new();
        fs.write_file("/app/a.js", "a");
        fs.write_file("/app/sub/b.js", "b");
        fs.write_file("/other/c.js", "c");

        fs.rmdir("/app");

        assert!(!fs.exists("/app/a.js"));
        assert!(!fs.exists("/app/sub/b.js"));
        assert!(fs.exists("/other/c.js"));
    }

    #[test_log::test]
    fn append_file_creates_then_extends() {
        let mut fs = Vfs::new();
        fs.append_file("/log.txt", "a");
        fs.append_file("log.txt", "b");

        assert_eq!(fs.read_file("/log.txt"), "ab");
    }

    #[test_log::test]
    fn mutations_forward_to_the_mirror() {
        let (tx, rx) = flume::unbounded();
        let mut fs = Vfs::new().with_mirror(Arc::new(ChannelMirror::new(tx)));

        fs.write_file("/a", "1");
        fs.append_file("/a", "2");
        fs.delete_file("/a");

        let ops = rx.drain().collect::<Vec<_>>();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], VfsOp::WriteFile { path, contents } if path == "a" && contents == "1"));
        assert!(matches!(&ops[1], VfsOp::AppendFile { path, .. } if path == "a"));
        assert!(matches!(&ops[2], VfsOp::DeleteFile { path } if path == "a"));
    }

    #[test_log::test]
    fn apply_replays_mirrored_ops_into_a_twin() {
        let (tx, rx) = flume::unbounded();
        let mut primary = Vfs::new().with_mirror(Arc::new(ChannelMirror::new(tx)));
        let mut twin = Vfs::new();

        primary.write_file("/app/x.js", "x");
        primary.append_file("/app/x.js", "y");

        for op in rx.drain() {
            twin.apply(op);
        }

        assert_eq!(twin.read_file("/app/x.js"), "xy");
    }

    #[test_log::test]
    fn ops_serialize_under_mangled_names() {
        let op = VfsOp::WriteFile {
            path: "a".to_string(),
            contents: "b".to_string(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "fs__writeFile");
    }

    #[test_log::test]
    fn default_cwd_is_app() {
        let mut fs = Vfs::new();
        assert_eq!(fs.cwd(), "/app");

        fs.chdir("project");
        assert_eq!(fs.cwd(), "/project");
    }
}
