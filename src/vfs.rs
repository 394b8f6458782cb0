use std::{
    cell::RefCell,
    fs, io,
    path::{Component, Path, PathBuf},
    rc::Rc,
};

use indexmap::IndexMap;
use miette::Diagnostic;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::merge_at,
    errors::{FileOperation, ParseError},
    transactions::{Active, RollbackOperation, Transaction},
    utils::{normalize_path, path_to_key},
};

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("unable to serialize contents of '{path}'")]
    #[diagnostic(code(kopye_test::vfs::serialize))]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),

    #[error("'{path}' is outside the store root '{root}'")]
    #[diagnostic(
        code(kopye_test::vfs::outside_root),
        help("Use a path relative to the destination root, or an absolute path under it")
    )]
    OutsideRoot { path: PathBuf, root: PathBuf },
}

/// Failure to materialize one entry during [`VirtualFileStore::commit`].
#[derive(Debug, Error, Diagnostic)]
#[error("commit aborted: unable to {operation} '{path}'")]
#[diagnostic(
    code(kopye_test::vfs::commit),
    help("Files created by this commit were rolled back")
)]
pub struct CommitError {
    pub operation: FileOperation,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// The real file system, as seen by commit.
pub trait FsAdapter {
    fn exists(&self, path: &Path) -> bool;
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn mkdir_recursive(&self, path: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FsAdapter for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn mkdir_recursive(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Modified,
    Deleted,
}

/// Contents handed to the store: raw text, or a JSON value serialized on write.
#[derive(Debug, Clone, PartialEq)]
pub enum FileContents {
    Text(String),
    Json(Value),
}
impl From<&str> for FileContents {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}
impl From<String> for FileContents {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
impl From<Value> for FileContents {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    #[serde(skip)]
    pub path: String,
    pub contents: Option<String>,
    pub state_cleared: FileState,
}

/// Ordered view of the store, keyed by path in order of first write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Snapshot(pub IndexMap<String, FileEntry>);
impl Snapshot {
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.0.get(path)
    }

    pub fn contents(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|entry| entry.contents.as_deref())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Store handle shared between a run context and the generator it drives.
pub type SharedStore = Rc<RefCell<VirtualFileStore>>;

/// Pretty JSON with a two-space indent and a trailing newline.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    Ok(text)
}

/// In-memory, path-keyed store of pending file mutations.
#[derive(Debug, Clone, Default)]
pub struct VirtualFileStore {
    root: PathBuf,
    entries: IndexMap<String, FileEntry>,
}

impl VirtualFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: IndexMap::new(),
        }
    }

    pub fn shared(self) -> SharedStore {
        Rc::new(RefCell::new(self))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_root(&mut self, root: impl Into<PathBuf>) {
        self.root = root.into();
    }

    /// Normalized key of `path`. Absolute paths under the root and relative paths land on
    /// the same key.
    pub fn key_for(&self, path: impl AsRef<Path>) -> String {
        let path = normalize_path(path.as_ref());
        let root = normalize_path(&self.root);

        let relative = if path.is_absolute() && !root.as_os_str().is_empty() {
            path.strip_prefix(&root).unwrap_or(path.as_path())
        } else {
            path.as_path()
        };

        path_to_key(relative)
    }

    /// Key of a path the store may hold. Absolute paths outside the root have no key.
    fn owned_key(&self, path: &Path) -> Result<String, StoreError> {
        let key = self.key_for(path);

        let rooted = matches!(
            Path::new(&key).components().next(),
            Some(Component::RootDir | Component::Prefix(_))
        );

        if rooted {
            return Err(StoreError::OutsideRoot {
                path: path.to_path_buf(),
                root: self.root.clone(),
            });
        }

        Ok(key)
    }

    /// Writes `contents` at `path`, marking the entry modified. Returns the store key.
    pub fn write(
        &mut self,
        path: impl AsRef<Path>,
        contents: impl Into<FileContents>,
    ) -> Result<String, StoreError> {
        let key = self.owned_key(path.as_ref())?;

        let text = match contents.into() {
            FileContents::Text(text) => text,
            FileContents::Json(value) => {
                to_pretty_json(&value).map_err(|error| StoreError::Serialize {
                    path: key.clone(),
                    source: error,
                })?
            }
        };

        log::debug!("store write: {}", key);

        // re-inserting an existing key keeps its original position
        self.entries.insert(
            key.clone(),
            FileEntry {
                path: key.clone(),
                contents: Some(text),
                state_cleared: FileState::Modified,
            },
        );

        Ok(key)
    }

    /// Writes `contents` at `base/path`.
    pub fn write_in(
        &mut self,
        base: impl AsRef<Path>,
        path: impl AsRef<Path>,
        contents: impl Into<FileContents>,
    ) -> Result<String, StoreError> {
        self.write(base.as_ref().join(path), contents)
    }

    pub fn write_json<T: Serialize + ?Sized>(
        &mut self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> Result<String, StoreError> {
        let key = self.key_for(path.as_ref());

        let value = serde_json::to_value(value).map_err(|error| StoreError::Serialize {
            path: key,
            source: error,
        })?;

        self.write(path, value)
    }

    /// Deep-merges `partial` into the JSON document at `path` (`{}` when absent).
    pub fn extend_json(
        &mut self,
        path: impl AsRef<Path>,
        partial: Value,
    ) -> Result<String, StoreError> {
        self.write_config(path, "", partial)
    }

    /// Deep-merges `partial` into the JSON document at `config_path`, at the location addressed
    /// by the dotted `key_path`. Earlier merges are never lost; scalar conflicts are last write
    /// wins.
    pub fn write_config(
        &mut self,
        config_path: impl AsRef<Path>,
        key_path: &str,
        partial: Value,
    ) -> Result<String, StoreError> {
        let config_path = config_path.as_ref();

        let mut document = self
            .read_json(config_path)?
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        merge_at(&mut document, key_path, partial);

        self.write(config_path, document)
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<&str> {
        self.entries
            .get(&self.key_for(path))
            .and_then(|entry| entry.contents.as_deref())
    }

    pub fn read_json(&self, path: impl AsRef<Path>) -> Result<Option<Value>, StoreError> {
        let path = path.as_ref();

        let Some(text) = self.read(path) else {
            return Ok(None);
        };

        let value = serde_json::from_str(text)
            .map_err(|error| ParseError::json(path.to_path_buf(), error))?;

        Ok(Some(value))
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.entries
            .get(&self.key_for(path))
            .is_some_and(|entry| entry.state_cleared == FileState::Modified)
    }

    /// Marks `path` deleted; commit removes it from disk.
    pub fn delete(&mut self, path: impl AsRef<Path>) -> Result<String, StoreError> {
        let key = self.owned_key(path.as_ref())?;

        self.entries.insert(
            key.clone(),
            FileEntry {
                path: key.clone(),
                contents: None,
                state_cleared: FileState::Deleted,
            },
        );

        Ok(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.entries.clone())
    }

    /// Materializes every entry under `destination_root`.
    ///
    /// Modified entries are written (creating parent directories), deleted entries are
    /// removed. The first failure aborts the commit: files and directories this commit created
    /// are rolled back and the error is returned. Returns the number of files written.
    pub async fn commit(
        &self,
        destination_root: &Path,
        fs: Rc<dyn FsAdapter>,
    ) -> Result<usize, CommitError> {
        let mut trx = Transaction::<Active>::new(Rc::clone(&fs));
        let mut written = 0;

        for entry in self.entries.values() {
            let target = destination_root.join(&entry.path);

            match (&entry.state_cleared, &entry.contents) {
                (FileState::Modified, Some(contents)) => {
                    if let Some(parent) = target.parent() {
                        create_missing_directories(fs.as_ref(), &mut trx, parent)?;
                    }

                    let existed = fs.exists(&target);

                    fs.write_file(&target, contents.as_bytes())
                        .map_err(|error| CommitError {
                            operation: FileOperation::Write,
                            path: target.clone(),
                            source: error,
                        })?;

                    log::debug!("committed {}", target.display());

                    if !existed {
                        trx.add_operation(RollbackOperation::RemoveFile(target));
                    }

                    written += 1;
                }
                (FileState::Deleted, _) | (FileState::Modified, None) => {
                    if fs.exists(&target) {
                        fs.remove_file(&target).map_err(|error| CommitError {
                            operation: FileOperation::Remove,
                            path: target.clone(),
                            source: error,
                        })?;

                        log::debug!("removed {}", target.display());
                    }
                }
            }

            tokio::task::yield_now().await;
        }

        trx.commit();

        Ok(written)
    }
}

/// Creates `directory` and journals its top-most ancestor that did not exist yet.
fn create_missing_directories(
    fs: &dyn FsAdapter,
    trx: &mut Transaction<Active>,
    directory: &Path,
) -> Result<(), CommitError> {
    if directory.as_os_str().is_empty() || fs.exists(directory) {
        return Ok(());
    }

    let mut topmost = directory;
    while let Some(parent) = topmost.parent() {
        if parent.as_os_str().is_empty() || fs.exists(parent) {
            break;
        }
        topmost = parent;
    }

    fs.mkdir_recursive(directory).map_err(|error| CommitError {
        operation: FileOperation::Mkdir,
        path: directory.to_path_buf(),
        source: error,
    })?;

    trx.add_operation(RollbackOperation::RemoveDir(topmost.to_path_buf()));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seeding_under_base_yields_prefixed_keys() {
        let mut store = VirtualFileStore::new("/project");

        store.write_in("sub", "foo.txt", "foo").unwrap();

        let snapshot = store.snapshot();
        let entry = snapshot.get("sub/foo.txt").unwrap();
        assert_eq!(entry.contents.as_deref(), Some("foo"));
        assert_eq!(entry.state_cleared, FileState::Modified);
    }

    #[test]
    fn test_absolute_and_relative_paths_share_keys() {
        let mut store = VirtualFileStore::new("/project");

        let relative = store.write("sub/foo.txt", "one").unwrap();
        let absolute = store.write("/project/sub/./foo.txt", "two").unwrap();

        assert_eq!(relative, absolute);
        assert_eq!(store.len(), 1);
        assert_eq!(store.read("sub/foo.txt"), Some("two"));
    }

    #[test]
    fn test_paths_outside_the_root_are_rejected() {
        let mut store = VirtualFileStore::new("/project");

        let written = store.write("/elsewhere/escape.txt", "x").unwrap_err();
        let deleted = store.delete("/elsewhere/escape.txt").unwrap_err();

        assert!(matches!(written, StoreError::OutsideRoot { .. }));
        assert!(matches!(deleted, StoreError::OutsideRoot { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_commit_stays_under_destination_root() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let mut store = VirtualFileStore::new(root.path());

        assert!(store.write(other.path().join("escape.txt"), "x").is_err());
        store.write(root.path().join("inside.txt"), "y").unwrap();

        let written = store.commit(root.path(), Rc::new(LocalFs)).await.unwrap();

        assert_eq!(written, 1);
        assert!(root.path().join("inside.txt").exists());
        assert!(!other.path().join("escape.txt").exists());
    }

    #[test]
    fn test_json_contents_are_pretty_printed() {
        let mut store = VirtualFileStore::new("/project");

        store
            .write("package.json", json!({ "name": "demo", "private": true }))
            .unwrap();

        assert_eq!(
            store.read("package.json"),
            Some("{\n  \"name\": \"demo\",\n  \"private\": true\n}\n")
        );
    }

    #[test]
    fn test_write_config_merges_sibling_keys() {
        let mut store = VirtualFileStore::new("/project");

        store
            .write_config(".kopye-rc.json", "ns", json!({ "foo": "bar" }))
            .unwrap();
        store
            .write_config(".kopye-rc.json", "ns.child", json!({ "bar": "foo" }))
            .unwrap();

        assert_eq!(
            store.read_json(".kopye-rc.json").unwrap(),
            Some(json!({ "ns": { "foo": "bar", "child": { "bar": "foo" } } }))
        );
    }

    #[test]
    fn test_write_config_rejects_invalid_existing_document() {
        let mut store = VirtualFileStore::new("/project");
        store.write(".kopye-rc.json", "not json").unwrap();

        let error = store
            .write_config(".kopye-rc.json", "ns", json!({}))
            .unwrap_err();

        assert!(matches!(error, StoreError::Parse(_)));
    }

    #[test]
    fn test_snapshot_keeps_first_write_order() {
        let mut store = VirtualFileStore::new("/project");

        store.write("b.txt", "b").unwrap();
        store.write("a.txt", "a").unwrap();
        store.write("b.txt", "b2").unwrap();

        let keys: Vec<_> = store.snapshot().keys().map(str::to_string).collect();
        assert_eq!(keys, vec!["b.txt", "a.txt"]);
    }

    #[test]
    fn test_snapshot_serializes_state() {
        let mut store = VirtualFileStore::new("/project");
        store.write("foo.txt", "foo").unwrap();

        assert_eq!(
            store.snapshot().to_json(),
            json!({ "foo.txt": { "contents": "foo", "stateCleared": "modified" } })
        );
    }

    #[test]
    fn test_delete_marks_entry() {
        let mut store = VirtualFileStore::new("/project");
        store.write("foo.txt", "foo").unwrap();

        store.delete("foo.txt").unwrap();

        assert!(!store.exists("foo.txt"));
        assert_eq!(
            store.snapshot().get("foo.txt").unwrap().state_cleared,
            FileState::Deleted
        );
    }

    #[test]
    fn test_extend_json_merges_into_existing_document() {
        let mut store = VirtualFileStore::new("/project");
        store
            .write("package.json", json!({ "name": "demo", "scripts": { "test": "jest" } }))
            .unwrap();

        store
            .extend_json("package.json", json!({ "scripts": { "lint": "eslint" } }))
            .unwrap();

        assert_eq!(
            store.read_json("package.json").unwrap(),
            Some(json!({ "name": "demo", "scripts": { "test": "jest", "lint": "eslint" } }))
        );
    }

    #[tokio::test]
    async fn test_commit_writes_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VirtualFileStore::new(dir.path());
        store.write("foo.txt", "foo").unwrap();
        store.write("nested/deeper/bar.json", json!({ "a": 1 })).unwrap();

        let written = store.commit(dir.path(), Rc::new(LocalFs)).await.unwrap();

        assert_eq!(written, 2);
        assert_eq!(fs::read_to_string(dir.path().join("foo.txt")).unwrap(), "foo");
        assert_eq!(
            fs::read_to_string(dir.path().join("nested/deeper/bar.json")).unwrap(),
            store.read("nested/deeper/bar.json").unwrap()
        );
    }

    #[tokio::test]
    async fn test_commit_removes_deleted_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.txt"), "old").unwrap();
        let mut store = VirtualFileStore::new(dir.path());
        store.delete("old.txt").unwrap();

        let written = store.commit(dir.path(), Rc::new(LocalFs)).await.unwrap();

        assert_eq!(written, 0);
        assert!(!dir.path().join("old.txt").exists());
    }

    struct FailingFs {
        fail_on: PathBuf,
    }

    impl FsAdapter for FailingFs {
        fn exists(&self, path: &Path) -> bool {
            LocalFs.exists(path)
        }

        fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            if path == self.fail_on {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            LocalFs.write_file(path, contents)
        }

        fn mkdir_recursive(&self, path: &Path) -> io::Result<()> {
            LocalFs.mkdir_recursive(path)
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            LocalFs.remove_file(path)
        }

        fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
            LocalFs.remove_dir_all(path)
        }
    }

    #[tokio::test]
    async fn test_commit_aborts_on_first_failure_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VirtualFileStore::new(dir.path());
        store.write("first/one.txt", "1").unwrap();
        store.write("second.txt", "2").unwrap();
        store.write("third.txt", "3").unwrap();
        let adapter = Rc::new(FailingFs {
            fail_on: dir.path().join("second.txt"),
        });

        let error = store.commit(dir.path(), adapter).await.unwrap_err();

        assert_eq!(error.path, dir.path().join("second.txt"));
        assert_eq!(error.source.kind(), io::ErrorKind::PermissionDenied);
        assert!(!dir.path().join("first").exists());
        assert!(!dir.path().join("third.txt").exists());
        assert!(dir.path().exists());
    }
}
