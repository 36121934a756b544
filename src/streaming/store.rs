//! Destinations that parsed records are materialized into.
//!
//! Entries are created empty when a record header completes, then appended to
//! as content streams in, so partial files are visible mid-transfer.

use crate::error::{Result, TransferError};
use crate::streaming::record::RecordKey;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

/// Where unpacked records go.
pub trait DestinationStore {
    /// Create (or truncate) the entry for `key`.
    fn create(&mut self, key: &RecordKey) -> Result<()>;

    /// Append content to the entry created by the last `create`.
    fn append(&mut self, key: &RecordKey, data: &[u8]) -> Result<()>;

    /// The entry for `key` is complete.
    fn complete(&mut self, _key: &RecordKey) -> Result<()> {
        Ok(())
    }

    /// Drop a partially written entry after a failed transfer step.
    fn discard(&mut self, key: &RecordKey) -> Result<()>;

    /// Called once after the final bunch has been drained.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: DestinationStore + ?Sized> DestinationStore for &mut S {
    fn create(&mut self, key: &RecordKey) -> Result<()> {
        (**self).create(key)
    }

    fn append(&mut self, key: &RecordKey, data: &[u8]) -> Result<()> {
        (**self).append(key, data)
    }

    fn complete(&mut self, key: &RecordKey) -> Result<()> {
        (**self).complete(key)
    }

    fn discard(&mut self, key: &RecordKey) -> Result<()> {
        (**self).discard(key)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Records kept in memory, addressed as `"owner:path"`.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner: &str, path: &str) -> Option<&[u8]> {
        self.files
            .get(&RecordKey::new(owner, path).to_string())
            .map(Vec::as_slice)
    }

    /// Look up by the combined `"owner:path"` key.
    pub fn get_key(&self, key: &str) -> Option<&[u8]> {
        self.files.get(key).map(Vec::as_slice)
    }

    /// Chunk name a script loader reports for this record (`"@owner:path"`).
    pub fn chunk_name(owner: &str, path: &str) -> String {
        format!("@{}", RecordKey::new(owner, path))
    }

    pub fn contains(&self, owner: &str, path: &str) -> bool {
        self.get(owner, path).is_some()
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.files.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn into_inner(self) -> HashMap<String, Vec<u8>> {
        self.files
    }
}

impl DestinationStore for MemoryStore {
    fn create(&mut self, key: &RecordKey) -> Result<()> {
        self.files.insert(key.to_string(), Vec::new());
        Ok(())
    }

    fn append(&mut self, key: &RecordKey, data: &[u8]) -> Result<()> {
        self.files
            .get_mut(&key.to_string())
            .ok_or_else(|| TransferError::protocol(format!("No open entry for {}", key)))?
            .extend_from_slice(data);
        Ok(())
    }

    fn discard(&mut self, key: &RecordKey) -> Result<()> {
        self.files.remove(&key.to_string());
        Ok(())
    }
}

// =============================================================================
// Filesystem store
// =============================================================================

/// Records written under a sandboxed root as `root/<owner>/<path>`.
pub struct DirStore {
    root: PathBuf,
    open: Option<OpenEntry>,
    written: Vec<PathBuf>,
}

struct OpenEntry {
    key: RecordKey,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl DirStore {
    /// Use `root` as the sandbox, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| TransferError::io(&root, e))?;
        Ok(Self {
            root,
            open: None,
            written: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths of every entry created so far, in creation order.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Where `key` lands on disk, after the traversal checks.
    pub fn resolve(&self, key: &RecordKey) -> Result<PathBuf> {
        let base = if key.owner.is_empty() {
            self.root.clone()
        } else {
            validate_owner(&key.owner)?;
            self.root.join(&key.owner)
        };
        validate_path(&self.root, &base, &key.path)
    }

    fn close_open(&mut self) -> Result<()> {
        if let Some(mut entry) = self.open.take() {
            entry
                .writer
                .flush()
                .map_err(|e| TransferError::io(&entry.path, e))?;
        }
        Ok(())
    }
}

impl DestinationStore for DirStore {
    fn create(&mut self, key: &RecordKey) -> Result<()> {
        self.close_open()?;
        let path = self.resolve(key)?;
        reject_symlinks(&self.root, &path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
        }
        let file = File::create(&path).map_err(|e| TransferError::io(&path, e))?;
        tracing::debug!("Creating {} for {}", path.display(), key);

        self.written.push(path.clone());
        self.open = Some(OpenEntry {
            key: key.clone(),
            path,
            writer: BufWriter::new(file),
        });
        Ok(())
    }

    fn append(&mut self, key: &RecordKey, data: &[u8]) -> Result<()> {
        let entry = match self.open.as_mut() {
            Some(entry) if entry.key == *key => entry,
            _ => {
                return Err(TransferError::protocol(format!(
                    "No open entry for {}",
                    key
                )))
            }
        };
        entry
            .writer
            .write_all(data)
            .map_err(|e| TransferError::io(&entry.path, e))
    }

    fn complete(&mut self, _key: &RecordKey) -> Result<()> {
        self.close_open()
    }

    fn discard(&mut self, key: &RecordKey) -> Result<()> {
        if let Some(entry) = self.open.take() {
            drop(entry.writer);
            if entry.key == *key {
                if let Err(e) = fs::remove_file(&entry.path) {
                    tracing::warn!("Failed to remove partial {}: {}", entry.path.display(), e);
                }
                self.written.retain(|p| p != &entry.path);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.close_open()
    }
}

/// Owner tags become one directory level, so they must be a single plain
/// path segment.
fn validate_owner(owner: &str) -> Result<()> {
    let reason = if owner.contains('/') || owner.contains('\\') {
        Some("owner tag contains a path separator")
    } else if owner == "." || owner == ".." {
        Some("owner tag is a relative directory reference")
    } else if owner.contains('\0') {
        Some("owner tag contains a NUL byte")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(TransferError::SecurityViolation {
            path: owner.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Validate that a wire path is safe and doesn't escape the root.
/// Both `/` and `\` separate segments. Returns the full path under `base`.
fn validate_path(root: &Path, base: &Path, relative: &str) -> Result<PathBuf> {
    let violation = |reason| TransferError::SecurityViolation {
        path: relative.to_string(),
        reason,
    };

    if relative.is_empty() {
        return Err(violation("empty path"));
    }
    if relative.contains('\0') {
        return Err(violation("path contains a NUL byte"));
    }
    if relative.starts_with(['/', '\\']) {
        return Err(violation("absolute path"));
    }

    let mut rel_path = PathBuf::new();
    for segment in relative.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(violation("parent directory traversal")),
            _ => {}
        }
        for component in Path::new(segment).components() {
            match component {
                Component::Normal(part) => rel_path.push(part),
                Component::CurDir => {}
                Component::ParentDir => return Err(violation("parent directory traversal")),
                Component::RootDir => return Err(violation("absolute path")),
                Component::Prefix(_) => return Err(violation("platform path prefix")),
            }
        }
    }
    if rel_path.as_os_str().is_empty() {
        return Err(violation("path has no file name"));
    }

    let full = base.join(&rel_path);

    // Final containment check against the normalized root.
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(violation("path escapes root directory"));
    }

    Ok(full)
}

/// Refuse to write through a symlink that already exists between `root`
/// and `full`, the target itself included.
fn reject_symlinks(root: &Path, full: &Path) -> Result<()> {
    let relative = full
        .strip_prefix(root)
        .map_err(|_| TransferError::SecurityViolation {
            path: full.display().to_string(),
            reason: "path escapes root directory",
        })?;

    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(TransferError::SecurityViolation {
                    path: current.display().to_string(),
                    reason: "path crosses a symbolic link",
                })
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(TransferError::io(&current, e)),
        }
    }
    Ok(())
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(owner: &str, path: &str) -> RecordKey {
        RecordKey::new(owner, path)
    }

    #[test]
    fn test_memory_store_entries() {
        let mut store = MemoryStore::new();
        let k = key("modA", "init.lua");
        store.create(&k).unwrap();
        store.append(&k, b"print(").unwrap();
        store.append(&k, b"1)").unwrap();
        store.complete(&k).unwrap();

        assert_eq!(store.get("modA", "init.lua"), Some(&b"print(1)"[..]));
        assert_eq!(store.get_key("modA:init.lua"), Some(&b"print(1)"[..]));
        assert_eq!(MemoryStore::chunk_name("modA", "init.lua"), "@modA:init.lua");
        assert_eq!(store.keys(), vec!["modA:init.lua"]);

        store.discard(&k).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_append_without_create() {
        let mut store = MemoryStore::new();
        assert!(store.append(&key("m", "p"), b"x").is_err());
    }

    #[test]
    fn test_dir_store_writes_nested() {
        let tmp = TempDir::new().unwrap();
        let mut store = DirStore::new(tmp.path()).unwrap();
        let k = key("modA", "lib/util.lua");
        store.create(&k).unwrap();
        store.append(&k, b"return {}").unwrap();
        store.complete(&k).unwrap();

        let written = tmp.path().join("modA").join("lib").join("util.lua");
        assert_eq!(fs::read(&written).unwrap(), b"return {}");
        assert_eq!(store.written(), &[written]);
    }

    #[test]
    fn test_dir_store_normalizes_backslashes() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::new(tmp.path()).unwrap();
        let resolved = store.resolve(&key("modA", "lib\\deep\\x.lua")).unwrap();
        assert_eq!(
            resolved,
            tmp.path().join("modA").join("lib").join("deep").join("x.lua")
        );
    }

    #[test]
    fn test_dir_store_empty_owner_uses_root() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::new(tmp.path()).unwrap();
        let resolved = store.resolve(&key("", "init.lua")).unwrap();
        assert_eq!(resolved, tmp.path().join("init.lua"));
    }

    #[test]
    fn test_validate_path_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::new(tmp.path()).unwrap();
        for bad in [
            "../escape.txt",
            "lib/../../escape.txt",
            "..\\escape.txt",
            "/etc/passwd",
            "",
            "./",
        ] {
            let err = store.resolve(&key("modA", bad)).unwrap_err();
            assert!(
                matches!(err, TransferError::SecurityViolation { .. }),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_validate_owner_rejects_segments() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::new(tmp.path()).unwrap();
        for bad in ["..", ".", "a/b", "a\\b"] {
            let err = store.resolve(&key(bad, "init.lua")).unwrap_err();
            assert!(matches!(err, TransferError::SecurityViolation { .. }));
        }
        assert!(store.resolve(&key("*builtin*", "builtin/init.lua")).is_ok());
    }

    #[test]
    fn test_dir_store_discard_removes_partial() {
        let tmp = TempDir::new().unwrap();
        let mut store = DirStore::new(tmp.path()).unwrap();
        let k = key("modA", "partial.lua");
        store.create(&k).unwrap();
        store.append(&k, b"half").unwrap();
        store.discard(&k).unwrap();

        assert!(!tmp.path().join("modA").join("partial.lua").exists());
        assert!(store.written().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_store_refuses_symlinked_owner() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();

        let mut store = DirStore::new(&root).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("modA")).unwrap();

        let err = store.create(&key("modA", "lib/x.lua")).unwrap_err();
        assert!(matches!(err, TransferError::SecurityViolation { .. }));
        assert!(!outside.join("lib").exists());
        assert!(store.written().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_store_refuses_symlinked_target() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let victim = tmp.path().join("victim.txt");
        fs::write(&victim, "keep").unwrap();

        let mut store = DirStore::new(&root).unwrap();
        fs::create_dir_all(root.join("modA")).unwrap();
        std::os::unix::fs::symlink(&victim, root.join("modA").join("init.lua")).unwrap();

        let err = store.create(&key("modA", "init.lua")).unwrap_err();
        assert!(matches!(err, TransferError::SecurityViolation { .. }));
        assert_eq!(fs::read_to_string(&victim).unwrap(), "keep");

        // Plain directories under the root are still fine.
        store.create(&key("modA", "lib/ok.lua")).unwrap();
        store.complete(&key("modA", "lib/ok.lua")).unwrap();
        assert!(root.join("modA/lib/ok.lua").exists());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
