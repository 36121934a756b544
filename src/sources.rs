//! Collects the files a bundle is built from.
//!
//! Each owner (mod) contributes the files under its `client/` directory.
//! Entries whose name starts with `.` are skipped at every level.

use crate::error::{Result, TransferError};
use ignore::WalkBuilder;
use std::fs;
use std::path::{Path, PathBuf};

/// Owner tag used for built-in script trees.
pub const BUILTIN_OWNER: &str = "*builtin*";

/// Directory inside a mod that holds its client-side scripts.
pub const CLIENT_DIR: &str = "client";

/// Subtrees of the built-in directory that are shipped, each under its own
/// path prefix. Everything else in the built-in directory stays behind.
pub const BUILTIN_TREES: [&str; 2] = ["sscsm", "common"];

/// A file on disk and the name it travels under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub owner: String,
    /// Wire path, `/`-separated
    pub path: String,
    pub disk_path: PathBuf,
    pub len: u64,
}

/// Recursively collect the regular files under `dir`.
///
/// Wire paths are `prefix/relative` (or just `relative` when `prefix` is
/// empty), always with `/` separators. Output is sorted by wire path.
pub fn collect_dir(dir: &Path, owner: &str, prefix: &str) -> Result<Vec<SourceFile>> {
    let walker = WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .follow_links(false)
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            TransferError::io(
                dir,
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| TransferError::SecurityViolation {
                path: entry.path().display().to_string(),
                reason: "walked outside the source directory",
            })?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let path = if prefix.is_empty() {
            relative
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), relative)
        };

        let len = entry
            .metadata()
            .map_err(|e| {
                TransferError::io(
                    entry.path(),
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?
            .len();

        tracing::debug!("Adding {} from {}", path, entry.path().display());
        files.push(SourceFile {
            owner: owner.to_string(),
            path,
            disk_path: entry.path().to_path_buf(),
            len,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Owners under `mods_root` that ship client scripts, sorted by name.
///
/// Returns `(owner, client_dir)` pairs.
pub fn discover_owners(mods_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(mods_root).map_err(|e| TransferError::io(mods_root, e))?;

    let mut owners = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TransferError::io(mods_root, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let client = entry.path().join(CLIENT_DIR);
        if client.is_dir() {
            tracing::debug!("Found client scripts for {}", name);
            owners.push((name, client));
        }
    }
    owners.sort();
    Ok(owners)
}

/// Everything a bundle ships: the built-in trees first, then every mod that
/// has client scripts.
///
/// Built-in files travel as `*builtin*` / `<tree>/<relative>`; missing trees
/// are skipped.
pub fn collect_bundle(
    builtin: Option<&Path>,
    mods_root: Option<&Path>,
) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();

    if let Some(builtin) = builtin {
        for tree in BUILTIN_TREES {
            let dir = builtin.join(tree);
            if !dir.is_dir() {
                tracing::debug!("No built-in {} tree at {}", tree, dir.display());
                continue;
            }
            files.extend(collect_dir(&dir, BUILTIN_OWNER, tree)?);
        }
    }
    if let Some(mods_root) = mods_root {
        for (owner, client_dir) in discover_owners(mods_root)? {
            files.extend(collect_dir(&client_dir, &owner, "")?);
        }
    }
    Ok(files)
}
