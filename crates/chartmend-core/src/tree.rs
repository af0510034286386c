//! Filesystem helpers for chart trees: hashing, snapshots, copies and
//! atomic writes.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// Editor and agent state directories never treated as chart content.
const IGNORED_PREFIXES: [&str; 6] = [
    ".claude/", ".codex/", ".cursor/", ".vscode/", ".idea/", ".git/",
];
const IGNORED_NAMES: [&str; 3] = [".DS_Store", ".claude.json", ".codex.json"];

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash of a file's bytes, or `None` if it does not exist.
pub fn hash_file(path: &Path) -> std::io::Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether a relative path is tool noise rather than chart content.
pub fn is_ignored(rel: &str) -> bool {
    let rel = rel.trim_start_matches("./");
    if IGNORED_PREFIXES
        .iter()
        .any(|p| rel.starts_with(p) || rel == p.trim_end_matches('/'))
    {
        return true;
    }
    let name = rel.rsplit('/').next().unwrap_or(rel);
    IGNORED_NAMES.contains(&name)
}

fn rel_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then_some(joined)
}

/// Relative path → content hash for every regular file under `root`.
pub fn snapshot_tree(root: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = rel_of(root, entry.path()) else {
            continue;
        };
        if is_ignored(&rel) {
            continue;
        }
        out.insert(rel, sha256_hex(&fs::read(entry.path())?));
    }
    Ok(out)
}

/// Paths whose content differs between two snapshots, including additions
/// and removals. Sorted.
pub fn changed_paths(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Vec<String> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|k| before.get(*k) != after.get(*k))
        .cloned()
        .collect()
}

/// Recursively copy `src` into `dst`, skipping ignored tool state.
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let Some(rel) = rel_of(src, entry.path()) else {
            continue;
        };
        if is_ignored(&rel) {
            continue;
        }
        let target = dst.join(&rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Atomically replace `path` with `data` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
