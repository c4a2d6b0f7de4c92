//! Filesystem helpers shared by the archive index and the protocol handlers.
//!
//! One implementation per operation, used uniformly on every OS; handlers
//! never call platform APIs directly.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Backup manifests and protocol messages may carry either separator;
/// everything is normalized to `/` before lookups or joins.
pub fn normalize_separators(path: &str) -> String {
    if path.contains('\\') {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}

/// Join a relative protocol path onto a backup root, normalizing separators.
pub fn join_relative(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in normalize_separators(rel).split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

/// Create the parent directory of `path` if it is missing.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Delete a file or a directory tree. Missing paths are an error so callers
/// can report them per-path (the protocol distinguishes "was not there").
pub fn remove_tree(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Recursively copy `src` into `dst`, returning the byte total.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut bytes = 0u64;
    if src.is_file() {
        ensure_parent(dst)?;
        return fs::copy(src, dst).with_context(|| format!("copy {}", src.display()));
    }
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            ensure_parent(&target)?;
            bytes += fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
        // Symlinks inside a backup directory are not expected; skip them.
    }
    Ok(bytes)
}

/// Available space on the volume holding `path`, if the volume is known.
pub fn free_space(path: &Path) -> Option<u64> {
    let probe = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if probe.starts_with(mount) {
            let depth = mount.components().count();
            if best.map_or(true, |(d, _)| depth >= d) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    best.map(|(_, space)| space)
}
