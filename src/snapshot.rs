//! Rootfs snapshots for steps that run arbitrary commands.
//!
//! A snapshot records metadata for every path under the rootfs. Comparing a
//! snapshot taken before a step with one taken after yields the paths the
//! step added or changed and the paths it deleted.

use std::collections::BTreeMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Dir,
    File,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryState {
    kind: EntryType,
    mode: u32,
    len: u64,
    mtime_ns: i128,
    ctime_ns: i128,
    ino: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, EntryState>,
}

/// Difference between two snapshots. Paths are relative to the rootfs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Added or modified paths, sorted.
    pub changed: Vec<PathBuf>,
    /// Deleted paths, sorted, without descendants of other deleted paths.
    pub deleted: Vec<PathBuf>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

impl Snapshot {
    pub fn take(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
            let entry = entry.with_context(|| format!("snapshotting '{}'", root.display()))?;
            let meta = entry
                .metadata()
                .with_context(|| format!("reading metadata '{}'", entry.path().display()))?;
            let file_type = entry.file_type();
            let kind = if file_type.is_symlink() {
                EntryType::Symlink
            } else if file_type.is_dir() {
                EntryType::Dir
            } else if file_type.is_file() {
                EntryType::File
            } else {
                EntryType::Other
            };
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            entries.insert(
                rel.to_path_buf(),
                EntryState {
                    kind,
                    mode: meta.permissions().mode(),
                    len: meta.len(),
                    mtime_ns: meta.mtime() as i128 * 1_000_000_000 + meta.mtime_nsec() as i128,
                    ctime_ns: meta.ctime() as i128 * 1_000_000_000 + meta.ctime_nsec() as i128,
                    ino: meta.ino(),
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes from `self` (before) to `after`.
    pub fn diff(&self, after: &Snapshot) -> Changes {
        let changed = after
            .entries
            .iter()
            .filter(|(path, state)| self.entries.get(*path) != Some(*state))
            .map(|(path, _)| path.clone())
            .collect();

        let mut deleted: Vec<PathBuf> = Vec::new();
        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            // BTreeMap order puts a directory before its children.
            if deleted.last().is_some_and(|parent| path.starts_with(parent)) {
                continue;
            }
            deleted.push(path.clone());
        }

        Changes { changed, deleted }
    }
}
