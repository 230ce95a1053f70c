//! File trees: the content of a commit.
//!
//! A tree maps normalized absolute paths (`/a/b.txt`) to content
//! addresses. Directories are implicit.

use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use sluice_core::{CoreResult, Hash, Hasher};
use std::collections::BTreeMap;

/// One file in a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content address in the content store
    pub address: Hash,
    /// Size in bytes
    pub size: u64,
}

/// Normalize a file path to `/seg/seg` form.
///
/// Empty and `.` segments are dropped; `..` is rejected, as is a path
/// that names the root itself.
///
/// # Errors
///
/// Returns error if the path escapes the tree or is empty
pub fn normalize_path(path: &str) -> CoreResult<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "parent segments are not allowed".to_string(),
                }
                .into());
            }
            s => {
                out.push('/');
                out.push_str(s);
            }
        }
    }
    if out.is_empty() {
        return Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason: "path names no file".to_string(),
        }
        .into());
    }
    Ok(out)
}

/// Ordered file tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTree {
    files: BTreeMap<String, FileEntry>,
}

impl FileTree {
    /// Create an empty tree
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a file
    ///
    /// # Errors
    ///
    /// Returns error if the path is invalid
    pub fn insert(&mut self, path: &str, entry: FileEntry) -> CoreResult<()> {
        let path = normalize_path(path)?;
        self.files.insert(path, entry);
        Ok(())
    }

    /// Remove a file, or every file under a directory. Returns how many
    /// files were removed.
    ///
    /// # Errors
    ///
    /// Returns error if the path is invalid
    pub fn remove(&mut self, path: &str) -> CoreResult<usize> {
        let path = normalize_path(path)?;
        let dir = format!("{}/", path);
        let before = self.files.len();
        self.files
            .retain(|p, _| p != &path && !p.starts_with(&dir));
        Ok(before - self.files.len())
    }

    /// Look up a file
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        normalize_path(path)
            .ok()
            .and_then(|p| self.files.get(&p))
    }

    /// Number of files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the tree has no files
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate files in path order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter()
    }

    /// Total size of all files
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|e| e.size).sum()
    }

    /// Overlay `other` onto this tree; files in `other` win
    pub fn merge(&mut self, other: &FileTree) {
        for (path, entry) in &other.files {
            self.files.insert(path.clone(), *entry);
        }
    }

    /// Files at or under `prefix`, keeping their full paths. A prefix of
    /// `/` (or empty) selects everything.
    #[must_use]
    pub fn subtree(&self, prefix: &str) -> FileTree {
        let Ok(prefix) = normalize_path(prefix) else {
            return self.clone();
        };
        let dir = format!("{}/", prefix);
        let files = self
            .files
            .iter()
            .filter(|(p, _)| **p == prefix || p.starts_with(&dir))
            .map(|(p, e)| (p.clone(), *e))
            .collect();
        FileTree { files }
    }

    /// Group files by their first path segment. Each group is keyed by
    /// `/<segment>` and holds the full paths of its files.
    #[must_use]
    pub fn top_level(&self) -> BTreeMap<String, FileTree> {
        let mut groups: BTreeMap<String, FileTree> = BTreeMap::new();
        for (path, entry) in &self.files {
            let top = path[1..].split('/').next().unwrap_or_default();
            groups
                .entry(format!("/{}", top))
                .or_default()
                .files
                .insert(path.clone(), *entry);
        }
        groups
    }

    /// Stable digest of paths and contents
    #[must_use]
    pub fn digest(&self) -> Hash {
        let mut hasher = Hasher::new();
        for (path, entry) in &self.files {
            hasher.str_field(path).hash_field(&entry.address);
        }
        hasher.finish()
    }
}

impl FromIterator<(String, FileEntry)> for FileTree {
    fn from_iter<I: IntoIterator<Item = (String, FileEntry)>>(iter: I) -> Self {
        let files = iter
            .into_iter()
            .filter_map(|(p, e)| normalize_path(&p).ok().map(|p| (p, e)))
            .collect();
        Self { files }
    }
}
