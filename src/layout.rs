// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! The on-disk layout of the store.
//!
//! Everything lives under a single store root:
//!
//! ```text
//! <root>/
//!   temp/                   — staging for atomic renames
//!   files/v<V>/<aa>/<hex>   — file entries
//!   meta/v<V>/<aa>/<hex>    — metadata entries
//!   values/v<V>/<aa>/<hex>  — reserved
//! ```
//!
//! Entries are sharded into subdirectories named after the first two hex
//! characters of their digest, keeping per-directory fanout at 256 or less.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tectonic_errors::{anyhow::Context, prelude::*};
use walkdir::{DirEntry, WalkDir};

use crate::{digest::DigestData, version};

/// Path resolution for a store rooted at a particular directory.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Self {
        Layout { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The staging directory for atomic renames.
    ///
    /// Staged files must live under the store root so that the final rename
    /// never crosses a filesystem boundary.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn file_dir(&self, version: u32) -> PathBuf {
        self.versioned_dir("files", version)
    }

    pub fn metadata_dir(&self, version: u32) -> PathBuf {
        self.versioned_dir("meta", version)
    }

    pub fn value_dir(&self, version: u32) -> PathBuf {
        self.versioned_dir("values", version)
    }

    fn versioned_dir(&self, kind: &str, version: u32) -> PathBuf {
        let mut p = self.root.join(kind);
        p.push(format!("v{}", version));
        p
    }

    /// Idempotently create the scaffolding the writer needs: the staging
    /// directory and the current-version subtree of each artifact kind.
    pub fn create_cache_directories(&self) -> Result<()> {
        let dirs = [
            self.temp_dir(),
            self.file_dir(version::CURRENT.files),
            self.metadata_dir(version::CURRENT.metadata),
            self.value_dir(version::CURRENT_VALUES),
        ];

        for dir in &dirs {
            atry!(
                fs::create_dir_all(dir);
                ["failed to create cache directory `{}`", dir.display()]
            );
        }

        Ok(())
    }
}

/// Resolve the sharded path of an entry within a storage directory.
///
/// The caller must supply a hex string of at least two characters; every
/// digest's canonical form qualifies.
pub fn path_of(dir: &Path, hex: &str) -> PathBuf {
    let mut p = dir.join(&hex[..2]);
    p.push(hex);
    p
}

/// Enumerate the `(path, digest)` pairs stored under a versioned storage
/// directory.
///
/// Intermediate directories whose names are not two lowercase hex characters
/// are skipped without descending, and leaves whose names do not parse as
/// canonical digests are ignored; the store tolerates stray files that other
/// tools drop into its tree. A missing storage directory yields an empty
/// list. Any other filesystem error is surfaced.
pub fn list_entries(storage: &Path) -> Result<Vec<(PathBuf, DigestData)>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(storage)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_entry(is_shard_dir_or_leaf);

    for item in walker {
        let item = match item {
            Ok(i) => i,

            Err(ref e)
                if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound)
                    && e.depth() == 0 =>
            {
                return Ok(entries);
            }

            Err(e) => {
                return Err(e)
                    .context(format!("failed to walk storage `{}`", storage.display()));
            }
        };

        if !item.file_type().is_file() {
            continue;
        }

        let digest = match item.file_name().to_str().and_then(DigestData::from_hex) {
            Some(d) => d,
            None => continue,
        };

        entries.push((item.into_path(), digest));
    }

    Ok(entries)
}

fn is_shard_dir_or_leaf(entry: &DirEntry) -> bool {
    if entry.depth() != 1 {
        return true;
    }

    entry
        .file_name()
        .to_str()
        .map(is_shard_name)
        .unwrap_or(false)
}

fn is_shard_name(name: &str) -> bool {
    name.len() == 2
        && name
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharded_paths() {
        let layout = Layout::new(PathBuf::from("/store"));

        assert_eq!(
            layout.file_dir(4),
            PathBuf::from("/store/files/v4")
        );
        assert_eq!(
            layout.metadata_dir(5),
            PathBuf::from("/store/meta/v5")
        );
        assert_eq!(
            path_of(
                &layout.file_dir(4),
                "d41d8cd98f00b204e9800998ecf8427e"
            ),
            PathBuf::from("/store/files/v4/d4/d41d8cd98f00b204e9800998ecf8427e")
        );
    }

    #[test]
    fn list_skips_non_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("files").join("v4");

        let hex = "d41d8cd98f00b204e9800998ecf8427e";
        let entry = path_of(&storage, hex);
        fs::create_dir_all(entry.parent().unwrap()).unwrap();
        fs::write(&entry, b"").unwrap();

        // Stray content that enumeration must ignore.
        fs::create_dir_all(storage.join("not-a-shard")).unwrap();
        fs::write(storage.join("not-a-shard").join(hex), b"").unwrap();
        fs::write(storage.join("d4").join("README"), b"").unwrap();
        fs::create_dir_all(storage.join("d4").join("subdir")).unwrap();

        let entries = list_entries(&storage).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, entry);
        assert_eq!(entries[0].1, DigestData::from_hex(hex).unwrap());
    }

    #[test]
    fn list_of_missing_storage_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = list_entries(&dir.path().join("no-such-dir")).unwrap();
        assert!(entries.is_empty());
    }
}
