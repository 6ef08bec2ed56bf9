// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! Reclaiming disk space from the store.
//!
//! Trimming runs in two phases. Phase A sweeps every supported metadata
//! version for *broken* entries: records that fail to parse, or that
//! reference a file entry missing from the paired file-store version. Broken
//! metadata is safe to drop; the producing rule simply re-promotes on its
//! next run. Phase B then walks the file entries of every supported
//! file-store version and deletes *unused* ones (filesystem link count
//! exactly 1, meaning no build tree holds a link) in ascending ctime order
//! until the byte goal is met.
//!
//! The ctime ordering is what makes eviction approximate LRU: unlinking a
//! sibling hard link updates an inode's ctime, so an entry's ctime records
//! the moment the last build tree let go of it.
//!
//! Concurrent mutators are expected. Every stat and unlink here treats
//! `ENOENT` as "someone else got there first" and moves on; other per-entry
//! I/O errors are reported as warnings and skipped so one bad entry cannot
//! abort a sweep.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tectonic_errors::{anyhow::Context, prelude::*};
use tectonic_status_base::{tt_warning, StatusBackend};

use crate::{
    layout,
    metadata::MetadataPayload,
    store::Store,
    version,
};

/// How much space a trim invocation must win back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrimGoal {
    /// Reduce the overhead size — the total bytes held by unused file
    /// entries — to at most this many bytes.
    Size(u64),

    /// Free at least this many bytes, counting broken-metadata credits.
    Freed(u64),
}

/// The outcome of a trim or garbage-collection pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TrimResult {
    /// The number of bytes freed, best-effort: an entry that a racing
    /// process unlinked between our stat and our unlink still counts.
    pub freed_bytes: u64,
}

/// Staging files older than this are crash debris from interrupted
/// promotes and get cleared during trimming.
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

struct Candidate {
    path: PathBuf,
    size: u64,
    ctime: (i64, i64),
}

impl Store {
    /// Trim the store toward the given goal.
    pub fn trim(&self, goal: TrimGoal, status: &mut dyn StatusBackend) -> Result<TrimResult> {
        self.trim_with_cancel(goal, &AtomicBool::new(false), status)
    }

    /// Trim the store toward the given goal, checking a stop signal before
    /// each eviction.
    ///
    /// Raising the signal makes the trimmer return promptly with whatever
    /// progress it has made; partial progress is still reported.
    pub fn trim_with_cancel(
        &self,
        goal: TrimGoal,
        cancel: &AtomicBool,
        status: &mut dyn StatusBackend,
    ) -> Result<TrimResult> {
        let mut freed = self.sweep_broken_metadata(status)?;
        self.sweep_stale_temp_files(status);

        // Phase B: gather unused file entries across every supported
        // version, oldest-unused first.

        let mut overhead = 0u64;
        let mut candidates = Vec::new();

        for files_version in version::supported_file_versions() {
            let storage = self.layout().file_dir(files_version);

            for (path, _digest) in layout::list_entries(&storage)? {
                use std::os::unix::fs::MetadataExt;

                let md = match fs::metadata(&path) {
                    Ok(md) => md,
                    Err(ref e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        tt_warning!(status, "failed to stat cache entry `{}`", path.display(); e.into());
                        continue;
                    }
                };

                if md.nlink() != 1 {
                    continue;
                }

                overhead += md.len();
                candidates.push(Candidate {
                    path,
                    size: md.len(),
                    ctime: (md.ctime(), md.ctime_nsec()),
                });
            }
        }

        candidates.sort_by(|a, b| a.ctime.cmp(&b.ctime).then_with(|| a.path.cmp(&b.path)));

        let mut to_free = match goal {
            TrimGoal::Freed(bytes) => bytes.saturating_sub(freed),
            TrimGoal::Size(bytes) => overhead.saturating_sub(bytes),
        };

        for candidate in candidates {
            if to_free == 0 || cancel.load(Ordering::Relaxed) {
                break;
            }

            match fs::remove_file(&candidate.path) {
                Ok(_) => {}
                Err(ref e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    tt_warning!(status, "failed to evict cache entry `{}`", candidate.path.display(); e.into());
                    continue;
                }
            }

            freed += candidate.size;
            to_free = to_free.saturating_sub(candidate.size);
        }

        Ok(TrimResult { freed_bytes: freed })
    }

    /// Run only the broken-metadata sweep. This never deletes a file entry,
    /// live or not.
    pub fn garbage_collect(&self, status: &mut dyn StatusBackend) -> Result<TrimResult> {
        Ok(TrimResult {
            freed_bytes: self.sweep_broken_metadata(status)?,
        })
    }

    /// Report the total bytes held by unused file entries across all
    /// supported versions, without mutating anything.
    pub fn overhead_size(&self) -> Result<u64> {
        use std::os::unix::fs::MetadataExt;

        let mut total = 0u64;

        for files_version in version::supported_file_versions() {
            for (path, _digest) in layout::list_entries(&self.layout().file_dir(files_version))? {
                let md = match fs::metadata(&path) {
                    Ok(md) => md,
                    Err(ref e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(e)
                            .context(format!("failed to stat cache entry `{}`", path.display()))
                    }
                };

                if md.nlink() == 1 {
                    total += md.len();
                }
            }
        }

        Ok(total)
    }

    /// Phase A: delete broken metadata entries across all supported
    /// versions, resolving file references against each version's paired
    /// file store. Returns the bytes credited.
    fn sweep_broken_metadata(&self, status: &mut dyn StatusBackend) -> Result<u64> {
        let mut freed = 0u64;

        for pair in version::SUPPORTED_VERSIONS {
            let file_dir = self.layout().file_dir(pair.files);

            for (path, _rule) in layout::list_entries(&self.layout().metadata_dir(pair.metadata))? {
                let data = match fs::read(&path) {
                    Ok(d) => d,
                    // Concurrently deleted; no credit.
                    Err(ref e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        tt_warning!(status, "failed to read metadata entry `{}`", path.display(); e.into());
                        continue;
                    }
                };

                if !self.metadata_is_broken(&data, &file_dir, &path, status) {
                    continue;
                }

                let size = match fs::metadata(&path) {
                    Ok(md) => md.len(),
                    Err(ref e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        tt_warning!(status, "failed to stat metadata entry `{}`", path.display(); e.into());
                        continue;
                    }
                };

                match fs::remove_file(&path) {
                    // Credit the bytes even if another trimmer won the
                    // unlink; the entry is gone either way.
                    Ok(_) => freed += size,
                    Err(ref e) if e.kind() == ErrorKind::NotFound => freed += size,
                    Err(e) => {
                        tt_warning!(status, "failed to delete metadata entry `{}`", path.display(); e.into());
                    }
                }
            }
        }

        Ok(freed)
    }

    fn metadata_is_broken(
        &self,
        data: &[u8],
        file_dir: &Path,
        md_path: &Path,
        status: &mut dyn StatusBackend,
    ) -> bool {
        let files = match MetadataPayload::parse(data) {
            Ok(MetadataPayload::Files(files)) => files,

            // Value records reference no file entries and are kept.
            Ok(MetadataPayload::Value(_)) => return false,

            // Unparseable records are safe to drop.
            Err(_) => return true,
        };

        for fref in &files {
            let entry = layout::path_of(file_dir, &fref.digest.to_hex());

            match fs::metadata(&entry) {
                Ok(_) => {}
                Err(ref e) if e.kind() == ErrorKind::NotFound => return true,
                Err(e) => {
                    // Can't tell whether the reference resolves; leave the
                    // record alone rather than guess.
                    tt_warning!(status, "failed to resolve `{}` referenced by `{}`", entry.display(), md_path.display(); e.into());
                    return false;
                }
            }
        }

        false
    }

    /// Clear old staging files left behind by crashed promotes. Purely
    /// best-effort and uncredited.
    fn sweep_stale_temp_files(&self, status: &mut dyn StatusBackend) {
        let temp_dir = self.layout().temp_dir();

        let entries = match fs::read_dir(&temp_dir) {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                tt_warning!(status, "failed to read staging directory `{}`", temp_dir.display(); e.into());
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };

            let stale = entry
                .metadata()
                .and_then(|md| md.modified())
                .map(|mtime| {
                    mtime
                        .elapsed()
                        .map(|age| age > STALE_TEMP_AGE)
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            if stale {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
