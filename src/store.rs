// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! Store operations: promoting rule outputs into the cache and restoring
//! them into build trees.
//!
//! All mutations of the store go through staging files in `temp/` followed
//! by an atomic installation step, so concurrent processes never observe a
//! half-written entry and no lock files are needed. Build trees share inodes
//! with file entries through hard links; the store observes those links only
//! via the filesystem link count, which is what the trimmer uses to tell
//! live entries from unused ones.

use std::{
    fs,
    io::{ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
};
use tectonic_errors::{anyhow::Context, prelude::*, Error};
use tempfile::NamedTempFile;

use crate::{
    config,
    digest::{digest_path, RuleDigest},
    layout::{self, Layout},
    metadata::{FileRef, MetadataPayload},
    version,
};

/// One output file of a rule execution, as handed to [`Store::promote`].
#[derive(Clone, Debug)]
pub struct OutputFile {
    /// The target's basename relative to the rule's build directory.
    pub name: String,

    /// Where the produced file currently lives.
    pub path: PathBuf,

    /// Whether the file carries the executable bit.
    pub executable: bool,
}

/// What happened when asking the store for a rule's outputs.
#[derive(Debug)]
pub enum RestoreOutcome {
    /// Every output was linked into the build tree.
    Restored,

    /// The store has no metadata entry for this rule digest.
    NotFound,

    /// The metadata entry was unparseable or referenced a file entry that
    /// has disappeared, possibly under a racing trim. Links already created
    /// are not rolled back; the caller re-executes the rule and overwrites.
    Corrupt(Error),
}

/// A shared content-addressed store on the local filesystem.
#[derive(Clone, Debug)]
pub struct Store {
    layout: Layout,
}

impl Store {
    /// Open the store at the root named by the environment (see
    /// [`config::get_store_root`]).
    pub fn open() -> Result<Self> {
        Ok(Store {
            layout: Layout::new(config::get_store_root()?),
        })
    }

    /// Open the store at an explicit root.
    pub fn at_root(root: PathBuf) -> Self {
        Store {
            layout: Layout::new(root),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Promote a rule's output files into the store.
    ///
    /// Each output is entered under its executable-aware content digest;
    /// outputs whose entries already exist are not copied again. Once every
    /// file entry is in place, a metadata entry binding the rule digest to
    /// the output list is installed. If another process has already
    /// installed metadata for the same rule digest, the new record is
    /// discarded: the rule digest uniquely identifies the inputs, so any
    /// existing record is just as correct.
    pub fn promote(&self, rule: RuleDigest, outputs: &[OutputFile]) -> Result<()> {
        self.layout.create_cache_directories()?;

        let mut refs = Vec::with_capacity(outputs.len());

        for output in outputs {
            ensure!(
                !output.name.is_empty()
                    && !output.name.contains('/')
                    && !output.name.contains('\\'),
                "invalid target name `{}`: must be a basename",
                output.name
            );

            let digest = digest_path(&output.path, output.executable)?;
            self.insert_file_entry(&output.path, output.executable, &digest.to_hex())?;
            refs.push(FileRef {
                name: output.name.clone(),
                digest,
            });
        }

        self.insert_metadata_entry(rule, MetadataPayload::Files(refs))
    }

    /// Link one produced file into the file store, unless an entry with its
    /// digest already exists.
    fn insert_file_entry(&self, source: &Path, executable: bool, hex: &str) -> Result<()> {
        let dest = layout::path_of(&self.layout.file_dir(version::CURRENT.files), hex);

        match fs::metadata(&dest) {
            Ok(_) => return Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(format!("failed to probe entry `{}`", dest.display()))
            }
        }

        if let Some(shard) = dest.parent() {
            atry!(
                fs::create_dir_all(shard);
                ["failed to create shard directory `{}`", shard.display()]
            );
        }

        let staged = StagedFile::link_or_copy(source, &self.layout.temp_dir(), hex)?;
        staged.set_entry_permissions(executable)?;
        staged.install(&dest)
    }

    fn insert_metadata_entry(&self, rule: RuleDigest, payload: MetadataPayload) -> Result<()> {
        let dest = layout::path_of(
            &self.layout.metadata_dir(version::CURRENT.metadata),
            &rule.to_hex(),
        );

        match fs::metadata(&dest) {
            // First writer wins; this record would say the same thing.
            Ok(_) => return Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(format!("failed to probe entry `{}`", dest.display()))
            }
        }

        if let Some(shard) = dest.parent() {
            atry!(
                fs::create_dir_all(shard);
                ["failed to create shard directory `{}`", shard.display()]
            );
        }

        let temp_dir = self.layout.temp_dir();
        let mut staged = atry!(
            NamedTempFile::new_in(&temp_dir);
            ["failed to create a staging file in `{}`", temp_dir.display()]
        );
        atry!(
            staged.write_all(&payload.encode());
            ["failed to write staged metadata for rule {}", rule]
        );

        match staged.persist_noclobber(&dest) {
            Ok(_) => Ok(()),

            // Lost the installation race; the staging file is cleaned up
            // when the error value drops.
            Err(ref e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(()),

            Err(e) => Err(e.error)
                .context(format!("failed to install metadata entry `{}`", dest.display())),
        }
    }

    /// Restore a rule's outputs into a build directory by hard-linking them
    /// from the store.
    ///
    /// Metadata written by older supported format versions remains
    /// restorable, so every supported version is consulted, newest first.
    pub fn restore(&self, rule: RuleDigest, build_dir: &Path) -> Result<RestoreOutcome> {
        let hex = rule.to_hex();

        for pair in version::SUPPORTED_VERSIONS.iter().rev() {
            let md_path = layout::path_of(&self.layout.metadata_dir(pair.metadata), &hex);

            let data = match fs::read(&md_path) {
                Ok(d) => d,
                Err(ref e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e)
                        .context(format!("failed to read metadata `{}`", md_path.display()))
                }
            };

            return self.restore_payload(&data, pair.files, build_dir);
        }

        Ok(RestoreOutcome::NotFound)
    }

    fn restore_payload(
        &self,
        data: &[u8],
        files_version: u32,
        build_dir: &Path,
    ) -> Result<RestoreOutcome> {
        let files = match MetadataPayload::parse(data) {
            Ok(MetadataPayload::Files(files)) => files,

            // Value records carry no artifacts to link.
            Ok(MetadataPayload::Value(_)) => return Ok(RestoreOutcome::NotFound),

            Err(e) => return Ok(RestoreOutcome::Corrupt(e)),
        };

        let file_dir = self.layout.file_dir(files_version);

        for fref in &files {
            let entry = layout::path_of(&file_dir, &fref.digest.to_hex());
            let dest = build_dir.join(&fref.name);

            match fs::remove_file(&dest) {
                Ok(_) => {}
                Err(ref e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).context(format!(
                        "failed to clear restore destination `{}`",
                        dest.display()
                    ))
                }
            }

            match fs::hard_link(&entry, &dest) {
                Ok(_) => {}

                Err(ref e) if e.kind() == ErrorKind::NotFound => {
                    return Ok(RestoreOutcome::Corrupt(anyhow!(
                        "file entry `{}` for target `{}` is missing from the store",
                        entry.display(),
                        fref.name
                    )));
                }

                Err(e) => {
                    return Err(e).context(format!(
                        "failed to link `{}` into `{}`",
                        entry.display(),
                        dest.display()
                    ))
                }
            }
        }

        Ok(RestoreOutcome::Restored)
    }
}

/// A file staged in `temp/`. The staging path is unlinked on drop: after a
/// successful install the final path holds its own link, and on any failure
/// the staging link is the debris to clean up.
struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    /// Stage a source file by hard-linking it next to its eventual home.
    /// Falls back to a copy when the source lives on a different filesystem;
    /// such entries simply start out unused.
    fn link_or_copy(source: &Path, temp_dir: &Path, hex: &str) -> Result<Self> {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);

        let path = temp_dir.join(format!(
            "{}-{}-{}",
            process::id(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed),
            hex
        ));

        // Clear crash debris that happens to collide.
        match fs::remove_file(&path) {
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .context(format!("failed to clear staging path `{}`", path.display()))
            }
        }

        // The guard exists before anything lands at the staging path, so
        // even a half-written copy fallback is unlinked on the way out.
        let staged = StagedFile { path };

        match fs::hard_link(source, &staged.path) {
            Ok(_) => {}

            Err(ref e) if e.raw_os_error() == Some(libc::EXDEV) => {
                atry!(
                    fs::copy(source, &staged.path);
                    ["failed to copy `{}` into the store staging area", source.display()]
                );
            }

            Err(e) => {
                return Err(e).context(format!(
                    "failed to link `{}` into the store staging area",
                    source.display()
                ))
            }
        }

        Ok(staged)
    }

    /// Set the permission bits an installed entry must carry: `0o666` masked
    /// by the process umask, with the executable bits added if requested.
    /// When the staging file is a hard link this also adjusts the producer's
    /// copy, which shares the inode by construction.
    fn set_entry_permissions(&self, executable: bool) -> Result<()> {
        let wanted = if executable { 0o777 } else { 0o666 } & !process_umask();

        atry!(
            fs::set_permissions(&self.path, fs::Permissions::from_mode(wanted));
            ["failed to set permissions on staged file `{}`", self.path.display()]
        );
        Ok(())
    }

    /// Install the staged file at its final path. An installed entry is
    /// never replaced: `link(2)` fails instead of clobbering, and losing
    /// the race is fine because the winner's entry holds identical content
    /// and may already be hard-linked from build trees.
    fn install(self, dest: &Path) -> Result<()> {
        match fs::hard_link(&self.path, dest) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => {
                Err(e).context(format!("failed to install entry `{}`", dest.display()))
            }
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn process_umask() -> u32 {
    static UMASK: OnceLock<u32> = OnceLock::new();

    *UMASK.get_or_init(|| {
        // There is no way to read the umask without setting it. This runs
        // once, before any threads care about it.
        unsafe {
            let mask = libc::umask(0);
            libc::umask(mask);
            mask as u32
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::digest::DigestData;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    pub(crate) fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::at_root(dir.path().join("db"));
        (dir, store)
    }

    pub(crate) fn rule(tag: &str) -> RuleDigest {
        RuleDigest(DigestData::of_bytes(tag.as_bytes()))
    }

    pub(crate) fn produce(
        dir: &Path,
        name: &str,
        content: &[u8],
        executable: bool,
    ) -> OutputFile {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        OutputFile {
            name: name.to_owned(),
            path,
            executable,
        }
    }

    #[test]
    fn promote_creates_sharded_entries() {
        let (_tmp, store) = test_store();
        let build = TempDir::new().unwrap();

        let outputs = vec![
            produce(build.path(), "non-exe", b"content\n", false),
            produce(build.path(), "exe", b"content\n", true),
        ];
        store.promote(rule("two-bits"), &outputs).unwrap();

        // Same bytes, differing executable bits: two distinct entries.
        let files = store.layout().file_dir(version::CURRENT.files);
        let plain = files
            .join("5e")
            .join("5e5bb3a0ec0e689e19a59c3ee3d7fca8");
        let exe = files.join("62").join("6274851067c88e9990e912be27cce386");

        assert!(plain.is_file());
        assert!(exe.is_file());

        // The build tree shares inodes with the store.
        assert_eq!(fs::metadata(&plain).unwrap().nlink(), 2);
        assert_eq!(fs::metadata(&exe).unwrap().nlink(), 2);
        assert_ne!(
            fs::metadata(&exe).unwrap().mode() & 0o111,
            0,
            "executable entry must carry an executable bit"
        );
    }

    #[test]
    fn promote_is_idempotent() {
        let (_tmp, store) = test_store();
        let build = TempDir::new().unwrap();

        let outputs = vec![produce(build.path(), "out.bin", b"payload", false)];
        store.promote(rule("idem"), &outputs).unwrap();

        let hex = digest_path(&outputs[0].path, false).unwrap().to_hex();
        let entry = layout::path_of(&store.layout().file_dir(version::CURRENT.files), &hex);
        let before = fs::metadata(&entry).unwrap();

        store.promote(rule("idem"), &outputs).unwrap();

        let after = fs::metadata(&entry).unwrap();
        assert_eq!(before.ino(), after.ino(), "second promote must not re-copy");
        assert_eq!(after.nlink(), 2);
    }

    #[test]
    fn restore_links_all_outputs() {
        let (_tmp, store) = test_store();
        let build_a = TempDir::new().unwrap();
        let build_b = TempDir::new().unwrap();

        let outputs = vec![
            produce(build_a.path(), "prog", b"#!/bin/sh\nexit 0\n", true),
            produce(build_a.path(), "prog.log", b"built ok\n", false),
        ];
        store.promote(rule("prog-rule"), &outputs).unwrap();

        let outcome = store.restore(rule("prog-rule"), build_b.path()).unwrap();
        assert!(matches!(outcome, RestoreOutcome::Restored));

        let prog = build_b.path().join("prog");
        assert_eq!(fs::read(&prog).unwrap(), b"#!/bin/sh\nexit 0\n");
        assert_ne!(fs::metadata(&prog).unwrap().mode() & 0o111, 0);
        assert_eq!(
            fs::read(build_b.path().join("prog.log")).unwrap(),
            b"built ok\n"
        );

        // Store entry + two build trees.
        assert_eq!(fs::metadata(&prog).unwrap().nlink(), 3);
    }

    #[test]
    fn restore_missing_rule_is_not_found() {
        let (_tmp, store) = test_store();
        let build = TempDir::new().unwrap();

        let outcome = store.restore(rule("never-promoted"), build.path()).unwrap();
        assert!(matches!(outcome, RestoreOutcome::NotFound));
    }

    #[test]
    fn restore_with_missing_file_entry_is_corrupt() {
        let (_tmp, store) = test_store();
        let build_a = TempDir::new().unwrap();
        let build_b = TempDir::new().unwrap();

        let outputs = vec![produce(build_a.path(), "gone", b"ephemeral", false)];
        store.promote(rule("gone-rule"), &outputs).unwrap();

        let hex = digest_path(&outputs[0].path, false).unwrap().to_hex();
        let entry = layout::path_of(&store.layout().file_dir(version::CURRENT.files), &hex);
        fs::remove_file(&entry).unwrap();

        let outcome = store.restore(rule("gone-rule"), build_b.path()).unwrap();
        assert!(matches!(outcome, RestoreOutcome::Corrupt(_)));
    }

    #[test]
    fn restore_skips_value_records() {
        let (_tmp, store) = test_store();
        let build = TempDir::new().unwrap();
        store.layout().create_cache_directories().unwrap();

        let r = rule("value-rule");
        let dest = layout::path_of(
            &store.layout().metadata_dir(version::CURRENT.metadata),
            &r.to_hex(),
        );
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, MetadataPayload::Value(b"blob".to_vec()).encode()).unwrap();

        let outcome = store.restore(r, build.path()).unwrap();
        assert!(matches!(outcome, RestoreOutcome::NotFound));
    }

    #[test]
    fn restore_consults_older_versions() {
        let (_tmp, store) = test_store();
        let build_a = TempDir::new().unwrap();
        let build_b = TempDir::new().unwrap();

        let outputs = vec![produce(build_a.path(), "old.bin", b"from the past", false)];
        store.promote(rule("old-rule"), &outputs).unwrap();

        // Retire the current subtrees to the older supported version pair.
        let old = version::SUPPORTED_VERSIONS[0];
        assert_ne!(old, version::CURRENT);
        fs::rename(
            store.layout().metadata_dir(version::CURRENT.metadata),
            store.layout().metadata_dir(old.metadata),
        )
        .unwrap();
        fs::rename(
            store.layout().file_dir(version::CURRENT.files),
            store.layout().file_dir(old.files),
        )
        .unwrap();

        let outcome = store.restore(rule("old-rule"), build_b.path()).unwrap();
        assert!(matches!(outcome, RestoreOutcome::Restored));
        assert_eq!(
            fs::read(build_b.path().join("old.bin")).unwrap(),
            b"from the past"
        );
    }
}
