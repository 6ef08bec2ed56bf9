// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! Content digests for cache entries.
//!
//! The cache keys everything off a fixed-width 128-bit digest. MD5 is the
//! historical choice here; callers must not rely on any cryptographic
//! strength, only on collision unlikelihood for build inputs. Digests appear
//! on disk as 32-character lowercase hex strings.

use digest::Digest;
use md5::Md5;
use serde::Serialize;
use std::{
    fmt, fs, io,
    path::Path,
};
use tectonic_errors::{anyhow::Context, prelude::*};

/// The hasher used to compute data digests.
pub type DigestComputer = Md5;

const N_BYTES: usize = 16;

/// The length of a digest in its canonical hex form.
pub const HEX_LEN: usize = 2 * N_BYTES;

/// A 128-bit content digest.
///
/// Two digests are equal if and only if they were computed from the same byte
/// sequence. The derived ordering is byte-lexicographic, which matches the
/// ordering of the hex encodings.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DigestData([u8; N_BYTES]);

impl DigestData {
    /// Digest a byte sequence held in memory.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut result = [0u8; N_BYTES];
        result.copy_from_slice(DigestComputer::digest(bytes.as_ref()).as_slice());
        DigestData(result)
    }

    /// Digest the contents of a file, streaming rather than slurping.
    pub fn of_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut f = atry!(
            fs::File::open(path);
            ["failed to open `{}` for digesting", path.display()]
        );
        let mut dc = DigestComputer::new();
        atry!(
            io::copy(&mut f, &mut dc);
            ["failed to read `{}` while digesting", path.display()]
        );

        let mut result = [0u8; N_BYTES];
        result.copy_from_slice(dc.finalize().as_slice());
        Ok(DigestData(result))
    }

    /// Digest a file's contents combined with its executable bit.
    ///
    /// The executable bit is part of a file entry's identity: two otherwise
    /// identical files whose executable bits differ get distinct entries.
    /// The combined digest rehashes the raw content digest with a single
    /// trailing tag byte. The tag values (`0` for executable, `1` for plain)
    /// are baked into every existing store and must never change without a
    /// file-store version bump.
    pub fn of_file_with_executable_bit(path: impl AsRef<Path>, executable: bool) -> Result<Self> {
        let content = Self::of_file(path)?;

        let mut buf = Vec::with_capacity(N_BYTES + 1);
        buf.extend_from_slice(&content.0);
        buf.push(if executable { 0 } else { 1 });
        Ok(Self::of_bytes(&buf))
    }

    /// Digest the stat tuple of a path that unexpectedly turned out to be a
    /// directory.
    ///
    /// This is a placeholder: the tuple includes mtime and ctime, so the
    /// result is not reproducible across machines. Callers should avoid
    /// handing directories to [`Self::of_file_with_executable_bit`] in the
    /// first place.
    pub fn of_directory_stat(metadata: &fs::Metadata) -> Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let tuple = (
            metadata.size(),
            metadata.mode(),
            metadata.mtime(),
            metadata.ctime(),
        );
        Self::of_generic(&tuple)
    }

    /// Digest the canonical serialization of a structured value.
    ///
    /// The serialization is bincode's fixed-width little-endian encoding,
    /// which depends solely on the value tree: equal values produce equal
    /// digests regardless of how the caller's storage is shared internally.
    pub fn of_generic<T: Serialize>(value: &T) -> Result<Self> {
        let data = atry!(
            bincode::serialize(value);
            ["failed to serialize a value for digesting"]
        );
        Ok(Self::of_bytes(&data))
    }

    /// Parse a digest from its canonical hex form.
    ///
    /// Only 32-character lowercase hex strings are accepted; anything else
    /// yields `None`. Entry enumeration leans on this to ignore stray
    /// non-entry files in the store.
    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();

        if bytes.len() != HEX_LEN {
            return None;
        }

        let mut result = [0u8; N_BYTES];

        for (i, pair) in bytes.chunks(2).enumerate() {
            result[i] = (hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?;
        }

        Some(DigestData(result))
    }

    /// Express this digest in its canonical hex form.
    pub fn to_hex(&self) -> String {
        format!("{}", self)
    }
}

impl fmt::Display for DigestData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// The digest identifying one rule execution's input set.
///
/// This has the same shape as a content digest but is a distinct logical
/// type: it is chosen by the build system, not computed from stored bytes,
/// and it keys metadata entries rather than file entries.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RuleDigest(pub DigestData);

impl RuleDigest {
    pub fn from_hex(text: &str) -> Option<Self> {
        DigestData::from_hex(text).map(RuleDigest)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl From<DigestData> for RuleDigest {
    fn from(d: DigestData) -> Self {
        RuleDigest(d)
    }
}

impl fmt::Display for RuleDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Digest a file, probing what kind of thing it is first.
///
/// Regular files get the executable-aware digest; a path that resolves to a
/// directory gets the stat-tuple placeholder digest instead of an error.
pub fn digest_path(path: impl AsRef<Path>, executable: bool) -> Result<DigestData> {
    let path = path.as_ref();

    let metadata = atry!(
        fs::metadata(path);
        ["failed to probe `{}` for digesting", path.display()]
    );

    if metadata.is_dir() {
        DigestData::of_directory_stat(&metadata)
            .with_context(|| format!("failed to digest directory stats of `{}`", path.display()))
    } else {
        DigestData::of_file_with_executable_bit(path, executable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            DigestData::of_bytes(b"").to_hex(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            DigestData::of_bytes(b"abc").to_hex(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn hex_round_trip() {
        let d = DigestData::of_bytes(b"some bytes");
        assert_eq!(DigestData::from_hex(&d.to_hex()), Some(d));
    }

    #[test]
    fn from_hex_rejects_non_canonical() {
        assert!(DigestData::from_hex("").is_none());
        assert!(DigestData::from_hex("d41d8cd98f00b204e9800998ecf8427").is_none());
        assert!(DigestData::from_hex("d41d8cd98f00b204e9800998ecf8427ef").is_none());
        assert!(DigestData::from_hex("D41D8CD98F00B204E9800998ECF8427E").is_none());
        assert!(DigestData::from_hex("d41d8cd98f00b204e9800998ecf8427g").is_none());
        assert!(DigestData::from_hex("..1d8cd98f00b204e9800998ecf8427e").is_none());
    }

    #[test]
    fn executable_bit_distinguishes() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, b"content\n").unwrap();

        let plain = DigestData::of_file_with_executable_bit(&p, false).unwrap();
        let exe = DigestData::of_file_with_executable_bit(&p, true).unwrap();

        assert_ne!(plain, exe);
        assert_eq!(plain.to_hex(), "5e5bb3a0ec0e689e19a59c3ee3d7fca8");
        assert_eq!(exe.to_hex(), "6274851067c88e9990e912be27cce386");
    }

    #[test]
    fn directory_paths_get_placeholder_digests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"payload").unwrap();

        let d1 = digest_path(dir.path(), false).unwrap();
        let d2 = digest_path(dir.path(), false).unwrap();
        assert_eq!(d1, d2);

        let file = digest_path(&dir.path().join("f"), false).unwrap();
        assert_ne!(d1, file);
    }

    #[test]
    fn generic_digest_is_structural() {
        #[derive(serde::Serialize)]
        struct Pair {
            left: String,
            right: String,
        }

        let shared = String::from("shared");

        let a = Pair {
            left: shared.clone(),
            right: shared,
        };
        let b = Pair {
            left: "shared".into(),
            right: "shared".into(),
        };

        assert_eq!(
            DigestData::of_generic(&a).unwrap(),
            DigestData::of_generic(&b).unwrap()
        );

        let c = Pair {
            left: "shared".into(),
            right: "different".into(),
        };
        assert_ne!(
            DigestData::of_generic(&b).unwrap(),
            DigestData::of_generic(&c).unwrap()
        );
    }
}
