// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! On-disk format versions.
//!
//! Each artifact kind in the store carries its own small integer version in
//! its directory name. The writer targets exactly one "current" version per
//! kind; older versions left behind by prior installations are read-only,
//! except that the trimmer reclaims space from them like from anything else.
//!
//! Every metadata version is statically paired with the file-store version
//! its records reference. A change to any digest scheme bumps the file-store
//! version (and with it the paired metadata version); a change to the
//! metadata codec alone bumps only the metadata version. New versions are
//! added by appending rows to [`SUPPORTED_VERSIONS`].

/// A supported metadata version together with the file-store version that
/// its records resolve against.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VersionPair {
    /// The version of the `meta/` subtree.
    pub metadata: u32,

    /// The version of the `files/` subtree paired with it.
    pub files: u32,
}

/// All version pairs the reader side understands, oldest first.
pub const SUPPORTED_VERSIONS: &[VersionPair] = &[
    VersionPair {
        metadata: 4,
        files: 3,
    },
    VersionPair {
        metadata: 5,
        files: 4,
    },
];

/// The version pair the writer targets.
pub const CURRENT: VersionPair = VersionPair {
    metadata: 5,
    files: 4,
};

/// The current version of the reserved `values/` subtree.
pub const CURRENT_VALUES: u32 = 3;

/// Look up the file-store version paired with a metadata version.
pub fn file_version_for(metadata_version: u32) -> Option<u32> {
    SUPPORTED_VERSIONS
        .iter()
        .find(|pair| pair.metadata == metadata_version)
        .map(|pair| pair.files)
}

/// Iterate over the supported file-store versions, oldest first.
pub fn supported_file_versions() -> impl Iterator<Item = u32> {
    SUPPORTED_VERSIONS.iter().map(|pair| pair.files)
}
