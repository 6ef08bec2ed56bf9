// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! A shared content-addressed cache for the outputs of reproducible build
//! rules.
//!
//! The cache is a plain directory tree that any number of concurrent build
//! processes may use at once. Producers [`promote`](Store::promote) a rule's
//! output files into the store under their content digests, and bind a rule
//! digest to the output list through a small metadata entry. Consumers
//! [`restore`](Store::restore) a rule's outputs into a build tree as hard
//! links. The [trimmer](trim) reclaims disk space by dropping broken
//! metadata and evicting file entries that no build tree links anymore,
//! oldest first.
//!
//! There is no daemon and no locking: all coordination rides on the
//! atomicity of `rename(2)` and `link(2)` within the store root, which is
//! why network filesystems are unsupported.

pub mod config;
pub mod digest;
pub mod layout;
pub mod metadata;
pub mod status;
pub mod store;
pub mod trim;
pub mod version;

pub use digest::{DigestData, RuleDigest};
pub use store::{OutputFile, RestoreOutcome, Store};
pub use trim::{TrimGoal, TrimResult};
