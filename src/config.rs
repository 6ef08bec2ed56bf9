// Copyright 2022 the Tectonic Project
// Licensed under the MIT License

//! Resolution of the store root from the environment.

use std::{env, path::PathBuf};
use tectonic_errors::prelude::*;

/// The environment variable overriding the store root.
pub const ROOT_ENV_VAR: &str = "DUNE_CACHE_ROOT";

/// Determine the directory holding the store.
///
/// `DUNE_CACHE_ROOT` wins if set, and must be an absolute path; otherwise the
/// store lives at `dune/db` inside the platform cache directory
/// (`$XDG_CACHE_HOME` or its platform default). Nothing is created here;
/// scaffolding appears lazily before the first write.
pub fn get_store_root() -> Result<PathBuf> {
    if let Some(value) = env::var_os(ROOT_ENV_VAR) {
        let root = PathBuf::from(value);
        ensure!(
            root.is_absolute(),
            "the {} environment variable must hold an absolute path, not `{}`",
            ROOT_ENV_VAR,
            root.display()
        );
        return Ok(root);
    }

    let mut root = a_ok_or!(
        dirs::cache_dir();
        ["cannot determine the user cache directory"]
    );
    root.push("dune");
    root.push("db");
    Ok(root)
}
