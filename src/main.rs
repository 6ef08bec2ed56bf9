// Copyright 2022 the Tectonic Project
// Licensed under the MIT License

use clap::{Args, Parser, Subcommand};
use tectonic_errors::prelude::*;
use tectonic_status_base::{tt_note, ChatterLevel, StatusBackend};

use stowage::{
    status::TermcolorStatusBackend,
    store::Store,
    trim::TrimGoal,
};

fn main() {
    // Usage errors must exit 1, not clap's default of 2; --help and
    // --version also land in the error branch and exit 0.
    let args = match ToplevelArgs::try_parse() {
        Ok(a) => a,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let mut status =
        Box::new(TermcolorStatusBackend::new(ChatterLevel::Normal)) as Box<dyn StatusBackend>;

    if let Err(e) = args.exec(status.as_mut()) {
        status.report_error(&e);
        std::process::exit(1)
    }
}

/// Manage the shared build-artifact cache.
#[derive(Debug, Parser)]
#[command(name = "stowage")]
struct ToplevelArgs {
    #[command(subcommand)]
    action: Action,
}

impl ToplevelArgs {
    fn exec(self, status: &mut dyn StatusBackend) -> Result<()> {
        match self.action {
            Action::Trim(a) => a.exec(status),
            Action::Gc(a) => a.exec(status),
            Action::Size(a) => a.exec(status),
            Action::Start(a) => a.exec(status),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Delete broken metadata and evict unused entries to meet a byte goal
    Trim(TrimArgs),

    /// Delete broken metadata without evicting any file entries
    Gc(GcArgs),

    /// Print the bytes held by unused entries
    Size(SizeArgs),

    /// Start the cache daemon (removed)
    #[command(hide = true)]
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct TrimArgs {
    /// Reduce the unused-entry overhead to at most this many bytes
    #[arg(long, value_name = "BYTES", conflicts_with = "freed")]
    size: Option<u64>,

    /// Free at least this many bytes
    #[arg(long, value_name = "BYTES")]
    freed: Option<u64>,
}

impl TrimArgs {
    fn exec(self, status: &mut dyn StatusBackend) -> Result<()> {
        let goal = match (self.size, self.freed) {
            (Some(bytes), None) => TrimGoal::Size(bytes),
            (None, Some(bytes)) => TrimGoal::Freed(bytes),
            _ => bail!("pass exactly one of --size and --freed"),
        };

        let store = Store::open()?;
        let result = store.trim(goal, status)?;
        tt_note!(status, "freed {} bytes", result.freed_bytes);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct GcArgs {}

impl GcArgs {
    fn exec(self, status: &mut dyn StatusBackend) -> Result<()> {
        let store = Store::open()?;
        let result = store.garbage_collect(status)?;
        tt_note!(status, "freed {} bytes", result.freed_bytes);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct SizeArgs {}

impl SizeArgs {
    fn exec(self, _status: &mut dyn StatusBackend) -> Result<()> {
        let store = Store::open()?;
        println!("{}", store.overhead_size()?);
        Ok(())
    }
}

#[derive(Args, Debug)]
struct StartArgs {}

impl StartArgs {
    fn exec(self, _status: &mut dyn StatusBackend) -> Result<()> {
        bail!(
            "daemon-mode has been withdrawn; the cache is managed directly by \
             its client processes, and `trim` replaces the daemon's eviction"
        );
    }
}
