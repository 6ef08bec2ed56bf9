// Copyright 2022 the Tectonic Project
// Licensed under the MIT License

//! Status reporting for the command-line front-end.
//!
//! The library proper only ever talks to a [`StatusBackend`]; this module
//! provides the colorized terminal implementation that the CLI installs.

use std::{fmt::Arguments, io::Write};
use tectonic_errors::Error;
use tectonic_status_base::{ChatterLevel, MessageKind, StatusBackend};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// A [`StatusBackend`] that writes colorized reports to standard error.
pub struct TermcolorStatusBackend {
    chatter: ChatterLevel,
    stderr: StandardStream,
}

impl TermcolorStatusBackend {
    pub fn new(chatter: ChatterLevel) -> Self {
        TermcolorStatusBackend {
            chatter,
            stderr: StandardStream::stderr(ColorChoice::Auto),
        }
    }

    fn styled(&mut self, prefix: &str, spec: &ColorSpec, args: Arguments<'_>, err: Option<&Error>) {
        // Status reporting is best-effort: a broken stderr shouldn't take
        // down a cache operation.
        let _ = self.stderr.set_color(spec);
        let _ = write!(self.stderr, "{}", prefix);
        let _ = self.stderr.reset();
        let _ = writeln!(self.stderr, " {}", args);

        if let Some(e) = err {
            for item in e.chain() {
                let _ = writeln!(self.stderr, "caused by: {}", item);
            }
        }
    }
}

impl StatusBackend for TermcolorStatusBackend {
    fn report(&mut self, kind: MessageKind, args: Arguments<'_>, err: Option<&Error>) {
        let (prefix, color, bold) = match kind {
            MessageKind::Note => {
                if matches!(self.chatter, ChatterLevel::Minimal) {
                    return;
                }
                ("note:", Color::Green, false)
            }
            MessageKind::Warning => ("warning:", Color::Yellow, true),
            MessageKind::Error => ("error:", Color::Red, true),
        };

        let mut spec = ColorSpec::new();
        spec.set_fg(Some(color)).set_bold(bold);
        self.styled(prefix, &spec, args, err);
    }

    fn dump_error_logs(&mut self, output: &[u8]) {
        let _ = self.stderr.write_all(output);
        let _ = self.stderr.flush();
    }
}
