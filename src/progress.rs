//! Build output: stage banners, per-target reports, and debug lines.
//!
//! Everything user-visible goes through one instance so concurrent workers
//! never interleave within a report.  Output lines are classified by their
//! first character:
//!
//! * `*` a build stage
//! * `@` a per-target report with status and duration
//! * `#` the full command being run (verbose mode)
//! * `>` debug detail
//!
//! Warnings and errors go to stderr with `[Warn]`/`[Error]` prefixes.

use crate::terminal::{self, Color};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

pub struct Progress {
    out: Mutex<()>,
    verbose: AtomicBool,
    debug_level: AtomicU32,
}

impl Default for Progress {
    fn default() -> Self {
        Progress {
            out: Mutex::new(()),
            verbose: AtomicBool::new(false),
            debug_level: AtomicU32::new(0),
        }
    }
}

impl Progress {
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn set_debug_level(&self, level: u32) {
        self.debug_level.store(level, Ordering::Relaxed);
    }

    pub fn debug_level(&self) -> u32 {
        self.debug_level.load(Ordering::Relaxed)
    }

    /// Print a stage banner: "* ...".
    pub fn stage(&self, msg: &str) {
        let _guard = self.out.lock().unwrap();
        println!(
            "{}",
            terminal::paint(&format!("* {}", msg), Color::BrightCyan, terminal::stdout_is_tty())
        );
    }

    /// Print the per-target build report, and the full command in verbose
    /// mode.  Held under one lock so the pair stays adjacent.
    pub fn report_target(&self, name: &str, file: &str, ok: bool, spend_ms: u128, cmd: &str) {
        let _guard = self.out.lock().unwrap();
        let line = format!(
            "@ Build target {} {}, file: {}, spend: {} ms",
            name,
            if ok { "OK" } else { "failed" },
            file,
            spend_ms
        );
        println!(
            "{}",
            terminal::paint(&line, Color::BrightYellow, terminal::stdout_is_tty())
        );
        if self.verbose() {
            println!("# {}", cmd);
        }
    }

    /// Print a debug line ("> ...") when the debug level is at least `level`.
    pub fn debug(&self, level: u32, msg: &str) {
        if self.debug_level() < level {
            return;
        }
        let _guard = self.out.lock().unwrap();
        println!("> {}", msg);
    }

    pub fn warn(&self, msg: &str) {
        let _guard = self.out.lock().unwrap();
        eprintln!("[Warn]{}", msg);
    }

    pub fn error(&self, msg: &str) {
        let _guard = self.out.lock().unwrap();
        eprintln!(
            "{}",
            terminal::paint(&format!("[Error]{}", msg), Color::BrightRed, terminal::stderr_is_tty())
        );
    }
}
