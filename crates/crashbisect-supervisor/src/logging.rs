//! Structured logging for the supervisor and the CLI.
//!
//! Human-readable compact output goes to stderr. When a log directory is
//! given, the same events are also written as JSON lines to
//! `<log_dir>/crashbisect.log.jsonl` for post-hoc analysis with `jq`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FILE_NAME: &str = "crashbisect.log.jsonl";

/// Returned by [`init_logging`]; keep it alive for the life of the program.
#[derive(Debug)]
pub struct LogGuard {
    /// JSON-lines file, if file logging was requested.
    pub log_path: Option<PathBuf>,
}

#[derive(Clone)]
struct SharedFileWriter {
    file: Arc<Mutex<File>>,
}

impl<'a> MakeWriter<'a> for SharedFileWriter {
    type Writer = SharedFileGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileGuard {
            guard: self.file.lock(),
        }
    }
}

/// Holds the file lock for one event.
struct SharedFileGuard<'a> {
    guard: MutexGuard<'a, File>,
}

impl io::Write for SharedFileGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut *self.guard, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut *self.guard)
    }
}

/// Install the global subscriber.
///
/// `verbose` lowers the default filter from `info` to `debug`; `RUST_LOG`
/// overrides either.
///
/// # Errors
///
/// The log directory or file cannot be created, or a global subscriber is
/// already installed.
pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> io::Result<LogGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (json_layer, log_path) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(LOG_FILE_NAME);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let writer = SharedFileWriter {
                file: Arc::new(Mutex::new(file)),
            };
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_names(true);
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(terminal_layer)
        .with(json_layer)
        .try_init()
        .map_err(io::Error::other)?;

    Ok(LogGuard { log_path })
}

/// Terminal-only logging for tests. Safe to call from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_test_writer()
                .compact(),
        )
        .try_init();
}
