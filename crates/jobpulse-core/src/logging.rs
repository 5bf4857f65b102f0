//! Tracing setup shared by the jobpulse binaries.
//!
//! Events go to one console stream and, when a log directory is configured,
//! are teed into `<dir>/<app>.log` as well.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "JOBPULSE_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    Stdout,
    /// Keeps stdout free for machine readable output.
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub app: &'static str,
    pub console: Console,
    pub default_level: &'static str,
    pub debug: bool,
    /// Empty disables the file copy.
    pub log_dir: String,
}

impl LogSettings {
    pub fn new(app: &'static str, console: Console) -> Self {
        Self {
            app,
            console,
            default_level: "info",
            debug: false,
            log_dir: String::new(),
        }
    }

    /// `--debug` beats `JOBPULSE_LOG_LEVEL`, which beats the default.
    pub fn level(&self) -> String {
        if self.debug {
            return "debug".to_string();
        }
        std::env::var(LOG_LEVEL_ENV)
            .ok()
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| self.default_level.to_string())
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        let dir = self.log_dir.trim();
        if dir.is_empty() {
            return None;
        }
        Some(Path::new(dir).join(format!("{}.log", self.app)))
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn make_writer(console: Console, file: Option<File>) -> BoxMakeWriter {
    match (console, file.map(Arc::new)) {
        (Console::Stdout, Some(file)) => BoxMakeWriter::new(io::stdout.and(file)),
        (Console::Stderr, Some(file)) => BoxMakeWriter::new(io::stderr.and(file)),
        (Console::Stdout, None) => BoxMakeWriter::new(io::stdout),
        (Console::Stderr, None) => BoxMakeWriter::new(io::stderr),
    }
}

/// Installs the global subscriber. A log file that cannot be opened is
/// reported on stderr and skipped. Returns false when a subscriber was
/// already installed.
pub fn init(settings: &LogSettings) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.level()));
    let file = match settings.log_file() {
        Some(path) => match open_append(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("log_file_error: {}: {err}", path.display());
                None
            }
        },
        None => None,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer(settings.console, file))
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
