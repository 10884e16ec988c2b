//! Log filter selection and the persistent log file.
//!
//! The binary owns the `tracing-subscriber` registry. This module decides
//! which directives each sink gets and opens the daily log file, so both
//! decisions can be tested without installing a global subscriber.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "tessera";
pub const LOG_FILE_SUFFIX: &str = "log";
pub const DEFAULT_KEEP_LOG_FILES: usize = 14;

/// Job lifecycle targets. Their per-request debug events (registration,
/// release for retry, reaper shutdown) always reach the log file unless the
/// user picked a filter.
pub const LIFECYCLE_TARGETS: [&str; 2] = ["tessera_core::orchestrator", "tessera_core::store"];

/// Where the active filter came from, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    /// `--log-filter`
    Explicit,
    /// `-v` / `-vv`
    Verbosity,
    /// `RUST_LOG`
    Environment,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChoice {
    pub source: FilterSource,
    pub console: String,
    pub file: String,
}

impl FilterChoice {
    /// Pick the console filter and derive the file filter from it.
    pub fn select(explicit: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        fn non_empty(raw: Option<&str>) -> Option<&str> {
            raw.map(str::trim).filter(|f| !f.is_empty())
        }

        let (source, console) = if let Some(filter) = non_empty(explicit) {
            (FilterSource::Explicit, filter.to_string())
        } else if verbose > 0 {
            let level = if verbose >= 2 { "trace" } else { "debug" };
            (FilterSource::Verbosity, level.to_string())
        } else if let Some(filter) = non_empty(rust_log) {
            (FilterSource::Environment, filter.to_string())
        } else {
            (FilterSource::Default, DEFAULT_LOG_FILTER.to_string())
        };

        let file = match source {
            FilterSource::Explicit | FilterSource::Verbosity => console.clone(),
            FilterSource::Environment | FilterSource::Default => {
                let lifecycle = LIFECYCLE_TARGETS.map(|target| format!("{target}=debug"));
                format!("{console},{}", lifecycle.join(","))
            }
        };

        Self {
            source,
            console,
            file,
        }
    }
}

/// Persistent sink for the file layer.
#[derive(Debug)]
pub enum LogFile {
    Rolling {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// Console-only logging; `reason` says why the file could not be opened.
    Unavailable {
        dir: Option<PathBuf>,
        reason: String,
    },
}

impl LogFile {
    /// Open `<data_dir>/logs/tessera.<date>.log`, rotated daily and pruned to
    /// `keep_files` files.
    pub fn open(data_dir: Option<&Path>, keep_files: usize) -> Self {
        let Some(data_dir) = data_dir else {
            return Self::Unavailable {
                dir: None,
                reason: "no data directory configured".to_string(),
            };
        };

        let dir = data_dir.join(LOG_DIR_NAME);
        if let Err(error) = fs::create_dir_all(&dir) {
            return Self::Unavailable {
                reason: format!("cannot create {}: {error}", dir.display()),
                dir: Some(dir),
            };
        }

        let keep_files = if keep_files == 0 {
            DEFAULT_KEEP_LOG_FILES
        } else {
            keep_files
        };
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix(LOG_FILE_SUFFIX)
            .max_log_files(keep_files)
            .build(&dir)
            .map_or_else(
                |error| Self::Unavailable {
                    reason: format!("cannot open rolling log in {}: {error}", dir.display()),
                    dir: Some(dir.clone()),
                },
                |appender| Self::Rolling {
                    dir: dir.clone(),
                    appender,
                },
            )
    }

    pub fn dir(&self) -> Option<&Path> {
        match self {
            Self::Rolling { dir, .. } => Some(dir.as_path()),
            Self::Unavailable { dir, .. } => dir.as_deref(),
        }
    }
}
