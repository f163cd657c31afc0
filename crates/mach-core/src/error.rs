use std::path::PathBuf;

use thiserror::Error;

/// The error taxonomy for the build-graph engine.
///
/// Every variant is reported uniformly as a single-line user-facing error by the
/// top-level command dispatcher (out of scope here); the core itself only ever panics
/// for invariant violations (e.g. "no units collected"), never for these.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("bad directive at {file}:{line}: {message}")]
    BadDirective {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{0} is a directory but has no library manifest")]
    BadLibrary(PathBuf),

    #[error("no package index is available")]
    PackageIndexMissing,

    #[error("unknown library: {0}")]
    UnknownLibrary(String),

    #[error("build failed (driver exited with status {0})")]
    BuildFailed(i32),

    #[error("file watcher executable not found: {0}")]
    WatcherMissing(String),

    #[error("internal error during {operation}: {message}")]
    Internal { operation: String, message: String },
}

impl Error {
    pub fn internal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Internal {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
