//! Error types for the engine.
//!
//! The engine exposes a closed set of error kinds so that callers (the RPC
//! layer, tests) can match on the failure class rather than string-compare
//! messages. Operation failures are additionally stored on the affected
//! module slot, which requires the type to be cheaply cloneable.

use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Failure classes surfaced by the engine.
#[derive(Clone, Debug, Error)]
pub enum EngineError {
    /// No module registered at the path, or no file on disk at the path.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A module at this path was already registered.
    #[error("module {} is already registered", .0.display())]
    AlreadyRegistered(PathBuf),

    /// Malformed manifest JSON or an invalid version string within it.
    #[error("parse failure: {0}")]
    Parse(String),

    /// Underlying filesystem failure.
    #[error("i/o failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: Arc<io::Error>,
    },

    /// The toolchain binary could not be discovered or is not runnable.
    #[error("toolchain unavailable: {0}")]
    ToolchainUnavailable(String),

    /// The toolchain ran but reported failure.
    #[error("toolchain failure: {0}")]
    Toolchain(String),

    /// The operation was interrupted by engine shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Wrap an [`io::Error`], mapping the not-found kind onto
    /// [`EngineError::NotFound`] so callers can treat absent files
    /// distinctly from real failures.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            EngineError::NotFound(path)
        } else {
            EngineError::Io {
                path,
                source: Arc::new(source),
            }
        }
    }

    /// Whether this error is the not-found kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}
