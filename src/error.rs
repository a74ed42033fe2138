// src/error.rs

//! Central error type for consign operations
//!
//! Every fatal condition carries the phase it failed in so callers can
//! surface a specific message instead of a generic "operation failed".

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the provisioning engine
#[derive(Error, Debug)]
pub enum Error {
    /// Bad configuration or version string. Always recoverable locally;
    /// no filesystem mutation has occurred when this is returned.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Checksum mismatch during extract or verify. Fatal for that
    /// operation; nothing is installed.
    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    /// Malformed or corrupted archive, including trailing data left by
    /// an append-after-finalize write.
    #[error("archive error: {0}")]
    Archive(String),

    /// Template substitution produced output that is not well-formed in
    /// the target format, or a required output is missing.
    #[error("template render failed: {0}")]
    Render(String),

    /// Repository index corruption or storage failure. Surfaced
    /// immediately; there is no empty-index fallback.
    #[error("repository error: {0}")]
    Repository(String),

    /// Target version is not an allowed upgrade from the current one.
    #[error("incompatible update: current {current}, target {target}: {reason}")]
    Incompatible {
        current: String,
        target: String,
        reason: String,
    },

    /// Requested package or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An update session is already active against the same install.
    /// Transient; retry once the other session finishes.
    #[error("update session conflict: {0}")]
    SessionActive(String),

    /// Update validation or staging failed and the live install was
    /// restored from backup.
    #[error("update to {target} failed and was rolled back: {reason}")]
    UpdateRolledBack { target: String, reason: String },

    /// Restoring the live install from backup failed. Fatal and
    /// non-retryable; requires manual operator intervention.
    #[error("ROLLBACK FAILED for {live:?}: {reason}; backup preserved at {backup:?}")]
    RollbackFailure {
        live: PathBuf,
        backup: PathBuf,
        reason: String,
    },

    /// An operation failed inside a named phase. Wraps the original
    /// cause so orchestrators never re-throw leaf errors bare.
    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Underlying filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest or index (de)serialization failure
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an error with the phase it occurred in
    pub fn in_phase(phase: &'static str, source: Error) -> Self {
        Error::Phase {
            phase,
            source: Box::new(source),
        }
    }

    /// The process exit code for this error (CLI contract)
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) | Error::Incompatible { .. } => 2,
            Error::Archive(_) | Error::Integrity { .. } => 3,
            Error::UpdateRolledBack { .. } => 5,
            Error::RollbackFailure { .. } => 6,
            Error::Phase { source, .. } => source.exit_code(),
            _ => 4,
        }
    }
}
