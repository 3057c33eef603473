//! Error types for the session engine.

use std::io;

use thiserror::Error;

/// Errors returned by session operations.
///
/// Safety-gate refusals are not errors: they come back as
/// `ExecutionResult::Blocked` / `ExecutionResult::Cancelled`.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No job is registered under this pid.
    #[error("no job found with pid {pid}")]
    NotFound { pid: u32 },

    /// The OS could not allocate a PTY or start the process.
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Writing to a live process failed.
    #[error("failed to send input to pid {pid}: {source}")]
    WriteFailed {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// A configured safety pattern is not a valid regex.
    #[error("invalid safety pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The terminal takeover collaborator failed.
    #[error("terminal takeover failed: {0}")]
    Takeover(#[source] io::Error),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
