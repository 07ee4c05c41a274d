//! Error handling module for pkgvault
//!
//! Provides centralized error types using thiserror. Pipeline operations report
//! failures as counts (see `backup`/`restore`), so these types are used at the
//! seams where a step can fail as a whole: ownership resolution, archive I/O,
//! configuration and shell launching.

use thiserror::Error;

/// Main error type for pkgvault
#[derive(Error, Debug)]
pub enum PkgVaultError {
    /// IO errors (file operations, pipes, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure launching or talking to a shell session (not a command's own exit code)
    #[error("Execution fault: {0}")]
    Execution(String),

    /// Owner lookup for a path failed
    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    /// Archive collaborator errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pkgvault operations
pub type Result<T> = std::result::Result<T, PkgVaultError>;

impl PkgVaultError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an execution fault
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create an archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }
}

/// Failure to determine the owner of a path.
///
/// Callers must not apply a permission fix after receiving one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OwnershipError {
    /// The helper printed nothing
    #[error("got empty result from ownership helper")]
    EmptyOutput,

    /// The helper printed more than the single record line
    #[error("unexpected ownership result from helper: {}", lines.join("\n"))]
    UnexpectedOutput { lines: Vec<String> },

    /// The record line was not a `{uid, gid}` object
    #[error("error parsing ownership record {line:?}: {reason}")]
    MalformedRecord { line: String, reason: String },

    /// `stat` output did not contain both `Uid: (` and `Gid: (` fields
    #[error("no uid or gid found in stat output")]
    MissingIds { output: String },

    /// A textual id was empty
    #[error("cannot construct ownership with empty uid or gid")]
    EmptyId,
}
