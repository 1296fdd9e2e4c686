//! Error types for the brickyard control plane
//!
//! Provides the unified error type shared by the entity store, the
//! allocator, the brick placers, and the operation engine, along with
//! the classification helpers the engine uses to decide whether an
//! error is retryable or must be surfaced to the caller.

use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error("No space")]
    NoSpace,

    #[error("Maximum number of bricks reached")]
    MaxBricks,

    #[error("Minimum brick size limit reached. Out of space")]
    MinimumBrickSize,

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    #[error("Conflict")]
    Conflict,

    #[error("Entry already exists: {id}")]
    Found { id: String },

    #[error("Server busy: too many operations in flight")]
    TooManyOperations,

    // =========================================================================
    // Reference Errors
    // =========================================================================
    #[error("Id not found: {id}")]
    NotFound { id: String },

    #[error("Pending operation entry cannot be loaded: {reason}")]
    NotLoadable { reason: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// A distinguished wrapper around an executor failure that the
    /// operation engine may retry, up to the operation's retry limit.
    #[error("Operation should be retried: {source}")]
    Retry {
        #[source]
        source: Box<Error>,
    },

    #[error("Executor error on host {host}: {reason}")]
    Executor { host: String, reason: String },

    #[error("All hosts failed: {0}")]
    AllHostsFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Error {
    /// Construct a not-found error for the given entity id.
    pub fn not_found(id: impl Into<String>) -> Error {
        Error::NotFound { id: id.into() }
    }

    /// Wrap an error so that the operation engine treats it as retryable.
    pub fn retry(err: Error) -> Error {
        Error::Retry {
            source: Box::new(err),
        }
    }

    /// True if the operation engine may retry the operation that
    /// produced this error.
    pub fn is_retry(&self) -> bool {
        matches!(self, Error::Retry { .. })
    }

    /// Unwrap the underlying cause of a retryable error. Returns the
    /// error itself when it carries no wrapped cause.
    pub fn original(self) -> Error {
        match self {
            Error::Retry { source } => *source,
            other => other,
        }
    }

    /// True for the expected, non-fatal capacity errors that signal
    /// "try fewer resources or a different cluster".
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Error::NoSpace | Error::MaxBricks | Error::MinimumBrickSize
        )
    }

    /// True for errors that signal a competing operation or a violated
    /// structural precondition.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Conflict | Error::Found { .. } | Error::TooManyOperations
        )
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;
