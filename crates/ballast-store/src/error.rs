//! Store error types.

use thiserror::Error;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the object client.
///
/// Transient backend faults (timeouts, 5xx) are retried inside the client;
/// anything that escapes the retry budget arrives here as `Unavailable`.
/// Conditional-write conflicts are never retried.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// `If-Match` conditional write lost the race
    #[error("conditional write conflict: {0}")]
    PreconditionFailed(String),

    /// `If-None-Match: *` conditional write found an existing object
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Backend failure after the retry budget was exhausted
    #[error("object store unavailable: {0}")]
    Unavailable(String),

    /// Backend response carried no etag where one is required
    #[error("backend returned no etag for {0}")]
    MissingEtag(String),

    /// Client could not be constructed from the given settings
    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// True for conditional-write losses (either put mode).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::PreconditionFailed(_) | StoreError::AlreadyExists(_)
        )
    }

    pub(crate) fn from_backend(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
            object_store::Error::Precondition { path, .. } => StoreError::PreconditionFailed(path),
            object_store::Error::AlreadyExists { path, .. } => StoreError::AlreadyExists(path),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
