//! Error taxonomy shared across the engine.
//!
//! The variants matter operationally: `Transient` failures are retry
//! candidates, `Permanent` and `AuthFailed` are not, and the concurrency
//! variants tell callers they lost a race rather than hit a bug.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Caller supplied an invalid request.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The platform rejected our credential.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Lost a state-transition race to another worker.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The account is already claimed by another operator.
    #[error("resource already claimed: {0}")]
    AlreadyClaimed(String),

    /// Operator is at their claim limit.
    #[error("claim limit of {0} reached")]
    LimitExceeded(usize),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Stored data violates an internal invariant.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
