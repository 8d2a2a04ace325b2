//! Error taxonomy for the dispatch engine.
//!
//! Conditional-write misses and state races are values here, not panics:
//! the scheduler and the API branch on the variant (`Conflict`, `Gone`) as
//! normal control flow. Only `Unavailable` is retryable.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Validation failure at the API boundary. Never retried.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Entity absent: unknown dispatch/ride/driver, geocode miss, or an
    /// empty candidate set.
    #[error("not found: {0}")]
    NotFound(String),

    /// State advanced past the caller's expectation (late ack after
    /// timeout, ack after cancel).
    #[error("gone: {0}")]
    Gone(String),

    /// Optimistic-concurrency miss; the caller re-reads and decides.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient upstream fault (driver index, ETA oracle, sink). Retried
    /// with capped exponential backoff at the call site.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected invariant violation. Logged with the correlation id,
    /// never silently swallowed.
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the fault is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }

    pub fn bad_input(msg: impl Into<String>) -> Self {
        EngineError::BadInput(msg.into())
    }
}
