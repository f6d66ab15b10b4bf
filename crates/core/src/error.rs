//! Error taxonomy shared by both service planes.

/// Errors surfaced to API callers and upgrade clients.
///
/// Callers only ever see the category and a short reason; internals stay in
/// the logs, keyed by request id.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad API key, bad token signature/expiry/audience, or claim mismatch.
    #[error("unauthorized")]
    Unauthorized,

    /// Single-use token already consumed (or never minted).
    #[error("replayed")]
    Replayed,

    /// Caller exceeded the admission window budget.
    #[error("rate limited")]
    RateLimited,

    /// Request body failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown session id.
    #[error("not found")]
    NotFound,

    /// Worker submission or endpoint resolution failed.
    #[error("orchestrator failure: {0}")]
    OrchestratorFailure(String),

    /// Store operation failed beyond the retry budget.
    #[error("store failure: {0}")]
    StoreFailure(String),

    /// Network blip at the proxy; retryable by the caller.
    #[error("transient failure")]
    Transient,
}

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not obtain a pooled connection.
    #[error("pool error: {0}")]
    Pool(String),

    /// Query execution failed.
    #[error("query error: {0}")]
    Query(String),

    /// The operation did not complete within the configured timeout.
    #[error("store operation timed out")]
    Timeout,

    /// Insert hit an existing primary key.
    #[error("duplicate key")]
    Duplicate,

    /// The targeted row does not exist (or, for consumption, was already
    /// removed by another consumer).
    #[error("row absent")]
    Absent,

    /// One-shot update rejected because the column is already set.
    #[error("value already set")]
    Conflict,

    /// The pool has been closed during shutdown.
    #[error("store closed")]
    Closed,
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(state) = e.code()
            && *state == tokio_postgres::error::SqlState::UNIQUE_VIOLATION
        {
            return StoreError::Duplicate;
        }
        StoreError::Query(e.to_string())
    }
}

impl StoreError {
    /// Whether a retry on a fresh connection could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Pool(_) | StoreError::Timeout)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Absent => ApiError::NotFound,
            other => ApiError::StoreFailure(other.to_string()),
        }
    }
}
