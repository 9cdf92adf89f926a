use thiserror::Error;

/// Errors from step store operations (used by the store traits in durable-core).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient contention on the single writer ("database is locked").
    /// Retried by the store before it ever reaches a caller.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("busy after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("step record not found: {0}")]
    NotFound(String),

    #[error("query error: {0}")]
    Query(String),
}

impl StoreError {
    /// Whether the operation that produced this error may be retried.
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

/// Errors from encoding or decoding step results.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode step output: {0}")]
    Encode(String),

    #[error("malformed step output: {0}")]
    Malformed(String),

    #[error("step output type mismatch: recorded '{recorded}', requested '{requested}'")]
    TypeMismatch { recorded: String, requested: String },
}
