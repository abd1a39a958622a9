//! Error types for microbatch.

use thiserror::Error;

/// Result type alias for microbatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for microbatch.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    ///
    /// Seeing this out of a gated `append_slot` is an invariant violation:
    /// `can_append` must be consulted first.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// A request was rejected before admission.
    #[error("invalid request {request_id}: {reason}")]
    InvalidRequest { request_id: u64, reason: String },

    /// A prompt can never fit the configured block pool.
    #[error(
        "request {request_id} needs {required_blocks} blocks but the pool only holds {pool_blocks}"
    )]
    CapacityExhausted {
        request_id: u64,
        required_blocks: usize,
        pool_blocks: usize,
    },

    /// Sequence not found in its group or block table.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The model step failed; the engine cannot recover.
    #[error("model step failed: {0}")]
    ModelStep(String),

    /// An internal invariant was broken; the engine cannot recover.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A previous fatal error left the engine quiescent; only shutdown is valid.
    #[error("engine aborted after a fatal error")]
    EngineAborted,

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
