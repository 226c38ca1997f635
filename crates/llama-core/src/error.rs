//! Unified error types for the decoder.
//!
//! Every error here is a programming or configuration error surfaced
//! synchronously; nothing is retried internally.

use std::path::PathBuf;

/// Main error type for model construction, loading and decoding.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    /// A tensor or configuration dimension disagrees with what the model expects.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A rotary slice or cache append reached past the position capacity.
    #[error("position {requested} out of range (capacity {capacity})")]
    PositionOutOfRange { requested: usize, capacity: usize },

    /// A token id outside `[0, vocab_size)`.
    #[error("invalid token id {id} (vocab size {vocab_size})")]
    InvalidTokenId { id: u32, vocab_size: usize },

    /// The incremental decoding state machine was driven out of order.
    #[error("cache state error: {0}")]
    CacheStateError(String),

    /// A required base parameter is absent from a weight map.
    #[error("missing weight: {0}")]
    MissingWeight(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint or tokenizer file could not be read.
    #[error("model load failed for {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Tokenization failed.
    #[error("tokenization failed: {0}")]
    Tokenization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error raised by the tensor backend.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Convenience type alias for Results with LlamaError.
pub type LlamaResult<T> = Result<T, LlamaError>;

impl LlamaError {
    /// Create a shape mismatch error with message.
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Create a cache state error with message.
    pub fn cache_state(msg: impl Into<String>) -> Self {
        Self::CacheStateError(msg.into())
    }

    /// Create a missing weight error for a parameter name.
    pub fn missing_weight(name: impl Into<String>) -> Self {
        Self::MissingWeight(name.into())
    }

    /// Create a config error with message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a tokenization error with message.
    pub fn tokenization(msg: impl Into<String>) -> Self {
        Self::Tokenization(msg.into())
    }

    /// Create a serialization error with message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for LlamaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LlamaError::PositionOutOfRange {
            requested: 40,
            capacity: 32,
        };
        assert_eq!(err.to_string(), "position 40 out of range (capacity 32)");

        let err = LlamaError::InvalidTokenId {
            id: 12,
            vocab_size: 10,
        };
        assert_eq!(err.to_string(), "invalid token id 12 (vocab size 10)");
    }

    #[test]
    fn test_error_constructors() {
        let err = LlamaError::shape_mismatch("dim 10 not divisible by 3 heads");
        assert!(matches!(err, LlamaError::ShapeMismatch(_)));

        let err = LlamaError::cache_state("streaming before priming");
        assert!(matches!(err, LlamaError::CacheStateError(_)));
    }

    #[test]
    fn test_tensor_error_is_transparent() {
        let inner = candle_core::Error::Msg("backend failure".to_string());
        let err: LlamaError = inner.into();
        assert_eq!(err.to_string(), "backend failure");
    }
}
