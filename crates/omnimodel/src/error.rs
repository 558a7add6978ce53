//! Error taxonomy for the runtime core.
//!
//! Every failure the core surfaces carries enough structured context for a
//! caller to decide whether to retry, reconfigure, or abort. Recoverability
//! drives the retry layer: only recoverable kinds are ever retried.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A requested model, modality, or cache key is absent. The caller
    /// should load a model first.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The adapter or its native runtime failed to construct a model
    /// instance.
    #[error("failed to load model from {path}: {reason}")]
    LoadFailure { path: PathBuf, reason: String },

    /// An operation handler failed during execution.
    #[error("inference failed on model {model_id}: {reason}")]
    InferenceFailure { model_id: String, reason: String },

    /// The format or operation is not implemented by any registered
    /// adapter. Not recoverable without registering a different adapter.
    #[error("{subject} does not support {operation}")]
    Unsupported { subject: String, operation: String },

    /// The caller supplied malformed input.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Required memory exceeds what is available or what the cache is
    /// allowed to hold. Not recoverable without freeing resources.
    #[error("resource exhaustion: required {required} bytes, {available} available")]
    ResourceExhaustion { required: u64, available: u64 },

    /// An operation exceeded its allotted time.
    #[error("operation timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// Network failure while resolving or downloading a remote model.
    #[error("transport error for {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// The caller cancelled the operation through a cancellation token.
    /// Not part of the retryable surface.
    #[error("operation cancelled")]
    Cancelled,
}

impl RuntimeError {
    /// Short stable tag for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::NotFound { .. } => "not_found",
            RuntimeError::LoadFailure { .. } => "load_failure",
            RuntimeError::InferenceFailure { .. } => "inference_failure",
            RuntimeError::Unsupported { .. } => "unsupported",
            RuntimeError::InvalidInput { .. } => "invalid_input",
            RuntimeError::ResourceExhaustion { .. } => "resource_exhaustion",
            RuntimeError::Timeout { .. } => "timeout",
            RuntimeError::Transport { .. } => "transport",
            RuntimeError::Cancelled => "cancelled",
        }
    }

    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RuntimeError::NotFound { .. }
                | RuntimeError::LoadFailure { .. }
                | RuntimeError::InferenceFailure { .. }
                | RuntimeError::InvalidInput { .. }
                | RuntimeError::Timeout { .. }
                | RuntimeError::Transport { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(RuntimeError::Timeout { waited_ms: 100 }.is_recoverable());
        assert!(RuntimeError::Transport {
            endpoint: "http://localhost".into(),
            reason: "refused".into()
        }
        .is_recoverable());
        assert!(!RuntimeError::Unsupported {
            subject: "model".into(),
            operation: "detect".into()
        }
        .is_recoverable());
        assert!(!RuntimeError::ResourceExhaustion { required: 2, available: 1 }.is_recoverable());
        assert!(!RuntimeError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(RuntimeError::NotFound { what: "x".into() }.kind(), "not_found");
        assert_eq!(
            RuntimeError::ResourceExhaustion { required: 0, available: 0 }.kind(),
            "resource_exhaustion"
        );
    }

    #[test]
    fn test_display_carries_context() {
        let err = RuntimeError::ResourceExhaustion { required: 4096, available: 1024 };
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
    }
}
