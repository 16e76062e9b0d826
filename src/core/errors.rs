// Error types for the detection core
//
// Caller-visible failures (DetectError) are kept apart from the expected
// model fallback (ModelError), which is recovered inside the analyzer and only
// ever surfaces as an advisory on the DetectionSet.

use thiserror::Error;

/// Errors returned to callers of the detection pipeline
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectError {
    #[error("Invalid input buffer: {reason}")]
    InvalidInput { reason: String },

    #[error("Unsupported option `{option}`: {reason}")]
    UnsupportedOption { option: String, reason: String },

    #[error("Detection timed out after {elapsed_ms}ms")]
    ProcessingTimeout { elapsed_ms: u64 },

    #[error("Detection was cancelled")]
    Cancelled,

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

impl DetectError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn unsupported(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// ML backend failures; never propagated past the analyzer
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Model loading timed out after {0}ms")]
    LoadTimedOut(u64),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    #[error("Inference cancelled")]
    Cancelled,
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for ModelError {
    fn from(err: ort::Error) -> Self {
        ModelError::InferenceFailed(err.to_string())
    }
}

/// Analyzer configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_concurrent_pages must be > 0, got {0}")]
    InvalidConcurrency(usize),

    #[error("cache_capacity must be > 0, got {0}")]
    InvalidCacheCapacity(usize),

    #[error("Invalid timeout for {name}: {reason}")]
    InvalidTimeout { name: &'static str, reason: String },

    #[error("ml_input_size must be between 320 and 2048, got {0}")]
    InvalidModelInputSize(u32),

    #[error("Environment variable parsing failed: {0}")]
    EnvVarError(String),
}

pub type DetectResult<T> = Result<T, DetectError>;
pub type ModelResult<T> = Result<T, ModelError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = DetectError::unsupported("binarization_method", "unknown method 'niblack'");
        assert_eq!(
            err.to_string(),
            "Unsupported option `binarization_method`: unknown method 'niblack'"
        );

        let err = DetectError::ProcessingTimeout { elapsed_ms: 1500 };
        assert!(err.to_string().contains("1500ms"));
    }
}
