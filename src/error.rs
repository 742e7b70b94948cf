//! Error types for fusion architecture search

use thiserror::Error;

use crate::train::SearchPhase;

/// Result type alias for search operations
pub type Result<T> = std::result::Result<T, FusionNasError>;

/// Main error type for the search engine
#[derive(Error, Debug)]
pub enum FusionNasError {
    /// Invalid or inconsistent hyperparameters, detected before any update
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Numeric divergence in {phase} at epoch {epoch}, batch {batch}: {detail}")]
    NumericDivergence {
        epoch: usize,
        phase: SearchPhase,
        batch: usize,
        detail: String,
    },

    #[error("Resource exhausted in {phase} at epoch {epoch}, batch {batch}: {detail}")]
    ResourceExhaustion {
        epoch: usize,
        phase: SearchPhase,
        batch: usize,
        detail: String,
    },

    /// A supplied batch disagrees with the configured modality layout
    #[error("Data contract violated: {0}")]
    DataContract(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },
}

impl FusionNasError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        FusionNasError::Configuration(msg.into())
    }

    /// Shorthand for a data contract error
    pub fn data(msg: impl Into<String>) -> Self {
        FusionNasError::DataContract(msg.into())
    }

    /// Whether the error was raised before any weight update could happen
    pub fn is_eager(&self) -> bool {
        matches!(
            self,
            FusionNasError::Configuration(_) | FusionNasError::DataContract(_)
        )
    }
}

impl From<serde_json::Error> for FusionNasError {
    fn from(err: serde_json::Error) -> Self {
        FusionNasError::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for FusionNasError {
    fn from(err: ndarray::ShapeError) -> Self {
        FusionNasError::Shape {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FusionNasError::config("steps must be >= 1");
        assert_eq!(err.to_string(), "Configuration error: steps must be >= 1");
    }

    #[test]
    fn test_divergence_carries_context() {
        let err = FusionNasError::NumericDivergence {
            epoch: 3,
            phase: SearchPhase::TrainArchEpoch,
            batch: 7,
            detail: "loss is NaN".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("epoch 3"));
        assert!(msg.contains("batch 7"));
        assert!(msg.contains("TrainArchEpoch"));
        assert!(!err.is_eager());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FusionNasError = io_err.into();
        assert!(matches!(err, FusionNasError::Io(_)));
    }
}
