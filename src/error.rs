//! Error types for Kolosal explainers

use thiserror::Error;

/// Result type alias for explainer operations
pub type Result<T> = std::result::Result<T, ExplainError>;

/// Main error type for the explainability crate
#[derive(Error, Debug)]
pub enum ExplainError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Explainer not fitted: call fit() first")]
    NotFitted,

    #[error("Prediction error: {0}")]
    PredictionError(String),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    #[error("Failed to load export group '{group}': {reason}")]
    Registration { group: String, reason: String },
}

impl ExplainError {
    /// Shorthand for an [`ExplainError::InvalidParameter`]
    pub fn invalid_parameter(
        name: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        ExplainError::InvalidParameter {
            name: name.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`ExplainError::ShapeError`]
    pub fn shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        ExplainError::ShapeError {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<polars::error::PolarsError> for ExplainError {
    fn from(err: polars::error::PolarsError) -> Self {
        ExplainError::DataError(err.to_string())
    }
}

impl From<serde_json::Error> for ExplainError {
    fn from(err: serde_json::Error) -> Self {
        ExplainError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for ExplainError {
    fn from(err: ndarray::ShapeError) -> Self {
        ExplainError::ShapeError {
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
        let err = ExplainError::DataError("test error".to_string());
        assert_eq!(err.to_string(), "Data error: test error");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ExplainError = io_err.into();
        assert!(matches!(err, ExplainError::IoError(_)));
    }

    #[test]
    fn test_registration_display() {
        let err = ExplainError::Registration {
            group: "shap".to_string(),
            reason: "internal failure".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to load export group 'shap': internal failure"
        );
    }

    #[test]
    fn test_invalid_parameter_helper() {
        let err = ExplainError::invalid_parameter("threshold", 1.5, "must be in [0, 1]");
        assert_eq!(
            err.to_string(),
            "Invalid parameter: threshold = 1.5, must be in [0, 1]"
        );
    }
}
