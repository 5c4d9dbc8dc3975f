//! # Error Types for ORACLE
//!
//! Unified error handling across all ORACLE crates.
//!
//! Short histories and untrained models are not errors: they degrade to
//! zero-filled features or low-confidence results. Only contract violations
//! and I/O end up here.

use thiserror::Error;

/// Main error type for ORACLE operations
#[derive(Error, Debug)]
pub enum OracleError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A vector did not have the width a layer or model expects
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Network architecture could not be built
    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),

    /// A value outside what a model accepts
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Training run rejected its input
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persisted state from another engine version
    #[error("Format version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ORACLE operations
pub type OracleResult<T> = Result<T, OracleError>;

impl OracleError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an architecture error
    pub fn architecture(msg: impl Into<String>) -> Self {
        Self::InvalidArchitecture(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check a vector width against what the caller expects
    pub fn check_width(context: &'static str, expected: usize, actual: usize) -> OracleResult<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::ShapeMismatch {
                context,
                expected,
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_width() {
        assert!(OracleError::check_width("layer", 3, 3).is_ok());

        let err = OracleError::check_width("layer", 3, 4).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Shape mismatch in layer: expected 3, got 4"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: OracleError = io.into();
        assert!(matches!(err, OracleError::Io(_)));
    }
}
