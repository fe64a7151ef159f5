//! Error types for the FLUX transformer

use burn_flux_convert::LoadError;
use thiserror::Error;

/// Coarse error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad weights or a bad sampling configuration
    Configuration,
    /// A tensor with the wrong dimensions
    Shape,
    /// NaN or Inf in an intermediate
    Numeric,
}

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Weight loading failed: {0}")]
    Weights(#[from] LoadError),

    #[error("Timestep index {index} out of range for a schedule of {len} values")]
    TimestepOutOfRange { index: usize, len: usize },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Non-finite values in {name} after {stage}: {nan} NaN, {inf} Inf")]
    NonFinite {
        stage: String,
        name: String,
        nan: usize,
        inf: usize,
    },
}

impl FluxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FluxError::Configuration(_)
            | FluxError::Weights(_)
            | FluxError::TimestepOutOfRange { .. } => ErrorKind::Configuration,
            FluxError::Shape { .. } => ErrorKind::Shape,
            FluxError::NonFinite { .. } => ErrorKind::Numeric,
        }
    }

    pub(crate) fn shape(name: &str, expected: &[usize], actual: &[usize]) -> Self {
        FluxError::Shape {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            FluxError::TimestepOutOfRange { index: 3, len: 3 }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            FluxError::Weights(LoadError::TensorNotFound("proj_out.weight".into())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(FluxError::shape("x", &[1, 2], &[1, 3]).kind(), ErrorKind::Shape);
        assert_eq!(
            FluxError::NonFinite {
                stage: "single block 3".into(),
                name: "hidden_states".into(),
                nan: 1,
                inf: 0,
            }
            .kind(),
            ErrorKind::Numeric
        );
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = FluxError::shape("prompt_embeds", &[1, 256, 4096], &[1, 77, 4096]);
        assert_eq!(
            err.to_string(),
            "Shape mismatch for prompt_embeds: expected [1, 256, 4096], got [1, 77, 4096]"
        );

        let err = FluxError::TimestepOutOfRange { index: 5, len: 3 };
        assert!(err.to_string().contains("index 5"));
    }
}
