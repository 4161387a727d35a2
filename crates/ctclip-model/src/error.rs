//! Model error types

use thiserror::Error;

/// Errors raised by the encoder, head and checkpoint code
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Tensor '{0}' missing from checkpoint")]
    MissingTensor(String),
    #[error("Tensor '{name}' has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },
    #[error("Token id {id} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { id: u32, vocab_size: usize },
    #[error("Checkpoint version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ModelError {
    /// Shape mismatch helper
    pub fn shape(name: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
