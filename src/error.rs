//! Unified error type for model loading and inference.

use std::io;

/// Errors surfaced by the engine. Everything that can go wrong happens at
/// load time; once a model is resident, inference operations do not fail.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid container: {0}")]
    InvalidContainer(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("missing tensor: {0}")]
    MissingTensor(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid tensor {name}: {reason}")]
    InvalidTensor { name: String, reason: String },

    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    #[error("allocation failure: {0}")]
    Allocation(String),
}
