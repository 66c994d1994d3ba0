//! Error types shared by every scheduler

use thiserror::Error;

/// Errors raised while building or stepping a scheduler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Configuration rejected at construction time
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A linear combination needs one weight per tensor and at least two terms
    #[error("Weighted sum needs matching tensors and weights (at least two), got {tensors} tensors and {weights} weights")]
    WeightCount { tensors: usize, weights: usize },

    /// `step` was called with a timestep other than the next one in the sequence
    #[error("Timestep {timestep} is out of sequence (expected {expected:?})")]
    OutOfSequence {
        timestep: f64,
        expected: Option<f64>,
    },

    #[error("Failed to read tensor data: {0}")]
    TensorData(String),
}

/// Result alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;
