// src/nn/mod.rs
pub mod batchnorm;
pub mod context;

pub use batchnorm::{BatchNorm, LayerKind};
pub use context::ExecutionContext;

/// Error types for layer operations
#[derive(Debug)]
pub enum LayerError {
    /// Requested buffer shape does not fit in memory arithmetic.
    Allocation { what: &'static str, shape: [usize; 4] },
    /// An input or state blob has the wrong element count.
    ShapeMismatch { expected: usize, got: usize },
    /// Non-finite values detected in a layer array.
    NumericalInstability { array: &'static str, count: usize },
    /// Compute strategy failure, carries the backend's own message.
    Backend(String),
}

impl std::fmt::Display for LayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LayerError::Allocation { what, shape } => {
                write!(
                    f,
                    "Cannot size {} for shape {}x{}x{}x{}: element count overflows",
                    what, shape[0], shape[1], shape[2], shape[3]
                )
            }
            LayerError::ShapeMismatch { expected, got } => {
                write!(f, "Shape mismatch: expected {} elements, got {}", expected, got)
            }
            LayerError::NumericalInstability { array, count } => {
                write!(f, "{} holds {} non-finite values", array, count)
            }
            LayerError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for LayerError {}
