//! # Normox
//!
//! Normox is a batch-normalization compute layer for NCHW activation
//! tensors, written in Rust, with swappable per-layer compute strategies:
//! a two-pass reference path, a fused single-sweep host path, and an
//! optional CUDA path behind the `cuda` feature.
//!
//! ## Features
//!
//! - Per-channel batch statistics (biased variance) with rolling estimates
//!   for inference
//! - Learnable scale/bias parameters with accumulating gradients and
//!   momentum-SGD updates
//! - Cumulative (combined) statistics for gradient-accumulation training
//! - Adversarial passes that normalize against frozen statistics
//! - Standalone and embedded layer forms sharing one compute core
//! - Host tensors via `ndarray`; device buffers via `cudarc` when enabled
//!
pub mod backend;

pub mod nn; // Layer surface over the compute strategies

// Re-export commonly used types for convenience
pub use backend::{
    Backend, Dims, FusedNorm, NormBackend, NormoxCudaF, NormoxF, ReferenceNorm, Subdivision,
    CUMULATIVE_ALPHA, EPSILON, FAST_ROLLING_DECAY, ROLLING_DECAY, VARIANCE_EPSILON,
    create_backend, default_backend,
};

#[cfg(feature = "cuda")]
pub use backend::CudaNorm;

pub use nn::{BatchNorm, ExecutionContext, LayerError, LayerKind};
