// src/backend/cuda/mod.rs
pub mod context;
pub mod kernels;
pub mod ops;

pub use context::CudaContextManager;
pub use kernels::{load_all_kernels, KernelManager};
pub use ops::CudaNorm;
