// src/backend/mod.rs

pub mod cpu;
pub mod fused;
pub mod number;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use cpu::ReferenceNorm;
pub use fused::FusedNorm;
pub use number::{NormoxCudaF, NormoxF};

#[cfg(feature = "cuda")]
pub use cuda::CudaNorm;

/// ε added *after* a square root: `x / (sqrt(v) + ε)`. Used by the
/// normalize transform and by the matching first term of the input
/// gradient.
pub const EPSILON: f64 = 1e-5;

/// ε added *before* a square root or power: `(v + ε)^p`. Used by the
/// mean/variance gradients and by the fused reciprocal-stddev paths.
/// Equal to [`EPSILON`] by design; the two placements produce different
/// gradient magnitudes and are kept as distinct conventions.
pub const VARIANCE_EPSILON: f64 = 1e-5;

/// Rolling-statistics decay on the reference path: 10% weight to each
/// new batch.
pub const ROLLING_DECAY: f64 = 0.9;

/// Rolling-statistics decay on the accelerated paths: 1% weight to each
/// new batch. Held constant per build; mixing decays across train/resume
/// cycles corrupts the running estimate.
pub const FAST_ROLLING_DECAY: f64 = 0.99;

/// Blend factor for the cumulative (combined) statistics variant.
pub const CUMULATIVE_ALPHA: f64 = 0.01;

/// Geometry of one layer invocation. `spatial` is height*width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub batch: usize,
    pub channels: usize,
    pub spatial: usize,
}

impl Dims {
    pub fn elements(&self) -> usize {
        self.batch * self.channels * self.spatial
    }
}

/// Position of the current mini-batch slice inside one optimizer step,
/// for the cumulative statistics variant. Rolling statistics refresh only
/// on the last slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subdivision {
    pub index: usize,
    pub total: usize,
}

impl Subdivision {
    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.total
    }
}

/// Training-mode forward pass view. `output` arrives holding the raw
/// input activations and leaves holding the normalized, affine-transformed
/// result — it is consumed and produced in place. On return `mean` and
/// `variance` hold the statistics the normalization actually used (batch
/// or cumulative), which is what the matching backward pass consumes.
#[derive(Debug)]
pub struct TrainPass<'a, T> {
    pub dims: Dims,
    /// Resolved rolling decay for this call.
    pub decay: T,
    /// `Some` switches the statistics engine to the cumulative variant.
    pub cumulative: Option<Subdivision>,
    pub output: &'a mut [T],
    pub saved_input: &'a mut [T],
    /// Strategies that recompute the normalized tensor in backward may
    /// leave this untouched.
    pub saved_normalized: &'a mut [T],
    pub mean: &'a mut [T],
    pub variance: &'a mut [T],
    pub mean_avg: &'a mut [T],
    pub variance_avg: &'a mut [T],
    pub rolling_mean: &'a mut [T],
    pub rolling_variance: &'a mut [T],
    pub scales: &'a [T],
    pub biases: &'a [T],
}

/// Inference-mode forward pass view. Normalizes `output` in place with
/// the rolling statistics; nothing else is written.
#[derive(Debug)]
pub struct InferPass<'a, T> {
    pub dims: Dims,
    pub output: &'a mut [T],
    pub rolling_mean: &'a [T],
    pub rolling_variance: &'a [T],
    pub scales: &'a [T],
    pub biases: &'a [T],
}

/// Backward pass view. `delta` arrives holding the gradient w.r.t. the
/// layer output and leaves holding the gradient w.r.t. the layer input —
/// consumed and produced in place. `mean`/`variance` must be the
/// statistics the paired forward normalized with.
#[derive(Debug)]
pub struct BackwardPass<'a, T> {
    pub dims: Dims,
    pub delta: &'a mut [T],
    pub saved_input: &'a [T],
    pub saved_normalized: &'a [T],
    pub mean: &'a [T],
    pub variance: &'a [T],
    pub mean_grad: &'a mut [T],
    pub variance_grad: &'a mut [T],
    pub scale_grad: &'a mut [T],
    pub bias_grad: &'a mut [T],
    pub scales: &'a [T],
}

/// Strategy interface every compute path implements. Selected once at
/// layer construction; swapping strategies never changes a caller. All
/// calls are blocking: device-side implementations must synchronize
/// before returning.
pub trait NormBackend<T: NormoxF>: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Rolling decay this strategy uses when the layer does not override it.
    fn default_decay(&self) -> T;

    fn forward_train(&mut self, pass: TrainPass<'_, T>) -> Result<(), String>;

    fn forward_infer(&mut self, pass: InferPass<'_, T>) -> Result<(), String>;

    fn backward(&mut self, pass: BackwardPass<'_, T>) -> Result<(), String>;

    /// Drop size-dependent cached state (device scratch, descriptors).
    /// Called on every spatial resize. Host strategies may hold nothing.
    fn invalidate(&mut self) {}
}

/// Compute-path selector, fixed per layer at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Two-pass statistics, separate transform sweeps, 0.9 rolling decay.
    #[default]
    Reference,
    /// Host fused path: one-sweep moments, reciprocal-stddev transform,
    /// 0.99 rolling decay.
    Fused,
    /// Device fused path on the given CUDA ordinal.
    #[cfg(feature = "cuda")]
    Cuda(usize),
}

impl Backend {
    pub fn is_reference(&self) -> bool {
        matches!(self, Backend::Reference)
    }

    pub fn is_accelerated(&self) -> bool {
        !self.is_reference()
    }

    /// Device ordinal for device-backed selectors.
    pub fn device_id(&self) -> Option<usize> {
        match self {
            Backend::Reference | Backend::Fused => None,
            #[cfg(feature = "cuda")]
            Backend::Cuda(id) => Some(*id),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Reference => write!(f, "reference"),
            Backend::Fused => write!(f, "fused"),
            #[cfg(feature = "cuda")]
            Backend::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

// Helper constructors, handy at call sites that do not want to name the enum
pub fn reference() -> Backend {
    Backend::Reference
}

pub fn fused() -> Backend {
    Backend::Fused
}

#[cfg(feature = "cuda")]
pub fn cuda(device_id: usize) -> Backend {
    Backend::Cuda(device_id)
}

/// Default selector: first CUDA device when compiled in, reference
/// otherwise.
pub fn default_backend() -> Backend {
    #[cfg(feature = "cuda")]
    {
        Backend::Cuda(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        Backend::Reference
    }
}

/// Instantiates the strategy for a selector. The CUDA arm acquires the
/// device context and compiles its kernels, which can fail.
pub fn create_backend<T: NormoxCudaF>(backend: Backend) -> Result<Box<dyn NormBackend<T>>, String> {
    log::debug!("instantiating {} compute strategy", backend);
    match backend {
        Backend::Reference => Ok(Box::new(ReferenceNorm)),
        Backend::Fused => Ok(Box::new(FusedNorm::default())),
        #[cfg(feature = "cuda")]
        Backend::Cuda(device_id) => Ok(Box::new(CudaNorm::new(device_id)?)),
    }
}
