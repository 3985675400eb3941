// src/backend/cuda/kernels.rs
use crate::backend::number::NormoxCudaF;
use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};
use cudarc::nvrtc::compile_ptx;
use std::collections::HashMap;
use std::sync::Arc;

/// Kernel source, compiled at backend startup through NVRTC.
pub const BATCHNORM_SRC: &str = include_str!("../../../kernels/batchnorm.cu");

/// Every function the module must export, f32 base names plus _f64 variants.
const BATCHNORM_FUNCTIONS: &[&str] = &[
    "bn_mean",
    "bn_variance",
    "bn_normalize_affine",
    "bn_backward_sums",
    "bn_stat_grads",
    "bn_backward_delta",
    "bn_mean_f64",
    "bn_variance_f64",
    "bn_normalize_affine_f64",
    "bn_backward_sums_f64",
    "bn_stat_grads_f64",
    "bn_backward_delta_f64",
];

// Generic kernel launch macro
macro_rules! launch_kernel {
    ($self:expr, $kernel_name:expr, $cfg:expr, $( $arg:expr ),* $(,)? ) => {{
        let stream = $self.get_stream();
        let kernel = $self
            .get_function_cloned($kernel_name)
            .ok_or_else(|| format!("{} kernel not found", $kernel_name))?;

        unsafe {
            stream
                .launch_builder(&kernel)
                $( .arg($arg) )*
                .launch($cfg)
                .map_err(|e| format!("Failed to launch {} kernel: {}", $kernel_name, e))?;
        }

        Ok(())
    }};
}

/// CUDA kernel manager
pub struct KernelManager {
    stream: Arc<CudaStream>,
    functions: HashMap<String, CudaFunction>,
}

impl KernelManager {
    pub fn new(stream: Arc<CudaStream>) -> Self {
        Self {
            stream,
            functions: HashMap::new(),
        }
    }

    /// Compiles a CUDA source through NVRTC and registers the batchnorm
    /// entry points. A missing function is a hard error: the launchers
    /// assume every name in the table resolves.
    pub fn load_source(&mut self, ctx: &Arc<CudaContext>, source: &str) -> Result<(), String> {
        let ptx = compile_ptx(source)
            .map_err(|e| format!("Failed to compile batchnorm kernels: {}", e))?;

        let module = ctx
            .load_module(ptx)
            .map_err(|e| format!("Failed to load batchnorm module: {}", e))?;

        for &func_name in BATCHNORM_FUNCTIONS {
            let func = module
                .load_function(func_name)
                .map_err(|e| format!("Failed to load kernel {}: {}", func_name, e))?;
            self.functions.insert(func_name.to_string(), func);
        }

        Ok(())
    }

    pub fn get_function_cloned(&self, name: &str) -> Option<CudaFunction> {
        self.functions.get(name).cloned()
    }

    fn get_stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    // ===== HELPER METHODS =====

    /// Resolves the kernel name for the element type at compile time:
    /// f64 appends the "_f64" suffix, everything else (f32) uses the base name.
    fn get_kernel_name<T>(&self, base_name: &str) -> String
    where
        T: 'static,
    {
        if std::any::TypeId::of::<T>() == std::any::TypeId::of::<f64>() {
            format!("{}_f64", base_name)
        } else {
            base_name.to_string()
        }
    }

    // ===== TYPED LAUNCHERS =====

    pub fn launch_mean<T>(
        &self,
        cfg: LaunchConfig,
        input: &CudaSlice<T>,
        mean: &mut CudaSlice<T>,
        batch: i32,
        channels: i32,
        spatial: i32,
    ) -> Result<(), String>
    where
        T: NormoxCudaF + 'static,
    {
        let kernel_name = self.get_kernel_name::<T>("bn_mean");
        launch_kernel!(self, &kernel_name, cfg, input, mean, &batch, &channels, &spatial)
    }

    pub fn launch_variance<T>(
        &self,
        cfg: LaunchConfig,
        input: &CudaSlice<T>,
        mean: &CudaSlice<T>,
        variance: &mut CudaSlice<T>,
        batch: i32,
        channels: i32,
        spatial: i32,
    ) -> Result<(), String>
    where
        T: NormoxCudaF + 'static,
    {
        let kernel_name = self.get_kernel_name::<T>("bn_variance");
        launch_kernel!(
            self,
            &kernel_name,
            cfg,
            input,
            mean,
            variance,
            &batch,
            &channels,
            &spatial
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch_normalize_affine<T>(
        &self,
        cfg: LaunchConfig,
        x: &mut CudaSlice<T>,
        mean: &CudaSlice<T>,
        variance: &CudaSlice<T>,
        scales: &CudaSlice<T>,
        biases: &CudaSlice<T>,
        batch: i32,
        channels: i32,
        spatial: i32,
        epsilon: T,
    ) -> Result<(), String>
    where
        T: NormoxCudaF + 'static,
    {
        let kernel_name = self.get_kernel_name::<T>("bn_normalize_affine");
        launch_kernel!(
            self,
            &kernel_name,
            cfg,
            x,
            mean,
            variance,
            scales,
            biases,
            &batch,
            &channels,
            &spatial,
            &epsilon
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch_backward_sums<T>(
        &self,
        cfg: LaunchConfig,
        delta: &CudaSlice<T>,
        input: &CudaSlice<T>,
        mean: &CudaSlice<T>,
        variance: &CudaSlice<T>,
        delta_sum: &mut CudaSlice<T>,
        delta_norm_sum: &mut CudaSlice<T>,
        batch: i32,
        channels: i32,
        spatial: i32,
        epsilon: T,
    ) -> Result<(), String>
    where
        T: NormoxCudaF + 'static,
    {
        let kernel_name = self.get_kernel_name::<T>("bn_backward_sums");
        launch_kernel!(
            self,
            &kernel_name,
            cfg,
            delta,
            input,
            mean,
            variance,
            delta_sum,
            delta_norm_sum,
            &batch,
            &channels,
            &spatial,
            &epsilon
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch_stat_grads<T>(
        &self,
        cfg: LaunchConfig,
        delta_sum: &CudaSlice<T>,
        delta_norm_sum: &CudaSlice<T>,
        variance: &CudaSlice<T>,
        scales: &CudaSlice<T>,
        mean_grad: &mut CudaSlice<T>,
        variance_grad: &mut CudaSlice<T>,
        scale_grad: &mut CudaSlice<T>,
        bias_grad: &mut CudaSlice<T>,
        channels: i32,
        epsilon: T,
    ) -> Result<(), String>
    where
        T: NormoxCudaF + 'static,
    {
        let kernel_name = self.get_kernel_name::<T>("bn_stat_grads");
        launch_kernel!(
            self,
            &kernel_name,
            cfg,
            delta_sum,
            delta_norm_sum,
            variance,
            scales,
            mean_grad,
            variance_grad,
            scale_grad,
            bias_grad,
            &channels,
            &epsilon
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch_backward_delta<T>(
        &self,
        cfg: LaunchConfig,
        delta: &mut CudaSlice<T>,
        input: &CudaSlice<T>,
        mean: &CudaSlice<T>,
        variance: &CudaSlice<T>,
        mean_grad: &CudaSlice<T>,
        variance_grad: &CudaSlice<T>,
        scales: &CudaSlice<T>,
        batch: i32,
        channels: i32,
        spatial: i32,
        epsilon: T,
    ) -> Result<(), String>
    where
        T: NormoxCudaF + 'static,
    {
        let kernel_name = self.get_kernel_name::<T>("bn_backward_delta");
        launch_kernel!(
            self,
            &kernel_name,
            cfg,
            delta,
            input,
            mean,
            variance,
            mean_grad,
            variance_grad,
            scales,
            &batch,
            &channels,
            &spatial,
            &epsilon
        )
    }
}

/// Compile and register every kernel the backend needs.
pub fn load_all_kernels(manager: &mut KernelManager, ctx: &Arc<CudaContext>) -> Result<(), String> {
    manager.load_source(ctx, BATCHNORM_SRC)
}
