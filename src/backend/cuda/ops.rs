// src/backend/cuda/ops.rs
//
// Device strategy. The layer keeps its state on the host; every pass uploads
// what the kernels need, runs the same fused math as the host fused path, and
// downloads the results back into the caller's buffers. Transfers block, so
// the strategy looks synchronous from the outside. Rolling and cumulative
// blends stay on the host: the statistics have already been downloaded and
// the rolling state never leaves the layer.

use super::context::CudaContextManager;
use super::kernels::{load_all_kernels, KernelManager};
use crate::backend::cpu::{cumulative_update, rolling_update};
use crate::backend::number::{NormoxCudaF, NormoxF};
use crate::backend::{
    BackwardPass, Dims, InferPass, NormBackend, TrainPass, CUMULATIVE_ALPHA, FAST_ROLLING_DECAY,
};
use cudarc::driver::LaunchConfig;
use std::fmt;

pub struct CudaNorm {
    ctx: CudaContextManager,
    kernels: KernelManager,
}

impl fmt::Debug for CudaNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaNorm").field("device", &self.ctx.id()).finish()
    }
}

impl CudaNorm {
    pub fn new(device: usize) -> Result<Self, String> {
        let ctx = CudaContextManager::new(device)?;
        let mut kernels = KernelManager::new(ctx.stream().clone());
        load_all_kernels(&mut kernels, ctx.context())?;
        log::info!("batchnorm CUDA backend ready on device {}", device);
        Ok(Self { ctx, kernels })
    }

    pub fn device(&self) -> usize {
        self.ctx.id()
    }

    fn elementwise_config(&self, size: usize) -> LaunchConfig {
        let block_size = 256;
        let grid_size = (size + block_size - 1) / block_size;
        LaunchConfig {
            grid_dim: (grid_size as u32, 1, 1),
            block_dim: (block_size as u32, 1, 1),
            shared_mem_bytes: 0,
        }
    }

    /// One block per channel; the block dimension must equal BLOCK in the
    /// kernel source, the shared-memory tree reductions are sized to it.
    fn channel_config(&self, channels: usize) -> LaunchConfig {
        LaunchConfig {
            grid_dim: (channels as u32, 1, 1),
            block_dim: (256, 1, 1),
            shared_mem_bytes: 0,
        }
    }
}

impl<T: NormoxCudaF> NormBackend<T> for CudaNorm {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn default_decay(&self) -> T {
        T::from_f64(FAST_ROLLING_DECAY).expect("decay constant must fit the element type")
    }

    fn forward_train(&mut self, pass: TrainPass<'_, T>) -> Result<(), String> {
        let TrainPass {
            dims,
            decay,
            cumulative,
            output,
            saved_input,
            saved_normalized: _,
            mean,
            variance,
            mean_avg,
            variance_avg,
            rolling_mean,
            rolling_variance,
            scales,
            biases,
        } = pass;
        let Dims { batch, channels, spatial } = dims;
        let eps = T::variance_epsilon();
        let (b_i, c_i, s_i) = (batch as i32, channels as i32, spatial as i32);

        saved_input.copy_from_slice(output);

        let mut d_x = self.ctx.host_to_device(output)?;
        let mut d_mean = self.ctx.alloc_zeros::<T>(channels)?;
        let mut d_variance = self.ctx.alloc_zeros::<T>(channels)?;

        let cfg = self.channel_config(channels);
        self.kernels.launch_mean(cfg, &d_x, &mut d_mean, b_i, c_i, s_i)?;
        self.kernels.launch_variance(cfg, &d_x, &d_mean, &mut d_variance, b_i, c_i, s_i)?;
        self.ctx.device_to_host(&d_mean, mean)?;
        self.ctx.device_to_host(&d_variance, variance)?;

        match cumulative {
            None => rolling_update(decay, mean, variance, rolling_mean, rolling_variance),
            Some(sub) => {
                let alpha = T::from_f64(CUMULATIVE_ALPHA)
                    .expect("blend constant must fit the element type");
                cumulative_update(alpha, mean, variance, mean_avg, variance_avg);
                if sub.is_last() {
                    rolling_update(decay, mean, variance, rolling_mean, rolling_variance);
                }
            }
        }

        // The cumulative branch may have rewritten the statistics, so the
        // normalize launch reads them back from the host.
        let d_mean = self.ctx.host_to_device(mean)?;
        let d_variance = self.ctx.host_to_device(variance)?;
        let d_scales = self.ctx.host_to_device(scales)?;
        let d_biases = self.ctx.host_to_device(biases)?;

        self.kernels.launch_normalize_affine(
            self.elementwise_config(dims.elements()),
            &mut d_x,
            &d_mean,
            &d_variance,
            &d_scales,
            &d_biases,
            b_i,
            c_i,
            s_i,
            eps,
        )?;
        self.ctx.device_to_host(&d_x, output)?;
        self.ctx.synchronize()
    }

    fn forward_infer(&mut self, pass: InferPass<'_, T>) -> Result<(), String> {
        let InferPass { dims, output, rolling_mean, rolling_variance, scales, biases } = pass;
        let Dims { batch, channels, spatial } = dims;
        let eps = T::variance_epsilon();

        let mut d_x = self.ctx.host_to_device(output)?;
        let d_mean = self.ctx.host_to_device(rolling_mean)?;
        let d_variance = self.ctx.host_to_device(rolling_variance)?;
        let d_scales = self.ctx.host_to_device(scales)?;
        let d_biases = self.ctx.host_to_device(biases)?;

        self.kernels.launch_normalize_affine(
            self.elementwise_config(dims.elements()),
            &mut d_x,
            &d_mean,
            &d_variance,
            &d_scales,
            &d_biases,
            batch as i32,
            channels as i32,
            spatial as i32,
            eps,
        )?;
        self.ctx.device_to_host(&d_x, output)?;
        self.ctx.synchronize()
    }

    fn backward(&mut self, pass: BackwardPass<'_, T>) -> Result<(), String> {
        let BackwardPass {
            dims,
            delta,
            saved_input,
            saved_normalized: _,
            mean,
            variance,
            mean_grad,
            variance_grad,
            scale_grad,
            bias_grad,
            scales,
        } = pass;
        let Dims { batch, channels, spatial } = dims;
        let eps = T::variance_epsilon();
        let (b_i, c_i, s_i) = (batch as i32, channels as i32, spatial as i32);

        let mut d_delta = self.ctx.host_to_device(delta)?;
        let d_input = self.ctx.host_to_device(saved_input)?;
        let d_mean = self.ctx.host_to_device(mean)?;
        let d_variance = self.ctx.host_to_device(variance)?;
        let d_scales = self.ctx.host_to_device(scales)?;
        // Parameter gradients accumulate on the device, so their current
        // values ride along.
        let mut d_scale_grad = self.ctx.host_to_device(scale_grad)?;
        let mut d_bias_grad = self.ctx.host_to_device(bias_grad)?;
        let mut d_mean_grad = self.ctx.alloc_zeros::<T>(channels)?;
        let mut d_variance_grad = self.ctx.alloc_zeros::<T>(channels)?;
        let mut d_delta_sum = self.ctx.alloc_zeros::<T>(channels)?;
        let mut d_delta_norm_sum = self.ctx.alloc_zeros::<T>(channels)?;

        self.kernels.launch_backward_sums(
            self.channel_config(channels),
            &d_delta,
            &d_input,
            &d_mean,
            &d_variance,
            &mut d_delta_sum,
            &mut d_delta_norm_sum,
            b_i,
            c_i,
            s_i,
            eps,
        )?;
        self.kernels.launch_stat_grads(
            self.elementwise_config(channels),
            &d_delta_sum,
            &d_delta_norm_sum,
            &d_variance,
            &d_scales,
            &mut d_mean_grad,
            &mut d_variance_grad,
            &mut d_scale_grad,
            &mut d_bias_grad,
            c_i,
            eps,
        )?;
        self.kernels.launch_backward_delta(
            self.elementwise_config(dims.elements()),
            &mut d_delta,
            &d_input,
            &d_mean,
            &d_variance,
            &d_mean_grad,
            &d_variance_grad,
            &d_scales,
            b_i,
            c_i,
            s_i,
            eps,
        )?;

        self.ctx.device_to_host(&d_delta, delta)?;
        self.ctx.device_to_host(&d_mean_grad, mean_grad)?;
        self.ctx.device_to_host(&d_variance_grad, variance_grad)?;
        self.ctx.device_to_host(&d_scale_grad, scale_grad)?;
        self.ctx.device_to_host(&d_bias_grad, bias_grad)?;
        self.ctx.synchronize()
    }
}
