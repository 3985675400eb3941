// src/backend/cuda/context.rs
use crate::backend::number::NormoxCudaF;
#[allow(unused_imports)]
use cudarc::driver::DeviceSlice;
use cudarc::driver::{CudaContext, CudaSlice, CudaStream};
use std::sync::Arc;

/// Owns the driver context and the stream every launch and transfer goes
/// through. Transfers are blocking: each copy synchronizes the stream before
/// returning, so callers can read host buffers immediately.
pub struct CudaContextManager {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CudaContextManager {
    pub fn new(device: usize) -> Result<Self, String> {
        let ctx = CudaContext::new(device).map_err(|e| format!("CUDA init error: {}", e))?;
        let stream = ctx.default_stream();
        Ok(Self { ctx, stream })
    }

    // ============= GPU MEMORY MANAGEMENT =============

    /// Allocates zeroed memory on the GPU
    pub fn alloc_zeros<T: NormoxCudaF>(&self, len: usize) -> Result<CudaSlice<T>, String> {
        self.stream
            .alloc_zeros(len)
            .map_err(|e| format!("Failed to allocate GPU memory: {}", e))
    }

    /// Synchronous host to device transfer
    pub fn host_to_device<T: NormoxCudaF>(&self, data: &[T]) -> Result<CudaSlice<T>, String> {
        let mut device_buffer = self.alloc_zeros(data.len())?;
        self.stream
            .memcpy_htod(data, &mut device_buffer)
            .map_err(|e| format!("Host to device transfer failed: {}", e))?;
        Ok(device_buffer)
    }

    /// Synchronous device to host transfer into an existing host buffer
    pub fn device_to_host<T: NormoxCudaF>(
        &self,
        src: &CudaSlice<T>,
        dst: &mut [T],
    ) -> Result<(), String> {
        if src.len() != dst.len() {
            return Err(format!(
                "Device to host transfer length mismatch: device {} vs host {}",
                src.len(),
                dst.len()
            ));
        }
        self.stream
            .memcpy_dtoh(src, dst)
            .map_err(|e| format!("Device to host transfer failed: {}", e))?;
        // The copy is issued on the stream; wait for it before the caller
        // touches the host buffer.
        self.stream
            .synchronize()
            .map_err(|e| format!("CUDA synchronization failed: {}", e))
    }

    // ============= BACKEND INTERFACE METHODS =============

    /// Device ordinal
    pub fn id(&self) -> usize {
        self.ctx.ordinal()
    }

    /// Synchronize all operations
    pub fn synchronize(&self) -> Result<(), String> {
        self.ctx
            .synchronize()
            .map_err(|e| format!("CUDA synchronization failed: {}", e))
    }

    /// Access to underlying CUDA context
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    /// Stream used for kernel launches
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}
