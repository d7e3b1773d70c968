//! CUDA adapter. Stages device memory through the host for network I/O and
//! reduces on the host side.

use std::sync::Arc;

use cudarc::driver::sys::CUdeviceptr;

use crate::device::adapter::{DeviceAdapter, DeviceCapabilities, DeviceKind};
use crate::error::{FlagcxError, Result};
use crate::reduce::reduce_slice;
use crate::types::{DataType, ReduceOp};

pub struct CudaAdapter {
    ctx: Arc<cudarc::driver::CudaContext>,
    ordinal: usize,
}

impl CudaAdapter {
    /// Create an adapter bound to the given GPU ordinal.
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = cudarc::driver::CudaContext::new(ordinal).map_err(|e| {
            FlagcxError::device_with_source(
                format!("failed to create CUDA context for GPU {ordinal}"),
                e,
            )
        })?;
        Ok(Self { ctx, ordinal })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| FlagcxError::device_with_source("CUDA bind_to_thread failed", e))
    }
}

impl DeviceAdapter for CudaAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cuda
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            default_stream_dispatch: true,
            peer_memory_access: false,
            host_staging: true,
        }
    }

    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> Result<Vec<u8>> {
        self.bind()?;
        let mut buf = vec![0u8; size_bytes];
        if size_bytes > 0 {
            unsafe { cudarc::driver::result::memcpy_dtoh_sync(&mut buf, ptr as CUdeviceptr) }
                .map_err(|e| FlagcxError::device_with_source("cuMemcpyDtoH failed", e))?;
        }
        Ok(buf)
    }

    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.bind()?;
        unsafe { cudarc::driver::result::memcpy_htod_sync(dst_ptr as CUdeviceptr, data) }
            .map_err(|e| FlagcxError::device_with_source("cuMemcpyHtoD failed", e))
    }

    unsafe fn reduce_inplace(
        &self,
        dst_ptr: u64,
        src: &[u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let total_bytes = count * dtype.size_in_bytes();
        let mut dst_host = unsafe { self.stage_for_send(dst_ptr, total_bytes)? };
        reduce_slice(&mut dst_host, src, count, dtype, op)?;
        unsafe { self.receive_to_device(&dst_host, dst_ptr) }
    }

    fn synchronize(&self, _stream: u64) -> Result<()> {
        self.bind()?;
        self.ctx
            .synchronize()
            .map_err(|e| FlagcxError::device_with_source("CUDA synchronize failed", e))
    }
}
