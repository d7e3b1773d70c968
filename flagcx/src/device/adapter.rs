use crate::error::Result;
use crate::types::{DataType, ReduceOp};

/// Accelerator family an adapter drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// CUDA-class accelerator.
    Cuda,
    /// MLU-class accelerator.
    Mlu,
    /// Plain host memory.
    Host,
}

impl DeviceKind {
    /// Device-class prefix used when naming a backend, e.g. `cuda:flagcx`.
    pub const fn prefix(self) -> &'static str {
        match self {
            DeviceKind::Cuda => "cuda",
            DeviceKind::Mlu => "mlu",
            DeviceKind::Host => "cpu",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// What an adapter can do, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    /// Copies are queued on the device's default stream and a completed
    /// operation must synchronize it before reporting success.
    pub default_stream_dispatch: bool,
    /// Peers on the same node may read this device's memory directly.
    pub peer_memory_access: bool,
    /// Data crosses the network through host staging buffers.
    pub host_staging: bool,
}

/// Bridges device memory with the network transport.
///
/// The engine works on raw `u64` addresses and byte counts. The adapter moves
/// data between device memory and host buffers and performs local
/// reductions, so collective algorithms never touch device memory directly.
///
/// Adapters are selected once when the [`World`](crate::World) is created and
/// shared by every group on that world. Failures surface as
/// [`FlagcxError::Device`](crate::FlagcxError::Device) and are never retried.
pub trait DeviceAdapter: Send + Sync {
    fn kind(&self) -> DeviceKind;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Copy from device memory into a host buffer for network send.
    ///
    /// # Safety
    /// `ptr` must be a valid pointer to at least `size_bytes` bytes.
    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> Result<Vec<u8>>;

    /// Copy received host data into device memory.
    ///
    /// # Safety
    /// `dst_ptr` must be a valid pointer to at least `data.len()` bytes.
    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()>;

    /// In-place reduce: `dst[i] = op(dst[i], src[i])` for each element.
    ///
    /// # Safety
    /// `dst_ptr` must be a valid pointer to at least `count * dtype.size_in_bytes()` bytes.
    unsafe fn reduce_inplace(
        &self,
        dst_ptr: u64,
        src: &[u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()>;

    /// Device-local copy between two regions that do not overlap.
    ///
    /// Default stages through the host.
    ///
    /// # Safety
    /// Both pointers must be valid for `size_bytes` bytes.
    unsafe fn copy_local(&self, dst_ptr: u64, src_ptr: u64, size_bytes: usize) -> Result<()> {
        let staged = unsafe { self.stage_for_send(src_ptr, size_bytes)? };
        unsafe { self.receive_to_device(&staged, dst_ptr) }
    }

    /// Block until all work queued on `stream` has finished.
    /// Stream `0` is the default stream.
    fn synchronize(&self, _stream: u64) -> Result<()> {
        Ok(())
    }
}
