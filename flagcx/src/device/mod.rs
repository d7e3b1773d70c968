mod adapter;
#[cfg(feature = "cuda")]
mod cuda;
mod host;

use std::sync::Arc;

pub use adapter::{DeviceAdapter, DeviceCapabilities, DeviceKind};
#[cfg(feature = "cuda")]
pub use cuda::CudaAdapter;
pub use host::HostAdapter;

use crate::error::{FlagcxError, Result};

/// Pick the built-in adapter for `kind`, once, at startup.
///
/// Accelerator families without a runtime compiled into this build yield a
/// `Device` error; callers with their own runtime bindings can implement
/// [`DeviceAdapter`] and pass it to [`World::init`](crate::World::init) instead.
pub fn select_adapter(kind: DeviceKind, ordinal: usize) -> Result<Arc<dyn DeviceAdapter>> {
    match kind {
        DeviceKind::Host => Ok(Arc::new(HostAdapter::new())),
        #[cfg(feature = "cuda")]
        DeviceKind::Cuda => Ok(Arc::new(CudaAdapter::new(ordinal)?)),
        #[cfg(not(feature = "cuda"))]
        DeviceKind::Cuda => Err(FlagcxError::device(format!(
            "CUDA device {ordinal} requested but this build has no CUDA runtime (enable the `cuda` feature)"
        ))),
        DeviceKind::Mlu => Err(FlagcxError::device(format!(
            "no built-in runtime for MLU device {ordinal}; supply a DeviceAdapter implementation"
        ))),
    }
}
