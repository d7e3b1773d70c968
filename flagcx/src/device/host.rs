use crate::device::adapter::{DeviceAdapter, DeviceCapabilities, DeviceKind};
use crate::error::{FlagcxError, Result};
use crate::reduce::reduce_slice;
use crate::types::{DataType, ReduceOp};

/// Adapter for host memory. Direct pointer access, no device runtime.
#[derive(Debug, Clone, Default)]
pub struct HostAdapter;

impl HostAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceAdapter for HostAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            default_stream_dispatch: false,
            peer_memory_access: false,
            host_staging: true,
        }
    }

    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> Result<Vec<u8>> {
        if size_bytes == 0 {
            return Ok(Vec::new());
        }
        let slice = unsafe { std::slice::from_raw_parts(ptr as *const u8, size_bytes) };
        Ok(slice.to_vec())
    }

    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst_ptr as *mut u8, data.len());
        }
        Ok(())
    }

    unsafe fn reduce_inplace(
        &self,
        dst_ptr: u64,
        src: &[u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let expected = count * dtype.size_in_bytes();
        if src.len() != expected {
            return Err(FlagcxError::BufferSizeMismatch {
                expected,
                actual: src.len(),
            });
        }
        if expected == 0 {
            return Ok(());
        }
        let dst = unsafe { std::slice::from_raw_parts_mut(dst_ptr as *mut u8, expected) };
        reduce_slice(dst, src, count, dtype, op)
    }

    unsafe fn copy_local(&self, dst_ptr: u64, src_ptr: u64, size_bytes: usize) -> Result<()> {
        if size_bytes == 0 || dst_ptr == src_ptr {
            return Ok(());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src_ptr as *const u8, dst_ptr as *mut u8, size_bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_for_send_roundtrip() {
        let adapter = HostAdapter::new();
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let size = data.len() * std::mem::size_of::<f32>();

        let staged = unsafe { adapter.stage_for_send(data.as_ptr() as u64, size).unwrap() };
        assert_eq!(staged.len(), size);
        assert_eq!(&staged[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_receive_to_device() {
        let adapter = HostAdapter::new();
        let src = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut dst = [0u8; 4];
        unsafe {
            adapter
                .receive_to_device(&src, dst.as_mut_ptr() as u64)
                .unwrap();
        }
        assert_eq!(dst, src);
    }

    #[test]
    fn test_reduce_inplace_prod_f32() {
        let adapter = HostAdapter::new();
        let mut dst: Vec<f32> = vec![2.0, 3.0, 4.0];
        let src: Vec<u8> = [5.0f32, 6.0, 7.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        unsafe {
            adapter
                .reduce_inplace(dst.as_mut_ptr() as u64, &src, 3, DataType::F32, ReduceOp::Prod)
                .unwrap();
        }
        assert_eq!(dst, vec![10.0, 18.0, 28.0]);
    }

    #[test]
    fn test_reduce_inplace_size_mismatch() {
        let adapter = HostAdapter::new();
        let mut dst: Vec<f32> = vec![1.0, 2.0];
        let short_src = [0u8; 4];
        let result = unsafe {
            adapter.reduce_inplace(dst.as_mut_ptr() as u64, &short_src, 2, DataType::F32, ReduceOp::Sum)
        };
        assert!(matches!(result, Err(FlagcxError::BufferSizeMismatch { .. })));
    }

    #[test]
    fn test_copy_local() {
        let adapter = HostAdapter::new();
        let src = [1u8, 2, 3];
        let mut dst = [0u8; 3];
        unsafe {
            adapter
                .copy_local(dst.as_mut_ptr() as u64, src.as_ptr() as u64, 3)
                .unwrap();
        }
        assert_eq!(dst, src);
    }

    #[test]
    fn test_capabilities() {
        let caps = HostAdapter::new().capabilities();
        assert!(caps.host_staging);
        assert!(!caps.default_stream_dispatch);
        assert_eq!(HostAdapter::new().kind(), DeviceKind::Host);
    }
}
