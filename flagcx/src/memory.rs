//! Non-owning buffer references handed to the engine.
//!
//! A [`Buffer`] is a raw address plus an element count and type. The engine
//! never allocates or frees through it; the caller keeps the memory alive and
//! untouched until every operation referencing it has been waited on. Whether
//! the address is host or device memory is up to the group's device adapter.

use half::{bf16, f16};

use crate::types::DataType;

mod private {
    pub trait Sealed {}
}

/// Rust element types with a matching [`DataType`].
pub trait Element: private::Sealed + Copy + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dt;
            }
        )*
    };
}

impl_element!(
    f32 => F32,
    f64 => F64,
    f16 => F16,
    bf16 => BF16,
    i8 => I8,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
    u64 => U64,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Buffer {
    ptr: u64,
    count: usize,
    dtype: DataType,
}

impl Buffer {
    /// Reference a raw region of `count` elements.
    ///
    /// # Safety
    /// `ptr` must address at least `count * dtype.size_in_bytes()` bytes of
    /// memory the group's adapter can read and write.
    pub unsafe fn from_raw(ptr: u64, count: usize, dtype: DataType) -> Self {
        Self { ptr, count, dtype }
    }

    /// Reference a host slice.
    ///
    /// Recording the address is safe; handing the buffer to an operation is
    /// not, which is why every operation taking a `Buffer` is `unsafe`.
    pub fn from_slice<T: Element>(data: &mut [T]) -> Self {
        Self {
            ptr: data.as_mut_ptr() as u64,
            count: data.len(),
            dtype: T::DTYPE,
        }
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn len_bytes(&self) -> usize {
        self.count * self.dtype.size_in_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl std::fmt::Display for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer(0x{:x}, {}x{})", self.ptr, self.count, self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_records_type_and_len() {
        let mut data = vec![1.0f32; 6];
        let buf = Buffer::from_slice(&mut data);
        assert_eq!(buf.ptr(), data.as_ptr() as u64);
        assert_eq!(buf.count(), 6);
        assert_eq!(buf.dtype(), DataType::F32);
        assert_eq!(buf.len_bytes(), 24);
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_half_elements() {
        let mut data = vec![bf16::ZERO; 3];
        let buf = Buffer::from_slice(&mut data);
        assert_eq!(buf.dtype(), DataType::BF16);
        assert_eq!(buf.len_bytes(), 6);
    }

    #[test]
    fn test_display() {
        let buf = unsafe { Buffer::from_raw(0xff, 4, DataType::I32) };
        assert_eq!(buf.to_string(), "Buffer(0xff, 4xi32)");
    }
}
