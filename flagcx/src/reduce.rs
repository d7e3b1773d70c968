//! Element-wise reduction primitives shared by the collective algorithms and
//! the host device adapter.
//!
//! Everything here works on little-endian byte slices so staged network
//! buffers never need to be aligned for their element type.

use half::{bf16, f16};

use crate::error::{FlagcxError, Result};
use crate::types::{DataType, ReduceOp};

/// Read/write a value from a little-endian byte slice (alignment-safe).
trait LeBytes: Sized + Copy + 'static {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64, f16, bf16);

/// Types that support the pairwise reduction operations.
trait Reducible: LeBytes {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
    fn identity(op: ReduceOp) -> Self;
    fn div_count(self, n: usize) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op.combining() {
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                        _ => a.wrapping_add(b),
                    }
                }
                #[inline]
                fn identity(op: ReduceOp) -> Self {
                    match op.combining() {
                        ReduceOp::Prod => 1,
                        ReduceOp::Min => <$ty>::MAX,
                        ReduceOp::Max => <$ty>::MIN,
                        _ => 0,
                    }
                }
                #[inline]
                fn div_count(self, n: usize) -> Self {
                    (self as i128 / n as i128) as $ty
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op.combining() {
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                        _ => a + b,
                    }
                }
                #[inline]
                fn identity(op: ReduceOp) -> Self {
                    match op.combining() {
                        ReduceOp::Prod => 1.0,
                        ReduceOp::Min => <$ty>::MAX,
                        ReduceOp::Max => <$ty>::MIN,
                        _ => 0.0,
                    }
                }
                #[inline]
                fn div_count(self, n: usize) -> Self {
                    self / n as $ty
                }
            }
        )*
    };
    // Half-precision types accumulate through f32 to avoid double rounding.
    (half: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    let (x, y) = (a.to_f32(), b.to_f32());
                    <$ty>::from_f32(match op.combining() {
                        ReduceOp::Prod => x * y,
                        ReduceOp::Min => x.min(y),
                        ReduceOp::Max => x.max(y),
                        _ => x + y,
                    })
                }
                #[inline]
                fn identity(op: ReduceOp) -> Self {
                    match op.combining() {
                        ReduceOp::Prod => <$ty>::ONE,
                        ReduceOp::Min => <$ty>::MAX,
                        ReduceOp::Max => <$ty>::MIN,
                        _ => <$ty>::ZERO,
                    }
                }
                #[inline]
                fn div_count(self, n: usize) -> Self {
                    <$ty>::from_f32(self.to_f32() / n as f32)
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);
impl_reducible!(half: f16, bf16);

macro_rules! dispatch {
    ($dtype:expr, $func:ident :: <_> ( $($arg:expr),* )) => {
        match $dtype {
            DataType::F32 => $func::<f32>($($arg),*),
            DataType::F64 => $func::<f64>($($arg),*),
            DataType::F16 => $func::<f16>($($arg),*),
            DataType::BF16 => $func::<bf16>($($arg),*),
            DataType::I8 => $func::<i8>($($arg),*),
            DataType::I32 => $func::<i32>($($arg),*),
            DataType::I64 => $func::<i64>($($arg),*),
            DataType::U8 => $func::<u8>($($arg),*),
            DataType::U32 => $func::<u32>($($arg),*),
            DataType::U64 => $func::<u64>($($arg),*),
        }
    };
}

/// Element-wise `dst[i] = op(dst[i], src[i])` on byte slices interpreted as
/// `dtype` elements.
///
/// Both slices must hold exactly `count * dtype.size_in_bytes()` bytes.
pub fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    let expected = count * dtype.size_in_bytes();
    if dst.len() != expected || src.len() != expected {
        return Err(FlagcxError::BufferSizeMismatch {
            expected,
            actual: if dst.len() != expected {
                dst.len()
            } else {
                src.len()
            },
        });
    }
    dispatch!(dtype, reduce_slice_typed::<_>(dst, src, count, op));
    Ok(())
}

/// Divide every element by `n`. Finishes an `Avg` reduction.
pub fn scale_slice(buf: &mut [u8], count: usize, dtype: DataType, n: usize) -> Result<()> {
    let expected = count * dtype.size_in_bytes();
    if buf.len() != expected {
        return Err(FlagcxError::BufferSizeMismatch {
            expected,
            actual: buf.len(),
        });
    }
    if n > 1 {
        dispatch!(dtype, scale_slice_typed::<_>(buf, count, n));
    }
    Ok(())
}

/// A buffer of `count` identity elements for `op` (Sum→0, Prod→1,
/// Min→type max, Max→type min).
pub fn identity_slice(count: usize, dtype: DataType, op: ReduceOp) -> Vec<u8> {
    dispatch!(dtype, identity_slice_typed::<_>(count, op))
}

fn reduce_slice_typed<T: Reducible>(dst: &mut [u8], src: &[u8], count: usize, op: ReduceOp) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let a = T::read_le(&dst[off..off + t_size]);
        let b = T::read_le(&src[off..off + t_size]);
        T::reduce(a, b, op).write_le(&mut dst[off..off + t_size]);
    }
}

fn scale_slice_typed<T: Reducible>(buf: &mut [u8], count: usize, n: usize) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let v = T::read_le(&buf[off..off + t_size]);
        v.div_count(n).write_le(&mut buf[off..off + t_size]);
    }
}

fn identity_slice_typed<T: Reducible>(count: usize, op: ReduceOp) -> Vec<u8> {
    let val = T::identity(op);
    let t_size = std::mem::size_of::<T>();
    let mut buf = vec![0u8; count * t_size];
    for chunk in buf.chunks_exact_mut(t_size) {
        val.write_le(chunk);
    }
    buf
}
