//! Element-wise reduction kernels shared by the CPU collective backend, the
//! in-process parameter server, and the momentum transform.
//!
//! All kernels operate on byte slices and decode elements via
//! `from_le_bytes`, so unaligned windows (a partition bound need not be a
//! multiple of the element size times eight) are handled correctly.

use half::{bf16, f16};

use crate::error::{EngineError, Result};
use crate::types::{DataType, ReduceOp};

/// Types that support the four reduction operations.
trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

// Half-precision types reduce through f32 to avoid repeated rounding in the
// min/max comparisons.
impl Reducible for f16 {
    #[inline]
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
        f16::from_f32(f32::reduce(a.to_f32(), b.to_f32(), op))
    }
}

impl Reducible for bf16 {
    #[inline]
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
        bf16::from_f32(f32::reduce(a.to_f32(), b.to_f32(), op))
    }
}

/// Read/write a value from a little-endian byte slice (alignment-safe).
trait LeBytes: Sized {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(
                        bytes.try_into().expect("slice length matches type size"),
                    )
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64);

impl LeBytes for f16 {
    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        f16::from_bits(u16::from_le_bytes(bytes.try_into().expect("2 bytes")))
    }
    #[inline]
    fn write_le(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_bits().to_le_bytes());
    }
}

impl LeBytes for bf16 {
    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bf16::from_bits(u16::from_le_bytes(bytes.try_into().expect("2 bytes")))
    }
    #[inline]
    fn write_le(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_bits().to_le_bytes());
    }
}

/// `dst[i] = op(dst[i], src[i])` for `count` elements of `dtype`.
pub fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, count, op),
        DataType::F16 => reduce_slice_typed::<f16>(dst, src, count, op),
        DataType::BF16 => reduce_slice_typed::<bf16>(dst, src, count, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, count, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, count, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, count, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, count, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, count, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, count, op),
    }
    Ok(())
}

fn reduce_slice_typed<T: Reducible + LeBytes>(dst: &mut [u8], src: &[u8], count: usize, op: ReduceOp) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let a = T::read_le(&dst[off..off + t_size]);
        let b = T::read_le(&src[off..off + t_size]);
        T::reduce(a, b, op).write_le(&mut dst[off..off + t_size]);
    }
}

/// `dst[i] = src[i] + alpha * dst[i]` — the momentum accumulation step.
/// Floating-point dtypes only.
pub fn scaled_sum_slice(dst: &mut [u8], src: &[u8], alpha: f64, dtype: DataType) -> Result<()> {
    let count = dst.len() / dtype.size_in_bytes();
    match dtype {
        DataType::F32 => {
            for i in 0..count {
                let off = i * 4;
                let d = f32::read_le(&dst[off..off + 4]);
                let s = f32::read_le(&src[off..off + 4]);
                (s + alpha as f32 * d).write_le(&mut dst[off..off + 4]);
            }
        }
        DataType::F64 => {
            for i in 0..count {
                let off = i * 8;
                let d = f64::read_le(&dst[off..off + 8]);
                let s = f64::read_le(&src[off..off + 8]);
                (s + alpha * d).write_le(&mut dst[off..off + 8]);
            }
        }
        other => {
            return Err(EngineError::UnsupportedDType {
                dtype: other,
                op: "scaled_sum",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_slice_sum_f32() {
        let mut dst = Vec::new();
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            dst.extend_from_slice(&v.to_le_bytes());
        }
        let mut src = Vec::new();
        for v in [10.0f32, 20.0, 30.0, 40.0] {
            src.extend_from_slice(&v.to_le_bytes());
        }
        reduce_slice(&mut dst, &src, 4, DataType::F32, ReduceOp::Sum).unwrap();
        let out: Vec<f32> = dst.chunks(4).map(f32::read_le).collect();
        assert_eq!(out, vec![11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_reduce_slice_handles_half() {
        let vals = [f16::from_f32(1.5), f16::from_f32(2.5)];
        let mut dst: Vec<u8> = vals.iter().flat_map(|v| v.to_bits().to_le_bytes()).collect();
        let src = dst.clone();
        reduce_slice(&mut dst, &src, 2, DataType::F16, ReduceOp::Sum).unwrap();
        assert_eq!(f16::read_le(&dst[0..2]).to_f32(), 3.0);
        assert_eq!(f16::read_le(&dst[2..4]).to_f32(), 5.0);
    }

    #[test]
    fn test_reduce_slice_int_wrapping() {
        let mut dst = 250u8.to_le_bytes().to_vec();
        let src = 10u8.to_le_bytes().to_vec();
        reduce_slice(&mut dst, &src, 1, DataType::U8, ReduceOp::Sum).unwrap();
        assert_eq!(dst[0], 4);
    }

    #[test]
    fn test_reduce_slice_max() {
        let mut dst = Vec::new();
        for v in [5i32, -2] {
            dst.extend_from_slice(&v.to_le_bytes());
        }
        let mut src = Vec::new();
        for v in [3i32, 7] {
            src.extend_from_slice(&v.to_le_bytes());
        }
        reduce_slice(&mut dst, &src, 2, DataType::I32, ReduceOp::Max).unwrap();
        assert_eq!(i32::read_le(&dst[0..4]), 5);
        assert_eq!(i32::read_le(&dst[4..8]), 7);
    }

    #[test]
    fn test_scaled_sum_momentum_step() {
        // m = g + mu * m with mu = 0.5, m = [2, 4], g = [1, 1]
        let mut m = Vec::new();
        for v in [2.0f32, 4.0] {
            m.extend_from_slice(&v.to_le_bytes());
        }
        let mut g = Vec::new();
        for v in [1.0f32, 1.0] {
            g.extend_from_slice(&v.to_le_bytes());
        }
        scaled_sum_slice(&mut m, &g, 0.5, DataType::F32).unwrap();
        assert_eq!(f32::read_le(&m[0..4]), 2.0);
        assert_eq!(f32::read_le(&m[4..8]), 3.0);
    }

    #[test]
    fn test_scaled_sum_rejects_ints() {
        let mut dst = vec![0u8; 4];
        let src = vec![0u8; 4];
        assert!(scaled_sum_slice(&mut dst, &src, 0.9, DataType::I32).is_err());
    }
}
