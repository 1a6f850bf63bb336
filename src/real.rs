//! Scalar element trait shared by every matrix and layer.
//!
//! Layers are generic over `f32` and `f64`. The trait carries the
//! conversions the accelerator and the collectives need (both move data as a
//! fixed float type), the raw byte codec used by parameter files, and the
//! per-type entry points of the optional GEMM backends.

use core::fmt::{Debug, Display, LowerExp};
use core::iter::Sum;

use num_traits::{Float, NumAssign};

/// Floating point element usable in a [`Matrix`](crate::matrix::Matrix).
pub trait Real:
    Float + NumAssign + Sum + Default + Debug + Display + LowerExp + Send + Sync + 'static
{
    /// Size of one element in a raw parameter dump.
    const BYTES: usize;

    /// Convert to `f32`.
    fn into_f32(self) -> f32;
    /// Convert from `f32`.
    fn from_f32(x: f32) -> Self;
    /// Convert to `f64`.
    fn into_f64(self) -> f64;
    /// Convert from `f64`.
    fn from_f64(x: f64) -> Self;

    /// Appends the little-endian encoding of `self`.
    fn write_le(self, out: &mut Vec<u8>);
    /// Decodes one element from exactly [`Self::BYTES`] bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// `c = alpha * a * b + beta * c` through `matrixmultiply`.
    ///
    /// Operands are given as `(pointer, row stride, column stride)`; the
    /// caller guarantees every index is in bounds.
    #[cfg(feature = "blas")]
    #[allow(clippy::too_many_arguments)]
    fn gemm_blas(
        m: usize,
        k: usize,
        n: usize,
        alpha: Self,
        a: (&[Self], usize, usize),
        b: (&[Self], usize, usize),
        beta: Self,
        c: &mut [Self],
    );

    /// `c = alpha * a * b + beta * c` through `ndarray::linalg::general_mat_mul`.
    #[cfg(feature = "ndarray")]
    #[allow(clippy::too_many_arguments)]
    fn gemm_expr(
        m: usize,
        k: usize,
        n: usize,
        alpha: Self,
        a: (&[Self], usize, usize),
        b: (&[Self], usize, usize),
        beta: Self,
        c: &mut [Self],
    );
}

macro_rules! impl_real {
    ($ty:ty, $gemm:ident) => {
        impl Real for $ty {
            const BYTES: usize = core::mem::size_of::<$ty>();

            #[allow(clippy::cast_possible_truncation)]
            fn into_f32(self) -> f32 {
                self as f32
            }

            fn from_f32(x: f32) -> Self {
                x as Self
            }

            fn into_f64(self) -> f64 {
                self as f64
            }

            #[allow(clippy::cast_possible_truncation)]
            fn from_f64(x: f64) -> Self {
                x as Self
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Self::from_le_bytes(raw)
            }

            #[cfg(feature = "blas")]
            fn gemm_blas(
                m: usize,
                k: usize,
                n: usize,
                alpha: Self,
                a: (&[Self], usize, usize),
                b: (&[Self], usize, usize),
                beta: Self,
                c: &mut [Self],
            ) {
                debug_assert!(c.len() >= m * n);
                // SAFETY: strides and extents come from live matrices whose
                // buffers cover every index touched by an m×k by k×n product.
                unsafe {
                    matrixmultiply::$gemm(
                        m,
                        k,
                        n,
                        alpha,
                        a.0.as_ptr(),
                        a.1 as isize,
                        a.2 as isize,
                        b.0.as_ptr(),
                        b.1 as isize,
                        b.2 as isize,
                        beta,
                        c.as_mut_ptr(),
                        n as isize,
                        1,
                    );
                }
            }

            #[cfg(feature = "ndarray")]
            fn gemm_expr(
                m: usize,
                k: usize,
                n: usize,
                alpha: Self,
                a: (&[Self], usize, usize),
                b: (&[Self], usize, usize),
                beta: Self,
                c: &mut [Self],
            ) {
                use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder};

                let a = ArrayView2::from_shape((m, k).strides((a.1, a.2)), a.0)
                    .expect("left operand strides stay inside its buffer");
                let b = ArrayView2::from_shape((k, n).strides((b.1, b.2)), b.0)
                    .expect("right operand strides stay inside its buffer");
                let mut c = ArrayViewMut2::from_shape((m, n), &mut c[..m * n])
                    .expect("output buffer is m×n row-major");
                ndarray::linalg::general_mat_mul(alpha, &a, &b, beta, &mut c);
            }
        }
    };
}

impl_real!(f32, sgemm);
impl_real!(f64, dgemm);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_codec_is_little_endian() {
        let mut out = Vec::new();
        1.5f64.write_le(&mut out);
        assert_eq!(out, 1.5f64.to_le_bytes());
        assert_eq!(f64::read_le(&out), 1.5);

        let mut out = Vec::new();
        (-2.25f32).write_le(&mut out);
        assert_eq!(out.len(), f32::BYTES);
        assert_eq!(f32::read_le(&out), -2.25);
    }

    #[test]
    fn f32_round_trips_through_f64() {
        let x = 0.1f32;
        assert_eq!(f32::from_f64(x.into_f64()), x);
    }
}
