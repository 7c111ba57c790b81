//! Numeric kernels working on the contiguous contents of single tiles.
//!
//! Axis kernels see a tile as a `[m, k, n]` block: `k` is the extent of the axis being reduced
//! or broadcast along, `m` the product of the extents before it and `n` the product of the
//! extents after it. Element `(i, l, j)` lives at `(i * k + l) * n + j`.

pub mod elementwise;
pub mod gemm;
pub mod index;
pub mod random;
pub mod reduce;
pub mod transfer;

use runtime::KernelFault;

use crate::tensor::{Element, FloatElement, TileData};

/// The `[m, k, n]` decomposition of a shape around one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

impl AxisDims {
    /// Decomposes `shape` around `axis`, which must be in range.
    pub fn of(shape: &[usize], axis: usize) -> Self {
        Self {
            m: shape[..axis].iter().product(),
            k: shape[axis],
            n: shape[axis + 1..].iter().product(),
        }
    }
}

/// Views a tile as a slice of `T`.
pub(crate) fn typed<T: Element>(data: &TileData) -> Result<&[T], KernelFault> {
    let dtype = data.dtype();
    T::slice(data).ok_or_else(|| {
        KernelFault::new(format!("expected a {} tile, found {dtype}", T::DTYPE))
    })
}

/// Views a tile as a mutable slice of `T`.
pub(crate) fn typed_mut<T: Element>(data: &mut TileData) -> Result<&mut [T], KernelFault> {
    let dtype = data.dtype();
    T::slice_mut(data).ok_or_else(|| {
        KernelFault::new(format!("expected a {} tile, found {dtype}", T::DTYPE))
    })
}

/// `alpha * x + beta * y`, ignoring `y` when `beta` is zero so stale contents never leak.
#[inline]
pub(crate) fn axpby<T: FloatElement>(alpha: T, x: T, beta: T, y: T) -> T {
    if beta == T::zero() {
        alpha * x
    } else {
        alpha * x + beta * y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_dims() {
        assert_eq!(AxisDims::of(&[2, 3, 4], 1), AxisDims { m: 2, k: 3, n: 4 });
        assert_eq!(AxisDims::of(&[5], 0), AxisDims { m: 1, k: 5, n: 1 });
    }

    #[test]
    fn zero_beta_discards_nan() {
        assert_eq!(axpby(2.0, 3.0, 0.0, f64::NAN), 6.0);
    }
}
