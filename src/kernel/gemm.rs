use ndarray::{ArrayView2, ArrayViewMut2, linalg::general_mat_mul};
use runtime::KernelFault;

use crate::tensor::FloatElement;

/// Sizes of a batched matrix product `C[b] = op(A[b]) * op(B[b])`, `C[b]` being `m x n` and
/// the contraction running over `k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDims {
    pub batch: usize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// `C := alpha * op(A) * op(B) + beta * C` for every batch entry.
///
/// Batches lead: `A` is `[batch, m, k]` (`[batch, k, m]` when `trans_a`), `B` is
/// `[batch, k, n]` (`[batch, n, k]` when `trans_b`) and `C` is `[batch, m, n]`.
pub fn gemm<T: FloatElement>(
    alpha: T,
    trans_a: bool,
    a: &[T],
    trans_b: bool,
    b: &[T],
    beta: T,
    c: &mut [T],
    dims: GemmDims,
) -> Result<(), KernelFault> {
    let GemmDims { batch, m, n, k } = dims;
    let fault = |e: ndarray::ShapeError| KernelFault::new(format!("gemm: {e}"));

    if beta == T::zero() {
        c.fill(T::zero());
    }

    for ib in 0..batch {
        let a_b = &a[ib * m * k..][..m * k];
        let b_b = &b[ib * k * n..][..k * n];
        let c_b = &mut c[ib * m * n..][..m * n];

        let a_view = if trans_a {
            ArrayView2::from_shape((k, m), a_b).map_err(fault)?.reversed_axes()
        } else {
            ArrayView2::from_shape((m, k), a_b).map_err(fault)?
        };

        let b_view = if trans_b {
            ArrayView2::from_shape((n, k), b_b).map_err(fault)?.reversed_axes()
        } else {
            ArrayView2::from_shape((k, n), b_b).map_err(fault)?
        };

        let mut c_view = ArrayViewMut2::from_shape((m, n), c_b).map_err(fault)?;
        general_mat_mul(alpha, &a_view, &b_view, beta, &mut c_view);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transposes_and_batches() {
        // A^T with A = [[1, 2], [3, 4]] stored as [[1, 3], [2, 4]]
        let a = [1., 3., 2., 4., 1., 0., 0., 1.];
        let b = [1., 1., 0., 1., 2., 3., 4., 5.];
        let mut c = [9.; 8];

        let dims = GemmDims {
            batch: 2,
            m: 2,
            n: 2,
            k: 2,
        };
        gemm(1., true, &a, false, &b, 0., &mut c, dims).unwrap();

        assert_eq!(&c[..4], [1., 3., 3., 7.]);
        // second batch: A^T = identity
        assert_eq!(&c[4..], [2., 3., 4., 5.]);
    }
}
