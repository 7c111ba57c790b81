use ndarray::{Dimension, IxDyn, indices};

use super::{arg, ensure_distinct, ensure_live, submit_to};
use crate::{
    error::{Result, TileErr},
    kernel::{
        gemm::{self as k, GemmDims},
        typed, typed_mut,
    },
    tensor::{DistributedTensor, FloatElement, float_dispatch},
};

/// Positions of the axis groups of one gemm operand.
struct Groups {
    batch: Vec<usize>,
    /// The free axes, `M` for `A` and `N` for `B`.
    free: Vec<usize>,
    contracted: Vec<usize>,
}

impl Groups {
    /// Splits the axes of an operand stored as `[batch, free, contracted]`, or
    /// `[batch, contracted, free]` when `contracted_first`.
    fn of(
        t: &DistributedTensor,
        ndim: usize,
        batch_ndim: usize,
        contracted_first: bool,
    ) -> Result<Self> {
        let rank = t.ndim();
        if rank < ndim + batch_ndim {
            return Err(TileErr::InvalidAxis {
                axis: ndim + batch_ndim,
                ndim: rank,
            });
        }

        let batch = (0..batch_ndim).collect();
        let free_ndim = rank - ndim - batch_ndim;
        let (free, contracted) = if contracted_first {
            (
                (batch_ndim + ndim..rank).collect(),
                (batch_ndim..batch_ndim + ndim).collect(),
            )
        } else {
            (
                (batch_ndim..batch_ndim + free_ndim).collect(),
                (batch_ndim + free_ndim..rank).collect(),
            )
        };

        Ok(Self {
            batch,
            free,
            contracted,
        })
    }
}

fn pick(values: &[usize], axes: &[usize]) -> Vec<usize> {
    axes.iter().map(|&a| values[a]).collect()
}

/// Fails unless the `a_axes` of `a` and the `b_axes` of `b` agree in shape and tiling.
fn ensure_axes_match(
    a: &DistributedTensor,
    a_axes: &[usize],
    b: &DistributedTensor,
    b_axes: &[usize],
) -> Result<()> {
    let (sa, sb) = (pick(a.shape(), a_axes), pick(b.shape(), b_axes));
    if sa != sb {
        return Err(TileErr::shape("gemm", &sa, &sb));
    }

    let ta = pick(a.layout().tile_shape(), a_axes);
    let tb = pick(b.layout().tile_shape(), b_axes);
    if ta != tb {
        return Err(TileErr::shape("gemm", &ta, &tb));
    }

    Ok(())
}

/// Places the index groups of an operand at their axis positions.
fn assemble(rank: usize, parts: &[(&[usize], &[usize])]) -> Vec<usize> {
    let mut idx = vec![0; rank];
    for (axes, values) in parts {
        for (&axis, &v) in axes.iter().zip(values.iter()) {
            idx[axis] = v;
        }
    }
    idx
}

/// `C := alpha * op(A) * op(B) + beta * C`, contracting `ndim` axes.
///
/// The leading `batch_ndim` axes of every operand are batch axes. Past them `A` is
/// `[M.., K..]` (`[K.., M..]` when `trans_a`), `B` is `[K.., N..]` (`[N.., K..]` when `trans_b`)
/// and `C` is `[M.., N..]`, `K` holding `ndim` axes. Matching axes must be tiled alike.
///
/// # Arguments
/// * `alpha`, `beta` - The scaling factors.
/// * `trans_a`, `a` - The left operand and whether it is stored transposed.
/// * `trans_b`, `b` - The right operand and whether it is stored transposed.
/// * `c` - The output, must not alias `a` or `b`.
/// * `ndim` - The amount of contracted axes.
/// * `batch_ndim` - The amount of leading batch axes.
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    alpha: f64,
    trans_a: bool,
    a: &DistributedTensor,
    trans_b: bool,
    b: &DistributedTensor,
    beta: f64,
    c: &DistributedTensor,
    ndim: usize,
    batch_ndim: usize,
) -> Result<()> {
    ensure_live(&[a, b, c])?;
    ensure_distinct("gemm", a, c)?;
    ensure_distinct("gemm", b, c)?;
    a.ensure_dtype(c.dtype())?;
    b.ensure_dtype(c.dtype())?;

    let ga = Groups::of(a, ndim, batch_ndim, trans_a)?;
    let gb = Groups::of(b, ndim, batch_ndim, !trans_b)?;

    let c_rank = batch_ndim + ga.free.len() + gb.free.len();
    if c.ndim() != c_rank {
        return Err(TileErr::InvalidAxis {
            axis: c_rank,
            ndim: c.ndim(),
        });
    }

    let c_batch: Vec<_> = (0..batch_ndim).collect();
    let c_m: Vec<_> = (batch_ndim..batch_ndim + ga.free.len()).collect();
    let c_n: Vec<_> = (batch_ndim + ga.free.len()..c_rank).collect();

    ensure_axes_match(a, &ga.batch, c, &c_batch)?;
    ensure_axes_match(b, &gb.batch, c, &c_batch)?;
    ensure_axes_match(a, &ga.free, c, &c_m)?;
    ensure_axes_match(b, &gb.free, c, &c_n)?;
    ensure_axes_match(a, &ga.contracted, b, &gb.contracted)?;

    let k_grid = pick(a.layout().grid_shape(), &ga.contracted);
    let k_tiles: Vec<Vec<usize>> = indices(IxDyn(&k_grid))
        .into_iter()
        .map(|idx| idx.slice().to_vec())
        .collect();

    float_dispatch!("gemm", c.dtype(), T => {
        let alpha = T::of(alpha);

        for ci in 0..c.grid_size() {
            let cidx = c.layout().linear_to_multi_index(ci);
            let c_tile = c.layout().tile_shape_at_index(&cidx);
            let bidx = pick(&cidx, &c_batch);
            let midx = pick(&cidx, &c_m);
            let nidx = pick(&cidx, &c_n);

            for (n, kidx) in k_tiles.iter().enumerate() {
                let aidx = assemble(
                    a.ndim(),
                    &[
                        (&ga.batch[..], &bidx[..]),
                        (&ga.free[..], &midx[..]),
                        (&ga.contracted[..], &kidx[..]),
                    ],
                );
                let bidx_full = assemble(
                    b.ndim(),
                    &[
                        (&gb.batch[..], &bidx[..]),
                        (&gb.free[..], &nidx[..]),
                        (&gb.contracted[..], &kidx[..]),
                    ],
                );

                let a_tile = a.layout().tile_shape_at_index(&aidx);
                let dims = GemmDims {
                    batch: pick(&c_tile, &c_batch).iter().product(),
                    m: pick(&c_tile, &c_m).iter().product(),
                    n: pick(&c_tile, &c_n).iter().product(),
                    k: pick(&a_tile, &ga.contracted).iter().product(),
                };
                let beta = T::of(if n == 0 { beta } else { 1. });

                let ai = a.layout().multi_index_to_linear(&aidx);
                let bi = b.layout().multi_index_to_linear(&bidx_full);

                submit_to("gemm", c, ci, vec![arg(a, ai), arg(b, bi)], move |ins, out| {
                    let (a, b) = (typed::<T>(ins[0])?, typed::<T>(ins[1])?);
                    k::gemm(alpha, trans_a, a, trans_b, b, beta, typed_mut::<T>(out)?, dims)
                })?;
            }
        }
        Ok(())
    })
}
