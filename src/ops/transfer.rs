use ndarray::{Dimension, IxDyn, indices};

use super::{arg, ensure_distinct, ensure_live, ensure_same_dtype, submit_to};
use crate::{
    error::{Result, TileErr},
    kernel::{
        transfer::{Region, copy_region},
        typed, typed_mut,
    },
    tensor::{DistributedTensor, any_dispatch},
};

fn region(t: &DistributedTensor, i: usize) -> Region {
    Region::new(t.tile_region(i))
}

/// Returns the tiles of `src` overlapping `dst_region`.
fn overlapping(src: &DistributedTensor, dst_region: &Region) -> Vec<usize> {
    let tile = src.layout().tile_shape();
    let (lo, extents): (Vec<_>, Vec<_>) = dst_region
        .ranges
        .iter()
        .zip(tile)
        .map(|(r, &t)| (r.start / t, (r.end - 1) / t - r.start / t + 1))
        .unzip();

    indices(IxDyn(&extents))
        .into_iter()
        .map(|idx| {
            let src_idx: Vec<_> = idx.slice().iter().zip(&lo).map(|(i, l)| i + l).collect();
            src.layout().multi_index_to_linear(&src_idx)
        })
        .collect()
}

/// Copies `src` into `dst`, two tensors of equal shape and element type but possibly different
/// tilings and distributions.
///
/// Each destination tile gathers every overlapping source tile, reads of tiles living on
/// another node show up as transfers in the runtime statistics.
pub fn redistribute(src: &DistributedTensor, dst: &DistributedTensor) -> Result<()> {
    ensure_live(&[src, dst])?;
    ensure_distinct("redistribute", src, dst)?;
    ensure_same_dtype(src, dst)?;

    if src.shape() != dst.shape() {
        return Err(TileErr::shape("redistribute", dst.shape(), src.shape()));
    }

    any_dispatch!(dst.dtype(), T => {
        for d in 0..dst.grid_size() {
            let dst_region = region(dst, d);

            for s in overlapping(src, &dst_region) {
                let src_region = region(src, s);
                let Some(part) = src_region.intersect(&dst_region) else {
                    continue;
                };
                let dst_region = dst_region.clone();

                submit_to("redistribute", dst, d, vec![arg(src, s)], move |ins, out| {
                    let src = typed::<T>(ins[0])?;
                    copy_region(src, &src_region, typed_mut::<T>(out)?, &dst_region, &part)
                })?;
            }
        }
        Ok(())
    })
}

/// Splits a single tile tensor into the tiles of `dst`.
pub fn scatter(src: &DistributedTensor, dst: &DistributedTensor) -> Result<()> {
    if src.grid_size() != 1 {
        return Err(TileErr::shape("scatter", &[1], src.layout().grid_shape()));
    }

    redistribute(src, dst)
}

/// Collects the tiles of `src` into a single tile tensor.
pub fn gather(src: &DistributedTensor, dst: &DistributedTensor) -> Result<()> {
    if dst.grid_size() != 1 {
        return Err(TileErr::shape("gather", &[1], dst.layout().grid_shape()));
    }

    redistribute(src, dst)
}
