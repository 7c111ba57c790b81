use rand_distr::Normal;

use super::submit_to;
use crate::{
    error::{Result, TileErr},
    kernel::{random as k, typed_mut},
    tensor::{DistributedTensor, float_dispatch},
};

/// Fills `dst` with samples of `N(mean, stddev^2)`.
///
/// The result depends on `seed` and the shape of `dst`, never on its tiling or distribution.
///
/// # Returns
/// `InvalidConfig` when `stddev` is negative or not finite.
pub fn randn(dst: &DistributedTensor, seed: u64, mean: f64, stddev: f64) -> Result<()> {
    dst.ensure_live()?;

    let normal = Normal::new(mean, stddev)
        .map_err(|e| TileErr::InvalidConfig(format!("randn: {e}")))?;

    float_dispatch!("randn", dst.dtype(), T => {
        let layout = dst.layout();
        for i in 0..dst.grid_size() {
            let idx = layout.linear_to_multi_index(i);
            let offset = layout.tile_offset(&idx);
            let tile_shape = layout.tile_shape_at_index(&idx);
            let shape = layout.shape().to_vec();

            submit_to("randn", dst, i, vec![], move |_, out| {
                k::randn(&normal, seed, &shape, &offset, &tile_shape, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}
