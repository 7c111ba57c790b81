use ndarray::{IxDyn, indices};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use crate::tensor::FloatElement;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Fills one tile with normal samples.
///
/// Every element is drawn from a generator seeded by `seed` and its global position, so the
/// contents of a tensor don't depend on how it is tiled.
///
/// # Arguments
/// * `normal` - The distribution to sample.
/// * `seed` - The seed of the whole tensor.
/// * `shape` - The shape of the whole tensor.
/// * `offset` - The global position of the tile's first element.
/// * `tile_shape` - The shape of the tile.
/// * `dst` - The tile contents.
pub fn randn<T: FloatElement>(
    normal: &Normal<f64>,
    seed: u64,
    shape: &[usize],
    offset: &[usize],
    tile_shape: &[usize],
    dst: &mut [T],
) {
    for (d, idx) in dst.iter_mut().zip(indices(IxDyn(tile_shape))) {
        let global = shape
            .iter()
            .zip(offset)
            .enumerate()
            .fold(0u64, |acc, (axis, (&extent, &off))| {
                acc * extent as u64 + (idx[axis] + off) as u64
            });

        let mut rng = StdRng::seed_from_u64(splitmix64(seed ^ splitmix64(global)));
        *d = T::of(normal.sample(&mut rng));
    }
}
