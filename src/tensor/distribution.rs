//! Helpers building tile to node maps.

use crate::layout::TileLayout;

/// Places every tile of `layout` on `node`.
pub fn single_node(layout: &TileLayout, node: usize) -> Vec<usize> {
    vec![node; layout.grid_size()]
}

/// Deals the tiles of `layout` to `nodes` nodes in tile order.
pub fn round_robin(layout: &TileLayout, nodes: usize) -> Vec<usize> {
    (0..layout.grid_size()).map(|i| i % nodes.max(1)).collect()
}

/// Deals whole rows of tiles along `axis` to `nodes` nodes, so tiles sharing a coordinate on
/// `axis` share an owner.
pub fn by_axis(layout: &TileLayout, axis: usize, nodes: usize) -> Vec<usize> {
    (0..layout.grid_size())
        .map(|i| {
            let idx = layout.linear_to_multi_index(i);
            idx.get(axis).copied().unwrap_or_default() % nodes.max(1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributions_cover_the_grid() {
        let layout = TileLayout::compute(&[4, 6], &[2, 2]).unwrap();

        assert_eq!(single_node(&layout, 1), [1; 6]);
        assert_eq!(round_robin(&layout, 4), [0, 1, 2, 3, 0, 1]);
        assert_eq!(by_axis(&layout, 0, 2), [0, 0, 0, 1, 1, 1]);
    }
}
