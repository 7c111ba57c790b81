use std::ops::Range;

use ndarray::{ArrayViewD, ArrayViewMutD, IxDyn, Slice};
use runtime::KernelFault;

/// A box of elements in global coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub ranges: Vec<Range<usize>>,
}

impl Region {
    pub fn new(ranges: Vec<Range<usize>>) -> Self {
        Self { ranges }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.len()).collect()
    }

    /// Returns the overlap of two boxes, `None` when they are disjoint.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let ranges: Vec<_> = self
            .ranges
            .iter()
            .zip(&other.ranges)
            .map(|(a, b)| a.start.max(b.start)..a.end.min(b.end))
            .collect();

        if ranges.iter().any(|r| r.is_empty()) {
            return None;
        }

        Some(Self { ranges })
    }
}

/// Copies `region` from one tile into another.
///
/// # Arguments
/// * `src`, `src_region` - The source tile contents and the box it covers.
/// * `dst`, `dst_region` - The destination tile contents and the box it covers.
/// * `region` - The box to copy, contained in both tiles.
pub fn copy_region<T: Copy>(
    src: &[T],
    src_region: &Region,
    dst: &mut [T],
    dst_region: &Region,
    region: &Region,
) -> Result<(), KernelFault> {
    let fault = |e: ndarray::ShapeError| KernelFault::new(format!("copy_region: {e}"));

    let src_view = ArrayViewD::from_shape(IxDyn(&src_region.shape()), src).map_err(fault)?;
    let mut dst_view =
        ArrayViewMutD::from_shape(IxDyn(&dst_region.shape()), dst).map_err(fault)?;

    let local = |outer: &Region, axis: usize| {
        let r = &region.ranges[axis];
        let base = outer.ranges[axis].start;
        Slice::from(r.start - base..r.end - base)
    };

    let part = src_view.slice_each_axis(|ax| local(src_region, ax.axis.index()));
    dst_view
        .slice_each_axis_mut(|ax| local(dst_region, ax.axis.index()))
        .assign(&part);

    Ok(())
}
