use log::debug;

use super::{Layer, Parameter, ensure_float, if_grad, moments};
use crate::{
    error::{Result, TileErr},
    ops,
    tag::TagAllocator,
    tensor::{DistributedTensor, TensorMoments},
};

/// `u := x + y` with the slice `y` broadcast along `axis`.
#[derive(Debug)]
pub struct AddSlice {
    x: TensorMoments,
    y: TensorMoments,
    u: TensorMoments,
    axis: usize,
}

impl AddSlice {
    /// Creates a new `AddSlice` layer.
    ///
    /// Consumes a tag for the output value and one for its gradient when either input carries
    /// a gradient.
    ///
    /// # Arguments
    /// * `x` - The full input.
    /// * `y` - The slice input, shaped and tiled like `x` without `axis`.
    /// * `axis` - The axis `y` is broadcast along.
    /// * `tags` - The tag allocator.
    ///
    /// # Returns
    /// The layer and the advanced allocator, or `ShapeMismatch` on incompatible inputs.
    pub fn generate_simple(
        x: &TensorMoments,
        y: &TensorMoments,
        axis: usize,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        ensure_float("add_slice", x.value())?;
        x.value().ensure_dtype(y.value().dtype())?;

        let expected = x.layout().remove_axis(axis)?;
        if expected.shape() != y.shape() || expected.tile_shape() != y.layout().tile_shape() {
            return Err(TileErr::shape("add_slice", expected.shape(), y.shape()));
        }

        let grad_required = x.grad_required() || y.grad_required();
        let (u, tags) = moments(
            x.layout().clone(),
            x.value(),
            x.value().dtype(),
            grad_required,
            tags,
        )?;

        Ok((
            Self {
                x: x.clone(),
                y: y.clone(),
                u,
                axis,
            },
            tags,
        ))
    }

    pub fn output(&self) -> &TensorMoments {
        &self.u
    }
}

impl Layer for AddSlice {
    fn name(&self) -> &'static str {
        "add_slice"
    }

    fn outputs(&self) -> Vec<TensorMoments> {
        vec![self.u.clone()]
    }

    fn parameters(&self) -> Vec<Parameter> {
        Vec::new()
    }

    fn temporaries(&self) -> Vec<DistributedTensor> {
        Vec::new()
    }

    fn forward_async(&mut self) -> Result<()> {
        let u = self.u.value();
        ops::copy(self.x.value(), u)?;
        ops::add_slice(1., self.y.value(), 1., u, self.axis)?;

        // backward only needs the output gradient
        self.x.value().mark_unused()?;
        self.y.value().mark_unused()?;

        debug!(tag = u.tag(); "add_slice forward enqueued");
        Ok(())
    }

    fn backward_async(&mut self) -> Result<()> {
        let Some(du) = self.u.grad() else {
            return Ok(());
        };

        if_grad(&self.x, |dx| ops::add(1., du, 1., dx))?;
        if_grad(&self.y, |dy| ops::sum_slice(1., du, 1., dy, self.axis))?;

        debug!(tag = du.tag(); "add_slice backward enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};
    use runtime::{Runtime, RuntimeConfig};

    use super::*;
    use crate::{
        layout::TileLayout,
        tensor::{DType, distribution},
    };

    fn generate(
        rt: &Runtime,
        shape: &[usize],
        tile: &[usize],
        tags: TagAllocator,
    ) -> (TensorMoments, TagAllocator) {
        let layout = TileLayout::compute(shape, tile).unwrap();
        let dist = distribution::round_robin(&layout, rt.nodes());
        TensorMoments::generate(layout, dist, DType::F64, true, rt, tags).unwrap()
    }

    #[test]
    fn broadcasts_and_reduces_along_the_axis() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let (x, tags) = generate(&rt, &[2, 3], &[1, 2], TagAllocator::new());
        let (y, tags) = generate(&rt, &[2], &[1], tags);
        let (mut layer, _) = AddSlice::generate_simple(&x, &y, 1, tags).unwrap();

        let xs = ArrayD::from_shape_fn(IxDyn(&[2, 3]), |i| (i[0] * 3 + i[1]) as f64);
        x.value().load(xs.view()).unwrap();
        y.value().load(ndarray::arr1(&[10., 20.]).into_dyn().view()).unwrap();

        layer.forward_async().unwrap();
        let u = layer.output().value().to_array::<f64>().unwrap();
        assert_eq!(u.as_slice().unwrap(), [10., 11., 12., 23., 24., 25.]);

        let du = ArrayD::from_elem(IxDyn(&[2, 3]), 1.);
        layer.output().grad().unwrap().load(du.view()).unwrap();
        layer.backward_async().unwrap();
        layer.backward_async().unwrap();

        let dx = x.grad().unwrap().to_array::<f64>().unwrap();
        let dy = y.grad().unwrap().to_array::<f64>().unwrap();
        assert_eq!(dx, ArrayD::from_elem(IxDyn(&[2, 3]), 2.));
        assert_eq!(dy.as_slice().unwrap(), [6., 6.]);
    }

    #[test]
    fn backward_is_a_no_op_without_input_gradients() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let plain = |shape: &[usize], tile: &[usize], tags| {
            let layout = TileLayout::compute(shape, tile).unwrap();
            let dist = distribution::single_node(&layout, 0);
            TensorMoments::generate(layout, dist, DType::F64, false, &rt, tags).unwrap()
        };

        let (x, tags) = plain(&[2, 3], &[1, 3], TagAllocator::new());
        let (y, tags) = plain(&[2], &[1], tags);

        let (mut layer, _) = AddSlice::generate_simple(&x, &y, 1, tags).unwrap();
        assert!(layer.output().grad().is_none());

        layer.forward_async().unwrap();
        layer.backward_async().unwrap();
        rt.wait_for_all().unwrap();
    }

    #[test]
    fn rejects_a_mismatched_slice() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let (x, tags) = generate(&rt, &[2, 3], &[2, 3], TagAllocator::new());
        let (y, tags) = generate(&rt, &[3], &[3], tags);

        let res = AddSlice::generate_simple(&x, &y, 1, tags);
        assert!(matches!(res, Err(TileErr::ShapeMismatch { .. })));
    }
}
