use log::debug;

use super::{Layer, Parameter, ensure_float, if_grad, last_axis, moments, param_seed};
use crate::{
    error::Result,
    layout::TileLayout,
    ops,
    tag::TagAllocator,
    tensor::{DistributedTensor, TensorMoments},
};

/// The shape of a `Linear` layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearConfig {
    /// The extent of the output's last axis.
    pub out_features: usize,
    /// The tile extent of the output's last axis.
    pub out_tile: usize,
    pub bias: bool,
    /// Seeds the weight initialization.
    pub seed: u64,
}

/// `y := x·W + b` over the last axis of `x`.
#[derive(Debug)]
pub struct Linear {
    x: TensorMoments,
    y: TensorMoments,
    w: TensorMoments,
    b: Option<TensorMoments>,
}

impl Linear {
    /// Creates a new `Linear` layer.
    ///
    /// Consumes tags for the output value and gradient, then `W` and its gradient, then `b` and
    /// its gradient. `W` is drawn from `N(0, 1 / in_features)` and `b` starts at zero.
    ///
    /// # Arguments
    /// * `x` - The `[B.., in_features]` input.
    /// * `config` - The output width and tiling.
    /// * `tags` - The tag allocator.
    pub fn generate_simple(
        x: &TensorMoments,
        config: LinearConfig,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        let xv = x.value();
        ensure_float("linear", xv)?;
        let last = last_axis("linear", xv)?;
        let dtype = xv.dtype();

        let in_features = xv.shape()[last];
        let in_tile = xv.layout().tile_shape()[last];

        let mut shape = xv.shape().to_vec();
        let mut tile = xv.layout().tile_shape().to_vec();
        shape[last] = config.out_features;
        tile[last] = config.out_tile;

        let y_layout = TileLayout::compute(&shape, &tile)?;
        let w_layout = TileLayout::compute(
            &[in_features, config.out_features],
            &[in_tile, config.out_tile],
        )?;

        let (y, tags) = moments(y_layout, xv, dtype, true, tags)?;
        let (w, tags) = moments(w_layout, xv, dtype, true, tags)?;

        let (b, tags) = if config.bias {
            let b_layout = TileLayout::compute(&[config.out_features], &[config.out_tile])?;
            let (b, tags) = moments(b_layout, xv, dtype, true, tags)?;
            (Some(b), tags)
        } else {
            (None, tags)
        };

        let stddev = (in_features as f64).recip().sqrt();
        ops::randn(w.value(), param_seed(config.seed, w.value()), 0., stddev)?;

        Ok((
            Self {
                x: x.clone(),
                y,
                w,
                b,
            },
            tags,
        ))
    }

    pub fn output(&self) -> &TensorMoments {
        &self.y
    }

    pub fn weights(&self) -> &TensorMoments {
        &self.w
    }

    pub fn bias(&self) -> Option<&TensorMoments> {
        self.b.as_ref()
    }
}

impl Layer for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn outputs(&self) -> Vec<TensorMoments> {
        vec![self.y.clone()]
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![Parameter::new("weight", self.w.clone())];
        params.extend(self.b.clone().map(|b| Parameter::new("bias", b)));
        params
    }

    fn temporaries(&self) -> Vec<DistributedTensor> {
        Vec::new()
    }

    fn forward_async(&mut self) -> Result<()> {
        let y = self.y.value();
        ops::gemm(1., false, self.x.value(), false, self.w.value(), 0., y, 1, 0)?;

        if let Some(b) = &self.b {
            ops::add_fiber(1., b.value(), 1., y, y.ndim() - 1)?;
        }

        debug!(tag = y.tag(); "linear forward enqueued");
        Ok(())
    }

    fn backward_async(&mut self) -> Result<()> {
        let dy = self.y.grad_or_err()?;
        let x = self.x.value();

        let batch_axes = x.ndim() - 1;
        ops::gemm(1., true, x, false, dy, 1., self.w.grad_or_err()?, batch_axes, 0)?;

        if let Some(b) = &self.b {
            ops::sum_fiber(1., dy, 1., b.grad_or_err()?, dy.ndim() - 1)?;
        }

        if_grad(&self.x, |dx| ops::gemm(1., false, dy, true, self.w.value(), 1., dx, 1, 0))?;

        debug!(tag = dy.tag(); "linear backward enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn, array};
    use runtime::{Runtime, RuntimeConfig};

    use super::*;
    use crate::tensor::{DType, distribution};

    #[test]
    fn computes_an_affine_map_and_its_gradients() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let layout = TileLayout::compute(&[2, 3], &[1, 2]).unwrap();
        let dist = distribution::single_node(&layout, 0);
        let (x, tags) =
            TensorMoments::generate(layout, dist, DType::F64, true, &rt, TagAllocator::new())
                .unwrap();

        let config = LinearConfig {
            out_features: 2,
            out_tile: 1,
            bias: true,
            seed: 7,
        };
        let (mut layer, _) = Linear::generate_simple(&x, config, tags).unwrap();

        let xs = array![[1., 2., 3.], [4., 5., 6.]].into_dyn();
        let w = array![[1., 0.], [0., 1.], [1., 1.]].into_dyn();
        x.value().load(xs.view()).unwrap();
        layer.weights().value().load(w.view()).unwrap();
        layer.bias().unwrap().value().load(array![0.5, -0.5].into_dyn().view()).unwrap();

        layer.forward_async().unwrap();
        let y = layer.output().value().to_array::<f64>().unwrap();
        assert_eq!(y, array![[4.5, 4.5], [10.5, 10.5]].into_dyn());

        let dy = ArrayD::from_elem(IxDyn(&[2, 2]), 1.);
        layer.output().grad().unwrap().load(dy.view()).unwrap();
        layer.backward_async().unwrap();

        let dw = layer.weights().grad().unwrap().to_array::<f64>().unwrap();
        let db = layer.bias().unwrap().grad().unwrap().to_array::<f64>().unwrap();
        let dx = x.grad().unwrap().to_array::<f64>().unwrap();

        assert_eq!(dw, array![[5., 5.], [7., 7.], [9., 9.]].into_dyn());
        assert_eq!(db, array![2., 2.].into_dyn());
        assert_eq!(dx, array![[1., 1., 2.], [1., 1., 2.]].into_dyn());
    }
}
