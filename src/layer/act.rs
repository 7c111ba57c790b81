use log::debug;

use super::{Layer, Parameter, ensure_float, if_grad, moments};
use crate::{
    error::Result,
    ops,
    tag::TagAllocator,
    tensor::{DistributedTensor, TensorMoments},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActKind {
    Relu,
    /// GELU with the tanh approximation.
    GeluTanh,
}

/// An elementwise activation.
#[derive(Debug)]
pub struct Act {
    x: TensorMoments,
    y: TensorMoments,
    kind: ActKind,
}

impl Act {
    /// Creates a new `Act` layer, consuming tags for the output value and, if `x` carries a
    /// gradient, the output gradient.
    pub fn generate_simple(
        x: &TensorMoments,
        kind: ActKind,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        let xv = x.value();
        ensure_float("act", xv)?;

        let (y, tags) = moments(xv.layout().clone(), xv, xv.dtype(), x.grad_required(), tags)?;

        Ok((
            Self {
                x: x.clone(),
                y,
                kind,
            },
            tags,
        ))
    }

    pub fn output(&self) -> &TensorMoments {
        &self.y
    }
}

impl Layer for Act {
    fn name(&self) -> &'static str {
        match self.kind {
            ActKind::Relu => "relu",
            ActKind::GeluTanh => "gelutanh",
        }
    }

    fn outputs(&self) -> Vec<TensorMoments> {
        vec![self.y.clone()]
    }

    fn parameters(&self) -> Vec<Parameter> {
        Vec::new()
    }

    fn temporaries(&self) -> Vec<DistributedTensor> {
        Vec::new()
    }

    fn forward_async(&mut self) -> Result<()> {
        let (x, y) = (self.x.value(), self.y.value());
        match self.kind {
            ActKind::Relu => ops::relu(x, y)?,
            ActKind::GeluTanh => ops::gelutanh(x, y)?,
        }

        debug!(tag = y.tag(), kind = self.name(); "activation forward enqueued");
        Ok(())
    }

    fn backward_async(&mut self) -> Result<()> {
        // No gradient flows into an input that doesn't carry one
        let Some(dy) = self.y.grad() else {
            return Ok(());
        };
        let x = self.x.value();

        if_grad(&self.x, |dx| match self.kind {
            ActKind::Relu => ops::relu_backward(x, dy, dx),
            ActKind::GeluTanh => ops::gelutanh_backward(x, dy, dx),
        })?;

        debug!(tag = dy.tag(), kind = self.name(); "activation backward enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use runtime::{Runtime, RuntimeConfig};

    use super::*;
    use crate::{
        layout::TileLayout,
        tensor::{DType, distribution},
    };

    #[test]
    fn relu_masks_negative_inputs_in_both_passes() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let layout = TileLayout::compute(&[4], &[3]).unwrap();
        let dist = distribution::single_node(&layout, 0);
        let (x, tags) =
            TensorMoments::generate(layout, dist, DType::F32, true, &rt, TagAllocator::new())
                .unwrap();
        let (mut layer, _) = Act::generate_simple(&x, ActKind::Relu, tags).unwrap();

        x.value().load(array![-1f32, 2., -3., 4.].into_dyn().view()).unwrap();
        layer.forward_async().unwrap();
        let y = layer.output().value().to_array::<f32>().unwrap();
        assert_eq!(y, array![0f32, 2., 0., 4.].into_dyn());

        let dy = array![1f32, 1., 1., 1.].into_dyn();
        layer.output().grad().unwrap().load(dy.view()).unwrap();
        layer.backward_async().unwrap();
        let dx = x.grad().unwrap().to_array::<f32>().unwrap();
        assert_eq!(dx, array![0f32, 1., 0., 1.].into_dyn());
    }

    #[test]
    fn backward_is_a_no_op_without_an_input_gradient() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let layout = TileLayout::compute(&[3], &[2]).unwrap();
        let dist = distribution::single_node(&layout, 0);
        let (x, tags) =
            TensorMoments::generate(layout, dist, DType::F64, false, &rt, TagAllocator::new())
                .unwrap();
        let (mut layer, _) = Act::generate_simple(&x, ActKind::GeluTanh, tags).unwrap();
        assert!(layer.output().grad().is_none());

        layer.forward_async().unwrap();
        layer.backward_async().unwrap();
        rt.wait_for_all().unwrap();
    }
}
