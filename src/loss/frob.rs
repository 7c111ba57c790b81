use super::{Loss, read_scalar};
use crate::{
    error::Result,
    layout::TileLayout,
    ops,
    tag::TagAllocator,
    tensor::{DistributedTensor, TensorMoments},
};

/// Half the squared Frobenius norm of the difference between output and target.
///
/// The gradient seed is `output - target`.
#[derive(Debug)]
pub struct Frob {
    value: DistributedTensor,
}

impl Frob {
    /// Creates a new `Frob` loss for outputs like `output`, consuming one tag for its value.
    pub fn generate(output: &TensorMoments, tags: TagAllocator) -> Result<(Self, TagAllocator)> {
        let out = output.value();
        let (value, tags) = DistributedTensor::new(
            TileLayout::single_tile(&[1])?,
            vec![out.owner(0)],
            out.dtype(),
            out.runtime(),
            tags,
        )?;

        Ok((Self { value }, tags))
    }
}

impl Loss for Frob {
    fn seed_gradient(&mut self, output: &TensorMoments, target: &DistributedTensor) -> Result<()> {
        let grad = output.grad_or_err()?;

        ops::copy(output.value(), grad)?;
        ops::add(-1., target, 1., grad)?;
        ops::dot(0.5, grad, grad, 1., &self.value)
    }

    fn value(&self) -> Result<f64> {
        read_scalar(&self.value)
    }

    fn clear_value(&self) -> Result<()> {
        ops::clear(&self.value)
    }

    fn unregister(&self) -> Result<()> {
        self.value.unregister()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use runtime::{Runtime, RuntimeConfig};

    use super::*;
    use crate::tensor::{DType, distribution};

    #[test]
    fn seeds_the_residual_and_accumulates_the_value() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let layout = TileLayout::compute(&[2, 2], &[1, 2]).unwrap();
        let dist = distribution::single_node(&layout, 0);
        let (out, tags) = TensorMoments::generate(
            layout.clone(),
            dist.clone(),
            DType::F64,
            true,
            &rt,
            TagAllocator::new(),
        )
        .unwrap();
        let (target, tags) = DistributedTensor::new(layout, dist, DType::F64, &rt, tags).unwrap();
        let (mut loss, _) = Frob::generate(&out, tags).unwrap();

        out.value().load(array![[1., 2.], [3., 4.]].into_dyn().view()).unwrap();
        target.load(array![[1., 0.], [0., 4.]].into_dyn().view()).unwrap();

        loss.seed_gradient(&out, &target).unwrap();
        let grad = out.grad().unwrap().to_array::<f64>().unwrap();
        assert_eq!(grad, array![[0., 2.], [3., 0.]].into_dyn());
        assert_eq!(loss.value().unwrap(), 6.5);

        loss.seed_gradient(&out, &target).unwrap();
        assert_eq!(loss.value().unwrap(), 13.);

        loss.clear_value().unwrap();
        assert_eq!(loss.value().unwrap(), 0.);
    }
}
