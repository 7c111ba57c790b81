use super::{Loss, read_scalar};
use crate::{
    error::{Result, TileErr},
    layer::{last_axis, temporary},
    layout::TileLayout,
    ops,
    tag::TagAllocator,
    tensor::{DistributedTensor, TensorMoments},
};

/// Softmax cross entropy over the last axis of the output, summed over the other axes.
///
/// Targets are `i64` class numbers shaped like the output without its last axis, which must be
/// held by a single tile. The gradient seed is `softmax(output) - onehot(target)`.
#[derive(Debug)]
pub struct CrossEntropy {
    value: DistributedTensor,
    maxes: DistributedTensor,
    sums: DistributedTensor,
    lse: DistributedTensor,
}

impl CrossEntropy {
    /// Creates a new `CrossEntropy` loss for outputs like `output`.
    ///
    /// Consumes tags for the value and then the temporaries `maxes`, `sums` and `lse`.
    pub fn generate(output: &TensorMoments, tags: TagAllocator) -> Result<(Self, TagAllocator)> {
        let out = output.value();
        let last = last_axis("cross_entropy", out)?;
        if out.layout().grid_shape()[last] != 1 {
            return Err(TileErr::shape(
                "cross_entropy",
                &[1],
                &[out.layout().grid_shape()[last]],
            ));
        }

        let dtype = out.dtype();
        let rows = out.layout().remove_axis(last)?;

        let (value, tags) = DistributedTensor::new(
            TileLayout::single_tile(&[1])?,
            vec![out.owner(0)],
            dtype,
            out.runtime(),
            tags,
        )?;
        let (maxes, tags) = temporary(rows.clone(), out, dtype, tags)?;
        let (sums, tags) = temporary(rows.clone(), out, dtype, tags)?;
        let (lse, tags) = temporary(rows, out, dtype, tags)?;

        Ok((
            Self {
                value,
                maxes,
                sums,
                lse,
            },
            tags,
        ))
    }
}

impl Loss for CrossEntropy {
    fn seed_gradient(&mut self, output: &TensorMoments, target: &DistributedTensor) -> Result<()> {
        let (logits, grad) = (output.value(), output.grad_or_err()?);
        let last = last_axis("cross_entropy", logits)?;

        ops::max_slice(logits, &self.maxes, last)?;
        ops::sumexp_slice(&self.maxes, logits, &self.sums, last)?;

        // sum(logsumexp(logits) - logits[target])
        ops::logsumexp(&self.maxes, &self.sums, &self.lse)?;
        ops::total_sum(1., &self.lse, 1., &self.value)?;
        ops::sum_indexed(-1., target, logits, 1., &self.value)?;

        ops::copy(logits, grad)?;
        ops::softmax_inplace(&self.maxes, &self.sums, 1., grad, last)?;
        ops::subtract_indexed_outputs(1., target, grad)?;

        self.lse.mark_unused()
    }

    fn value(&self) -> Result<f64> {
        read_scalar(&self.value)
    }

    fn clear_value(&self) -> Result<()> {
        ops::clear(&self.value)
    }

    fn unregister(&self) -> Result<()> {
        let results = [
            self.value.unregister(),
            self.maxes.unregister(),
            self.sums.unregister(),
            self.lse.unregister(),
        ];

        results.into_iter().collect()
    }
}
