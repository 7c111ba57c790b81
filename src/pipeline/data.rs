use log::warn;
use ndarray::{ArrayViewD, Axis, Slice};
use runtime::Runtime;

use crate::{
    error::{Result, TileErr},
    layout::TileLayout,
    tag::TagAllocator,
    tensor::{DistributedTensor, Element},
};

/// Where the tensors of one minibatch live.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub layout: TileLayout,
    pub distribution: Vec<usize>,
}

impl Placement {
    pub fn new(layout: TileLayout, distribution: Vec<usize>) -> Self {
        Self {
            layout,
            distribution,
        }
    }

    /// Places tensors like `t`.
    pub fn of(t: &DistributedTensor) -> Self {
        Self::new(t.layout().clone(), t.distribution().to_vec())
    }
}

/// The input and target of one forward and backward pass.
#[derive(Debug, Clone)]
pub struct Minibatch {
    pub input: DistributedTensor,
    pub target: DistributedTensor,
}

/// A dataset split into batches of minibatches, already loaded into distributed tensors.
#[derive(Debug)]
pub struct Batches {
    batches: Vec<Vec<Minibatch>>,
}

impl Batches {
    /// Splits host samples along their first axis.
    ///
    /// Consumes two tags per minibatch, for its input and then its target.
    ///
    /// # Arguments
    /// * `x`, `y` - The inputs and targets, with one sample per entry of the first axis.
    /// * `batch` - The samples per optimizer step.
    /// * `minibatch` - The samples per forward and backward pass.
    /// * `input`, `target` - The placement of one minibatch's input and target, their first axis
    ///   spanning `minibatch` samples.
    /// * `runtime` - The runtime the tensors are registered in.
    /// * `tags` - The tag allocator.
    ///
    /// # Returns
    /// `InvalidConfig` when `batch` isn't a positive multiple of `minibatch` or the samples don't
    /// fill whole batches, `ShapeMismatch` when the samples don't fit the placements.
    #[allow(clippy::too_many_arguments)]
    pub fn from_host<X: Element, Y: Element>(
        x: ArrayViewD<'_, X>,
        y: ArrayViewD<'_, Y>,
        batch: usize,
        minibatch: usize,
        input: &Placement,
        target: &Placement,
        runtime: &Runtime,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        if minibatch == 0 || batch == 0 || batch % minibatch != 0 {
            return Err(TileErr::InvalidConfig(format!(
                "a batch of {batch} can't be split into minibatches of {minibatch}"
            )));
        }

        let samples = x.shape().first().copied().unwrap_or_default();
        if y.shape().first() != Some(&samples) {
            return Err(TileErr::shape("targets", &[samples], &y.shape()[..1.min(y.ndim())]));
        }

        if samples == 0 || samples % batch != 0 {
            return Err(TileErr::InvalidConfig(format!(
                "{samples} samples don't fill whole batches of {batch}"
            )));
        }

        ensure_fits("inputs", &x.shape()[1..], minibatch, &input.layout)?;
        ensure_fits("targets", &y.shape()[1..], minibatch, &target.layout)?;

        let mut created: Vec<DistributedTensor> = Vec::new();
        let result = Self::load(
            x,
            y,
            (batch, minibatch),
            (input, target),
            runtime,
            tags,
            &mut created,
        );

        if result.is_err() {
            // the loads already enqueued still reference the tiles
            if let Err(e) = runtime.wait_for_all() {
                warn!("a pending load failed while rolling back: {e}");
            }

            for t in &created {
                if let Err(e) = t.unregister() {
                    warn!(tag = t.tag(); "couldn't release a minibatch tensor: {e}");
                }
            }
        }

        result
    }

    fn load<X: Element, Y: Element>(
        x: ArrayViewD<'_, X>,
        y: ArrayViewD<'_, Y>,
        (batch, minibatch): (usize, usize),
        (input, target): (&Placement, &Placement),
        runtime: &Runtime,
        mut tags: TagAllocator,
        created: &mut Vec<DistributedTensor>,
    ) -> Result<(Self, TagAllocator)> {
        let samples = x.shape()[0];
        let mut batches = Vec::with_capacity(samples / batch);

        for start in (0..samples).step_by(batch) {
            let mut minibatches = Vec::with_capacity(batch / minibatch);

            for mb in (start..start + batch).step_by(minibatch) {
                let rows = Slice::from(mb..mb + minibatch);

                let (input_t, next) = DistributedTensor::new(
                    input.layout.clone(),
                    input.distribution.clone(),
                    X::DTYPE,
                    runtime,
                    tags,
                )?;
                created.push(input_t.clone());

                let (target_t, next) = DistributedTensor::new(
                    target.layout.clone(),
                    target.distribution.clone(),
                    Y::DTYPE,
                    runtime,
                    next,
                )?;
                created.push(target_t.clone());
                tags = next;

                input_t.load(x.slice_axis(Axis(0), rows))?;
                target_t.load(y.slice_axis(Axis(0), rows))?;

                minibatches.push(Minibatch {
                    input: input_t,
                    target: target_t,
                });
            }

            batches.push(minibatches);
        }

        Ok((Self { batches }, tags))
    }

    pub fn batches(&self) -> &[Vec<Minibatch>] {
        &self.batches
    }

    /// The amount of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Unregisters every input and target.
    pub fn unregister(&self) -> Result<()> {
        self.batches
            .iter()
            .flatten()
            .flat_map(|mb| [mb.input.unregister(), mb.target.unregister()])
            .collect()
    }
}

fn ensure_fits(
    what: &'static str,
    sample: &[usize],
    minibatch: usize,
    layout: &TileLayout,
) -> Result<()> {
    let expected: Vec<_> = [minibatch].into_iter().chain(sample.iter().copied()).collect();
    if layout.shape() != expected {
        return Err(TileErr::shape(what, layout.shape(), &expected));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};
    use runtime::{BufferKey, RuntimeConfig};

    use super::*;
    use crate::tensor::{DType, distribution};

    fn placement(shape: &[usize]) -> Placement {
        let layout = TileLayout::compute(shape, shape).unwrap();
        let dist = distribution::single_node(&layout, 0);
        Placement::new(layout, dist)
    }

    #[test]
    fn splits_samples_into_batches_of_minibatches() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let x = ArrayD::from_shape_fn(IxDyn(&[8, 3]), |i| (i[0] * 3 + i[1]) as f32);
        let y = ArrayD::from_shape_fn(IxDyn(&[8, 1]), |i| i[0] as f32);

        let (batches, tags) = Batches::from_host(
            x.view(),
            y.view(),
            4,
            2,
            &placement(&[2, 3]),
            &placement(&[2, 1]),
            &rt,
            TagAllocator::new(),
        )
        .unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches.batches()[0].len(), 2);
        assert_eq!(tags.peek(), 8);

        let last = &batches.batches()[1][1];
        let targets = last.target.to_array::<f32>().unwrap();
        assert_eq!(targets.as_slice().unwrap(), [6., 7.]);
    }

    #[test]
    fn rejects_uneven_splits() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let x = ArrayD::<f32>::zeros(IxDyn(&[6, 3]));
        let y = ArrayD::<f32>::zeros(IxDyn(&[6, 1]));
        let (input, target) = (placement(&[2, 3]), placement(&[2, 1]));

        let split = |batch, minibatch| {
            Batches::from_host(
                x.view(),
                y.view(),
                batch,
                minibatch,
                &input,
                &target,
                &rt,
                TagAllocator::new(),
            )
        };

        assert!(matches!(split(3, 2), Err(TileErr::InvalidConfig(_))));
        assert!(matches!(split(4, 2), Err(TileErr::InvalidConfig(_))));
        assert!(split(6, 2).is_ok());
    }

    #[test]
    fn a_failed_split_releases_every_loaded_minibatch() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let x = ArrayD::from_shape_fn(IxDyn(&[8, 3]), |i| (i[0] + i[1]) as f32);
        let y = ArrayD::<f32>::zeros(IxDyn(&[8, 1]));
        let (input, target) = (placement(&[2, 3]), placement(&[2, 1]));

        // tag 5 is taken, so the third minibatch's target can't be created
        let taken = placement(&[1]);
        let (_blocker, _) = DistributedTensor::new(
            taken.layout,
            taken.distribution,
            DType::F32,
            &rt,
            TagAllocator::starting_at(5),
        )
        .unwrap();

        let res = Batches::from_host(
            x.view(),
            y.view(),
            4,
            2,
            &input,
            &target,
            &rt,
            TagAllocator::new(),
        );
        assert!(matches!(res, Err(TileErr::IdentifierCollision(_))));

        for tag in 0..5 {
            assert!(!rt.is_registered(BufferKey::new(tag, 0)));
        }
        assert!(rt.is_registered(BufferKey::new(5, 0)));
        rt.wait_for_all().unwrap();
    }
}
