use log::debug;

use super::{AdamParams, Optimizer};
use crate::{
    error::Result,
    ops,
    tag::TagAllocator,
    tensor::{DistributedTensor, TensorMoments},
};

/// Adam with decoupled weight decay.
#[derive(Debug)]
pub struct Adam {
    params: Vec<TensorMoments>,
    // First and second moment estimates, one pair per parameter
    moments: Vec<(DistributedTensor, DistributedTensor)>,
    hp: AdamParams<f64>,
    steps: i32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// Consumes two tags per parameter, for its first and then its second moment estimate.
    ///
    /// # Arguments
    /// * `params` - The parameters to update.
    /// * `hp` - The hyperparameters.
    /// * `tags` - The tag allocator.
    pub fn generate(
        params: Vec<TensorMoments>,
        hp: AdamParams<f64>,
        mut tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        let mut moments = Vec::with_capacity(params.len());

        for p in &params {
            let v = p.value();
            let (first, next) = v.like(v.dtype(), tags)?;
            let (second, next) = v.like(v.dtype(), next)?;
            moments.push((first, second));
            tags = next;
        }

        Ok((
            Self {
                params,
                moments,
                hp,
                steps: 0,
            },
            tags,
        ))
    }

    /// The amount of steps taken so far.
    pub fn steps(&self) -> i32 {
        self.steps
    }
}

impl Optimizer for Adam {
    fn step(&mut self) -> Result<()> {
        let step = self.steps.saturating_add(1);

        for (p, (m, v)) in self.params.iter().zip(&self.moments) {
            ops::adam_step(step, self.hp, p.grad_or_err()?, m, v, p.value())?;
        }

        self.steps = step;
        debug!(step = step; "adam step enqueued");
        Ok(())
    }

    fn parameters(&self) -> &[TensorMoments] {
        &self.params
    }

    fn unregister(&self) -> Result<()> {
        self.moments
            .iter()
            .flat_map(|(m, v)| [m.unregister(), v.unregister()])
            .collect()
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
    fn first_step_moves_by_the_learning_rate() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let layout = TileLayout::compute(&[3], &[2]).unwrap();
        let dist = distribution::single_node(&layout, 0);
        let (p, tags) =
            TensorMoments::generate(layout, dist, DType::F64, true, &rt, TagAllocator::new())
                .unwrap();

        let hp = AdamParams {
            lr: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 0.,
            weight_decay: 0.,
        };
        let (mut adam, tags) = Adam::generate(vec![p.clone()], hp, tags).unwrap();
        assert_eq!(tags.peek(), 4);

        p.grad().unwrap().load(array![2., -3., 0.5].into_dyn().view()).unwrap();
        adam.step().unwrap();

        let values = p.value().to_array::<f64>().unwrap();
        for (v, expected) in values.iter().zip([-0.1, 0.1, -0.1]) {
            assert!((v - expected).abs() < 1e-12);
        }
        assert_eq!(adam.steps(), 1);
    }
}
