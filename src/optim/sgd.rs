use log::debug;

use super::{Optimizer, SgdParams};
use crate::{
    error::Result,
    ops,
    tag::TagAllocator,
    tensor::{DistributedTensor, TensorMoments},
};

/// Stochastic gradient descent with optional momentum and weight decay.
#[derive(Debug)]
pub struct Sgd {
    params: Vec<TensorMoments>,
    velocities: Vec<DistributedTensor>,
    hp: SgdParams<f64>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// Consumes one tag per parameter for its velocity when `hp.momentum` is not zero.
    ///
    /// # Arguments
    /// * `params` - The parameters to update.
    /// * `hp` - The hyperparameters.
    /// * `tags` - The tag allocator.
    pub fn generate(
        params: Vec<TensorMoments>,
        hp: SgdParams<f64>,
        mut tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        let mut velocities = Vec::new();

        if hp.momentum != 0. {
            for p in &params {
                let v = p.value();
                let (velocity, next) = v.like(v.dtype(), tags)?;
                velocities.push(velocity);
                tags = next;
            }
        }

        Ok((
            Self {
                params,
                velocities,
                hp,
            },
            tags,
        ))
    }
}

impl Optimizer for Sgd {
    fn step(&mut self) -> Result<()> {
        for (i, p) in self.params.iter().enumerate() {
            let velocity = self.velocities.get(i);
            ops::sgd_step(self.hp, p.grad_or_err()?, velocity, p.value())?;
        }

        debug!(params = self.params.len(); "sgd step enqueued");
        Ok(())
    }

    fn parameters(&self) -> &[TensorMoments] {
        &self.params
    }

    fn unregister(&self) -> Result<()> {
        self.velocities.iter().map(|v| v.unregister()).collect()
    }
}
