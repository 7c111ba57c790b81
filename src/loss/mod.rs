//! Loss functions seeding the backward pass.

mod cross_entropy;
mod frob;

pub use cross_entropy::CrossEntropy;
pub use frob::Frob;

use crate::{
    error::Result,
    tensor::{DistributedTensor, TensorMoments, float_dispatch},
};

pub trait Loss: Send {
    /// Enqueues the accumulation of the loss value and overwrites the gradient of `output` with
    /// the derivative of the loss.
    ///
    /// # Arguments
    /// * `output` - The model's output.
    /// * `target` - The expected output.
    fn seed_gradient(&mut self, output: &TensorMoments, target: &DistributedTensor) -> Result<()>;

    /// Returns the value accumulated since the last `clear_value`, blocking until it's computed.
    fn value(&self) -> Result<f64>;

    /// Enqueues resetting the accumulated value to zero.
    fn clear_value(&self) -> Result<()>;

    fn unregister(&self) -> Result<()>;
}

/// Reads a single element float tensor.
fn read_scalar(t: &DistributedTensor) -> Result<f64> {
    float_dispatch!("loss", t.dtype(), T => {
        let values = t.to_array::<T>()?;
        Ok(values.iter().map(|&v| f64::from(v)).sum())
    })
}
