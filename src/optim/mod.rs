//! Optimizers applying accumulated gradients to parameters.

mod adam;
mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

pub use crate::kernel::elementwise::{AdamParams, SgdParams};

use crate::{error::Result, tensor::TensorMoments};

/// Defines the strategy for updating model parameters based on accumulated gradients.
pub trait Optimizer: Send {
    /// Enqueues one update of every parameter from its gradient.
    ///
    /// # Returns
    /// `MissingGradient` if a parameter carries no gradient.
    fn step(&mut self) -> Result<()>;

    /// The parameters being optimized.
    fn parameters(&self) -> &[TensorMoments];

    /// Unregisters the optimizer's own state, leaving the parameters alone.
    fn unregister(&self) -> Result<()>;
}
