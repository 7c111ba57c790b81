//! Differentiable layers working on distributed moments.
//!
//! A layer holds handles to its input moments, owns its output moments, its parameters and its
//! temporaries. `forward_async` and `backward_async` only enqueue work. Backward passes always add
//! into gradients, clearing them is up to the model.

mod act;
mod add_slice;
mod attention;
mod embedding;
mod layer_norm;
mod linear;

pub use act::{Act, ActKind};
pub use add_slice::AddSlice;
pub use attention::{Attention, AttentionConfig};
pub use embedding::{Embedding, EmbeddingConfig};
pub use layer_norm::{LayerNorm, LayerNormConfig};
pub use linear::{Linear, LinearConfig};

use log::warn;

use crate::{
    error::{Result, TileErr},
    layout::TileLayout,
    tag::TagAllocator,
    tensor::{DType, DistributedTensor, TensorMoments, distribution},
};

/// A named trainable tensor of a layer.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: &'static str,
    pub moments: TensorMoments,
}

impl Parameter {
    pub fn new(name: &'static str, moments: TensorMoments) -> Self {
        Self { name, moments }
    }
}

pub trait Layer: Send {
    /// The name of the variant, used to name parameters.
    fn name(&self) -> &'static str;

    /// The moments this layer produces, in creation order.
    fn outputs(&self) -> Vec<TensorMoments>;

    /// The trainable tensors, in declaration order.
    fn parameters(&self) -> Vec<Parameter>;

    /// The scratch tensors.
    fn temporaries(&self) -> Vec<DistributedTensor>;

    /// Enqueues the computation of the outputs' values.
    fn forward_async(&mut self) -> Result<()>;

    /// Enqueues the accumulation of the input and parameter gradients.
    ///
    /// # Returns
    /// `MissingGradient` if an output carries no gradient.
    fn backward_async(&mut self) -> Result<()>;

    /// Unregisters the parameters and then the temporaries.
    ///
    /// The outputs are left alone, they belong to the model's activations.
    fn unregister(&self) -> Result<()> {
        let mut first = Ok(());

        let params = self.parameters().into_iter().map(|p| p.moments.unregister());
        let temps = self.temporaries().into_iter().map(|t| t.unregister());

        for res in params.chain(temps) {
            if let Err(e) = res {
                warn!(layer = self.name(); "failed to unregister: {e}");
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }

        first
    }
}

/// Places a tensor of `layout` the same way as `like` when their grids agree, or deals its
/// tiles round robin over the nodes otherwise.
pub(crate) fn distribute(layout: &TileLayout, like: &DistributedTensor) -> Vec<usize> {
    if layout.grid_shape() == like.layout().grid_shape() {
        like.distribution().to_vec()
    } else {
        distribution::round_robin(layout, like.runtime().nodes())
    }
}

/// Allocates moments of `layout` placed after `like`.
pub(crate) fn moments(
    layout: TileLayout,
    like: &DistributedTensor,
    dtype: DType,
    grad_required: bool,
    tags: TagAllocator,
) -> Result<(TensorMoments, TagAllocator)> {
    let dist = distribute(&layout, like);
    TensorMoments::generate(layout, dist, dtype, grad_required, like.runtime(), tags)
}

/// Allocates a scratch tensor of `layout` placed after `like`.
pub(crate) fn temporary(
    layout: TileLayout,
    like: &DistributedTensor,
    dtype: DType,
    tags: TagAllocator,
) -> Result<(DistributedTensor, TagAllocator)> {
    let dist = distribute(&layout, like);
    DistributedTensor::new(layout, dist, dtype, like.runtime(), tags)
}

/// Derives the seed of a parameter from the run seed and the parameter's tag.
pub(crate) fn param_seed(seed: u64, t: &DistributedTensor) -> u64 {
    seed ^ t.tag().wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Fails unless `x` holds floats.
pub(crate) fn ensure_float(op: &'static str, x: &DistributedTensor) -> Result<()> {
    if !x.dtype().is_float() {
        return Err(TileErr::UnsupportedDType {
            op,
            dtype: x.dtype(),
        });
    }

    Ok(())
}

/// Returns the index of the last axis of `x`.
pub(crate) fn last_axis(op: &'static str, x: &DistributedTensor) -> Result<usize> {
    x.ndim()
        .checked_sub(1)
        .ok_or_else(|| TileErr::shape(op, &[1], x.shape()))
}

/// Accumulates into the gradient of `x` when it carries one.
pub(crate) fn if_grad<F>(x: &TensorMoments, f: F) -> Result<()>
where
    F: FnOnce(&DistributedTensor) -> Result<()>,
{
    match x.grad() {
        Some(g) => f(g),
        None => Ok(()),
    }
}
