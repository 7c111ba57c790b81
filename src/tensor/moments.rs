use log::warn;
use runtime::Runtime;

use super::{DType, DistributedTensor};
use crate::{
    error::{Result, TileErr},
    layout::TileLayout,
    ops,
    tag::TagAllocator,
};

/// A value tensor paired with its gradient.
///
/// The gradient is present exactly when `grad_required` is set, and shares the value's shape,
/// tiling, distribution and element type. Clones are handles to the same tensors.
#[derive(Debug, Clone)]
pub struct TensorMoments {
    value: DistributedTensor,
    grad: Option<DistributedTensor>,
    grad_required: bool,
}

impl TensorMoments {
    /// Creates a new `TensorMoments` from existing tensors.
    ///
    /// # Returns
    /// An error if `grad` doesn't match `grad_required` or `value`.
    pub fn new(
        value: DistributedTensor,
        grad: Option<DistributedTensor>,
        grad_required: bool,
    ) -> Result<Self> {
        match (&grad, grad_required) {
            (None, false) => {}
            (Some(g), true) => {
                if g.same_buffer(&value) {
                    return Err(TileErr::Aliasing("moments"));
                }

                if g.shape() != value.shape() || g.layout() != value.layout() {
                    return Err(TileErr::shape("gradient", value.shape(), g.shape()));
                }

                if g.distribution() != value.distribution() {
                    return Err(TileErr::InvalidDistribution(
                        "the gradient must be distributed like the value".to_string(),
                    ));
                }

                value.ensure_dtype(g.dtype())?;
            }
            (None, true) => return Err(TileErr::MissingGradient(value.tag())),
            (Some(_), false) => {
                return Err(TileErr::InvalidConfig(
                    "a gradient was given but none is required".to_string(),
                ));
            }
        }

        Ok(Self {
            value,
            grad,
            grad_required,
        })
    }

    /// Allocates a zero filled value and, if `grad_required`, a zero filled gradient.
    ///
    /// Consumes one tag for the value and then one for the gradient.
    ///
    /// # Returns
    /// The moments and the advanced allocator. On error nothing stays registered.
    pub fn generate(
        layout: TileLayout,
        distribution: Vec<usize>,
        dtype: DType,
        grad_required: bool,
        runtime: &Runtime,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        let (value, tags) =
            DistributedTensor::new(layout.clone(), distribution.clone(), dtype, runtime, tags)?;

        if !grad_required {
            return Ok((
                Self {
                    value,
                    grad: None,
                    grad_required,
                },
                tags,
            ));
        }

        match DistributedTensor::new(layout, distribution, dtype, runtime, tags) {
            Ok((grad, tags)) => Ok((
                Self {
                    value,
                    grad: Some(grad),
                    grad_required,
                },
                tags,
            )),
            Err(e) => {
                if let Err(e) = value.unregister() {
                    warn!(tag = value.tag(); "couldn't release a half built moments pair: {e}");
                }
                Err(e)
            }
        }
    }

    /// Allocates moments shaped like `self`, see `generate`.
    pub fn like(&self, grad_required: bool, tags: TagAllocator) -> Result<(Self, TagAllocator)> {
        Self::generate(
            self.value.layout().clone(),
            self.value.distribution().to_vec(),
            self.value.dtype(),
            grad_required,
            self.value.runtime(),
            tags,
        )
    }

    pub fn value(&self) -> &DistributedTensor {
        &self.value
    }

    pub fn grad(&self) -> Option<&DistributedTensor> {
        self.grad.as_ref()
    }

    pub fn grad_required(&self) -> bool {
        self.grad_required
    }

    /// Returns the gradient.
    ///
    /// # Returns
    /// `MissingGradient` if these moments carry none.
    pub fn grad_or_err(&self) -> Result<&DistributedTensor> {
        self.grad
            .as_ref()
            .ok_or(TileErr::MissingGradient(self.value.tag()))
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn layout(&self) -> &TileLayout {
        self.value.layout()
    }

    /// Zero fills the gradient, if any.
    pub fn clear_grad(&self) -> Result<()> {
        match &self.grad {
            Some(g) => ops::clear(g),
            None => Ok(()),
        }
    }

    /// Unregisters the value and then the gradient.
    ///
    /// # Returns
    /// The first error met, the gradient is released even if the value fails.
    pub fn unregister(&self) -> Result<()> {
        let value = self.value.unregister();
        let grad = match &self.grad {
            Some(g) => g.unregister(),
            None => Ok(()),
        };

        value.and(grad)
    }
}
