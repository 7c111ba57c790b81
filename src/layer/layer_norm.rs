use log::debug;

use super::{Layer, Parameter, ensure_float, moments, temporary};
use crate::{
    error::Result,
    ops,
    tag::TagAllocator,
    tensor::{DistributedTensor, TensorMoments},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerNormConfig {
    /// The axis normalized over.
    pub axis: usize,
    pub eps: f64,
}

/// Normalizes `x` along an axis to zero mean and unit variance, then scales by `gamma` and
/// shifts by `beta`, both fibers of that axis.
#[derive(Debug)]
pub struct LayerNorm {
    x: TensorMoments,
    y: TensorMoments,
    gamma: TensorMoments,
    beta: TensorMoments,
    config: LayerNormConfig,

    // Slices of `x`
    mean: DistributedTensor,
    var: DistributedTensor,
    inv_std: DistributedTensor,

    // Shaped like `x`
    xhat: DistributedTensor,
    dxhat: DistributedTensor,
    scratch: DistributedTensor,
}

impl LayerNorm {
    /// Creates a new `LayerNorm` layer.
    ///
    /// Consumes tags for the output value and gradient, `gamma` and its gradient, `beta` and its
    /// gradient, then the temporaries `mean`, `var`, `inv_std`, `xhat`, `dxhat` and `scratch`.
    /// `gamma` starts at one and `beta` at zero.
    pub fn generate_simple(
        x: &TensorMoments,
        config: LayerNormConfig,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        let xv = x.value();
        ensure_float("layer_norm", xv)?;
        let dtype = xv.dtype();

        let full = xv.layout();
        let slice = full.remove_axis(config.axis)?;
        let fiber = full.fiber(config.axis)?;

        let (y, tags) = moments(full.clone(), xv, dtype, true, tags)?;
        let (gamma, tags) = moments(fiber.clone(), xv, dtype, true, tags)?;
        let (beta, tags) = moments(fiber, xv, dtype, true, tags)?;

        let (mean, tags) = temporary(slice.clone(), xv, dtype, tags)?;
        let (var, tags) = temporary(slice.clone(), xv, dtype, tags)?;
        let (inv_std, tags) = temporary(slice, xv, dtype, tags)?;
        let (xhat, tags) = temporary(full.clone(), xv, dtype, tags)?;
        let (dxhat, tags) = temporary(full.clone(), xv, dtype, tags)?;
        let (scratch, tags) = temporary(full.clone(), xv, dtype, tags)?;

        ops::fill(1., gamma.value())?;

        Ok((
            Self {
                x: x.clone(),
                y,
                gamma,
                beta,
                config,
                mean,
                var,
                inv_std,
                xhat,
                dxhat,
                scratch,
            },
            tags,
        ))
    }

    pub fn output(&self) -> &TensorMoments {
        &self.y
    }

    pub fn gamma(&self) -> &TensorMoments {
        &self.gamma
    }

    pub fn beta(&self) -> &TensorMoments {
        &self.beta
    }

    fn inv_len(&self) -> f64 {
        (self.x.shape()[self.config.axis] as f64).recip()
    }
}

impl Layer for LayerNorm {
    fn name(&self) -> &'static str {
        "layer_norm"
    }

    fn outputs(&self) -> Vec<TensorMoments> {
        vec![self.y.clone()]
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::new("gamma", self.gamma.clone()),
            Parameter::new("beta", self.beta.clone()),
        ]
    }

    fn temporaries(&self) -> Vec<DistributedTensor> {
        vec![
            self.mean.clone(),
            self.var.clone(),
            self.inv_std.clone(),
            self.xhat.clone(),
            self.dxhat.clone(),
            self.scratch.clone(),
        ]
    }

    fn forward_async(&mut self) -> Result<()> {
        let axis = self.config.axis;
        let inv_len = self.inv_len();
        let (x, y, xhat) = (self.x.value(), self.y.value(), &self.xhat);

        ops::sum_slice(inv_len, x, 0., &self.mean, axis)?;
        ops::copy(x, xhat)?;
        ops::add_slice(-1., &self.mean, 1., xhat, axis)?;
        ops::sumprod_slice(inv_len, xhat, xhat, 0., &self.var, axis)?;
        ops::inv_sqrt(self.config.eps, &self.var, &self.inv_std)?;
        ops::prod_slice(1., &self.inv_std, xhat, axis)?;

        ops::copy(xhat, y)?;
        ops::prod_fiber(1., self.gamma.value(), y, axis)?;
        ops::add_fiber(1., self.beta.value(), 1., y, axis)?;

        self.mean.mark_unused()?;
        self.var.mark_unused()?;

        debug!(tag = y.tag(), axis = axis; "layer_norm forward enqueued");
        Ok(())
    }

    fn backward_async(&mut self) -> Result<()> {
        let axis = self.config.axis;
        let inv_len = self.inv_len();
        let dy = self.y.grad_or_err()?;
        let (xhat, dxhat, scratch) = (&self.xhat, &self.dxhat, &self.scratch);

        ops::sum_fiber(1., dy, 1., self.beta.grad_or_err()?, axis)?;
        ops::sumprod_fiber(1., dy, xhat, 1., self.gamma.grad_or_err()?, axis)?;

        let Some(dx) = self.x.grad() else {
            return Ok(());
        };

        // dx += inv_std * (dxhat - mean(dxhat) - xhat * mean(dxhat * xhat))
        ops::copy(dy, dxhat)?;
        ops::prod_fiber(1., self.gamma.value(), dxhat, axis)?;

        let (s1, s2) = (&self.mean, &self.var);
        ops::sum_slice(inv_len, dxhat, 0., s1, axis)?;
        ops::sumprod_slice(inv_len, dxhat, xhat, 0., s2, axis)?;

        ops::add_slice(-1., s1, 1., dxhat, axis)?;
        ops::copy(xhat, scratch)?;
        ops::prod_slice(1., s2, scratch, axis)?;
        ops::add(-1., scratch, 1., dxhat)?;
        ops::prod_slice(1., &self.inv_std, dxhat, axis)?;
        ops::add(1., dxhat, 1., dx)?;

        dxhat.mark_unused()?;
        scratch.mark_unused()?;

        debug!(tag = dy.tag(), axis = axis; "layer_norm backward enqueued");
        Ok(())
    }
}
