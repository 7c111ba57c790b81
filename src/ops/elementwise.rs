use runtime::KernelFault;

use super::{arg, ensure_live, ensure_pair, ensure_same_layout, ensure_scalar, submit, submit_to};
use crate::{
    error::{Result, TileErr},
    kernel::{
        axpby,
        elementwise::{self as k, AdamParams, SgdParams},
        typed, typed_mut,
    },
    tensor::{DType, DistributedTensor, FloatElement, TileData, any_dispatch, float_dispatch},
};

/// `dst := src`, for any element type.
pub fn copy(src: &DistributedTensor, dst: &DistributedTensor) -> Result<()> {
    ensure_pair("copy", src, dst)?;

    any_dispatch!(dst.dtype(), T => {
        for i in 0..dst.grid_size() {
            submit_to("copy", dst, i, vec![arg(src, i)], |ins, out| {
                k::copy(typed::<T>(ins[0])?, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := val`
pub fn fill(val: f64, dst: &DistributedTensor) -> Result<()> {
    dst.ensure_live()?;

    float_dispatch!("fill", dst.dtype(), T => {
        let val = T::of(val);
        for i in 0..dst.grid_size() {
            submit_to("fill", dst, i, vec![], move |_, out| {
                k::fill(val, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// Zeroes `dst`, for any element type.
pub fn clear(dst: &DistributedTensor) -> Result<()> {
    dst.ensure_live()?;

    let dtype = dst.dtype();
    for i in 0..dst.grid_size() {
        let len = dst.layout().tile_nelems(i);
        submit_to("clear", dst, i, vec![], move |_, out| {
            *out = TileData::zeros(dtype, len);
            Ok(())
        })?;
    }

    Ok(())
}

/// `dst := alpha * src + beta * dst`
pub fn add(alpha: f64, src: &DistributedTensor, beta: f64, dst: &DistributedTensor) -> Result<()> {
    ensure_pair("add", src, dst)?;

    float_dispatch!("add", dst.dtype(), T => {
        let (alpha, beta) = (T::of(alpha), T::of(beta));
        for i in 0..dst.grid_size() {
            submit_to("add", dst, i, vec![arg(src, i)], move |ins, out| {
                k::add(alpha, typed::<T>(ins[0])?, beta, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := alpha * dst`
pub fn scal(alpha: f64, dst: &DistributedTensor) -> Result<()> {
    dst.ensure_live()?;

    float_dispatch!("scal", dst.dtype(), T => {
        let alpha = T::of(alpha);
        for i in 0..dst.grid_size() {
            submit_to("scal", dst, i, vec![], move |_, out| {
                k::scal(alpha, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := src * dst`, elementwise.
pub fn prod(src: &DistributedTensor, dst: &DistributedTensor) -> Result<()> {
    ensure_pair("prod", src, dst)?;

    float_dispatch!("prod", dst.dtype(), T => {
        for i in 0..dst.grid_size() {
            submit_to("prod", dst, i, vec![arg(src, i)], |ins, out| {
                k::prod(typed::<T>(ins[0])?, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := 1 / sqrt(src + eps)`
pub fn inv_sqrt(eps: f64, src: &DistributedTensor, dst: &DistributedTensor) -> Result<()> {
    ensure_pair("inv_sqrt", src, dst)?;

    float_dispatch!("inv_sqrt", dst.dtype(), T => {
        let eps = T::of(eps);
        for i in 0..dst.grid_size() {
            submit_to("inv_sqrt", dst, i, vec![arg(src, i)], move |ins, out| {
                k::inv_sqrt(eps, typed::<T>(ins[0])?, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

fn unary<F>(
    name: &'static str,
    src: &DistributedTensor,
    dst: &DistributedTensor,
    f: F,
) -> Result<()>
where
    F: Fn(DType, usize) -> Result<()>,
{
    ensure_pair(name, src, dst)?;
    (0..dst.grid_size()).try_for_each(|i| f(dst.dtype(), i))
}

/// `dst := max(src, 0)`
pub fn relu(src: &DistributedTensor, dst: &DistributedTensor) -> Result<()> {
    unary("relu", src, dst, |dtype, i| {
        float_dispatch!("relu", dtype, T => {
            submit_to("relu", dst, i, vec![arg(src, i)], |ins, out| {
                k::relu(typed::<T>(ins[0])?, typed_mut::<T>(out)?);
                Ok(())
            })
        })
    })
}

/// `dst := gelu(src)` with the tanh approximation.
pub fn gelutanh(src: &DistributedTensor, dst: &DistributedTensor) -> Result<()> {
    unary("gelutanh", src, dst, |dtype, i| {
        float_dispatch!("gelutanh", dtype, T => {
            submit_to("gelutanh", dst, i, vec![arg(src, i)], |ins, out| {
                k::gelutanh(typed::<T>(ins[0])?, typed_mut::<T>(out)?);
                Ok(())
            })
        })
    })
}

fn activation_backward(
    name: &'static str,
    x: &DistributedTensor,
    dy: &DistributedTensor,
    dx: &DistributedTensor,
    relu: bool,
) -> Result<()> {
    ensure_pair(name, dy, dx)?;
    ensure_pair(name, x, dx)?;

    float_dispatch!(name, dx.dtype(), T => {
        for i in 0..dx.grid_size() {
            submit_to(name, dx, i, vec![arg(x, i), arg(dy, i)], move |ins, out| {
                let (x, dy) = (typed::<T>(ins[0])?, typed::<T>(ins[1])?);
                if relu {
                    k::relu_backward(x, dy, typed_mut::<T>(out)?);
                } else {
                    k::gelutanh_backward(x, dy, typed_mut::<T>(out)?);
                }
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dx += dy * relu'(x)`
pub fn relu_backward(
    x: &DistributedTensor,
    dy: &DistributedTensor,
    dx: &DistributedTensor,
) -> Result<()> {
    activation_backward("relu_backward", x, dy, dx, true)
}

/// `dx += dy * gelutanh'(x)`
pub fn gelutanh_backward(
    x: &DistributedTensor,
    dy: &DistributedTensor,
    dx: &DistributedTensor,
) -> Result<()> {
    activation_backward("gelutanh_backward", x, dy, dx, false)
}

/// Sets `dst` to `val` wherever `mask` is false.
///
/// `mask` is a bool tensor matching the trailing axes of `dst` (shape and tiling), it repeats
/// over the leading ones.
pub fn mask_scalar(mask: &DistributedTensor, val: f64, dst: &DistributedTensor) -> Result<()> {
    ensure_live(&[mask, dst])?;
    mask.ensure_dtype(DType::Bool)?;

    let lead = dst
        .ndim()
        .checked_sub(mask.ndim())
        .ok_or_else(|| TileErr::shape("mask_scalar", dst.shape(), mask.shape()))?;

    let dst_layout = dst.layout();
    if &dst.shape()[lead..] != mask.shape()
        || &dst_layout.tile_shape()[lead..] != mask.layout().tile_shape()
    {
        return Err(TileErr::shape("mask_scalar", &dst.shape()[lead..], mask.shape()));
    }

    float_dispatch!("mask_scalar", dst.dtype(), T => {
        let val = T::of(val);
        for i in 0..dst.grid_size() {
            let idx = dst_layout.linear_to_multi_index(i);
            let m = mask.layout().multi_index_to_linear(&idx[lead..]);

            submit_to("mask_scalar", dst, i, vec![arg(mask, m)], move |ins, out| {
                k::mask_scalar(typed::<bool>(ins[0])?, val, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := beta * dst + alpha * sum(x * y)`, `dst` being a single element tensor.
///
/// `x` and `y` may be the same tensor.
pub fn dot(
    alpha: f64,
    x: &DistributedTensor,
    y: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
) -> Result<()> {
    ensure_live(&[x, y, dst])?;
    ensure_same_layout("dot", x, y)?;
    ensure_scalar("dot", dst)?;
    x.ensure_dtype(y.dtype())?;
    dst.ensure_dtype(x.dtype())?;

    float_dispatch!("dot", dst.dtype(), T => {
        for i in 0..x.grid_size() {
            let b = T::of(if i == 0 { beta } else { 1. });
            let a = T::of(alpha);

            submit_to("dot", dst, 0, vec![arg(x, i), arg(y, i)], move |ins, out| {
                let s = k::dot(typed::<T>(ins[0])?, typed::<T>(ins[1])?);
                let d = &mut typed_mut::<T>(out)?[0];
                *d = axpby(a, s, b, *d);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := beta * dst + alpha * sum(src)`, `dst` being a single element tensor.
pub fn total_sum(
    alpha: f64,
    src: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
) -> Result<()> {
    ensure_live(&[src, dst])?;
    ensure_scalar("total_sum", dst)?;
    dst.ensure_dtype(src.dtype())?;

    float_dispatch!("total_sum", dst.dtype(), T => {
        for i in 0..src.grid_size() {
            let b = T::of(if i == 0 { beta } else { 1. });
            let a = T::of(alpha);

            submit_to("total_sum", dst, 0, vec![arg(src, i)], move |ins, out| {
                let s: T = typed::<T>(ins[0])?.iter().copied().sum();
                let d = &mut typed_mut::<T>(out)?[0];
                *d = axpby(a, s, b, *d);
                Ok(())
            })?;
        }
        Ok(())
    })
}

fn ensure_state(
    op: &'static str,
    param: &DistributedTensor,
    state: &DistributedTensor,
) -> Result<()> {
    ensure_pair(op, state, param)
}

/// Applies one SGD step to `param`, reading `grad` and updating `velocity` when given.
pub fn sgd_step(
    hp: SgdParams<f64>,
    grad: &DistributedTensor,
    velocity: Option<&DistributedTensor>,
    param: &DistributedTensor,
) -> Result<()> {
    ensure_pair("sgd_step", grad, param)?;
    if let Some(v) = velocity {
        ensure_state("sgd_step", param, v)?;
        ensure_state("sgd_step", grad, v)?;
    }

    float_dispatch!("sgd_step", param.dtype(), T => {
        let hp = SgdParams {
            lr: T::of(hp.lr),
            momentum: T::of(hp.momentum),
            weight_decay: T::of(hp.weight_decay),
        };

        for i in 0..param.grid_size() {
            let mut writes = vec![arg(param, i)];
            writes.extend(velocity.map(|v| arg(v, i)));

            let reads = vec![arg(grad, i)];

            submit("sgd_step", param, param.owner(i), reads, writes, move |ins, outs| {
                let grad = typed::<T>(ins[0])?;
                let (p, rest) = outs.split_at_mut(1);
                let velocity = match rest.first_mut() {
                    Some(v) => Some(typed_mut::<T>(v)?),
                    None => None,
                };
                k::sgd_step(hp, grad, velocity, typed_mut::<T>(p[0])?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// Applies one Adam step to `param`, reading `grad` and updating both moment estimates.
///
/// # Arguments
/// * `step` - The 1-based step number.
pub fn adam_step(
    step: i32,
    hp: AdamParams<f64>,
    grad: &DistributedTensor,
    m: &DistributedTensor,
    v: &DistributedTensor,
    param: &DistributedTensor,
) -> Result<()> {
    ensure_pair("adam_step", grad, param)?;
    ensure_state("adam_step", param, m)?;
    ensure_state("adam_step", param, v)?;
    ensure_state("adam_step", m, v)?;

    float_dispatch!("adam_step", param.dtype(), T => {
        let hp = AdamParams {
            lr: T::of(hp.lr),
            beta1: T::of(hp.beta1),
            beta2: T::of(hp.beta2),
            eps: T::of(hp.eps),
            weight_decay: T::of(hp.weight_decay),
        };

        for i in 0..param.grid_size() {
            let writes = vec![arg(m, i), arg(v, i), arg(param, i)];

            let reads = vec![arg(grad, i)];

            submit("adam_step", param, param.owner(i), reads, writes, move |ins, outs| {
                let grad = typed::<T>(ins[0])?;
                let [m, v, p] = outs else {
                    return Err(KernelFault::new("adam_step expects three outputs"));
                };
                let (m, v, p) = (typed_mut::<T>(m)?, typed_mut::<T>(v)?, typed_mut::<T>(p)?);
                k::adam_step(step, hp, grad, m, v, p);
                Ok(())
            })?;
        }
        Ok(())
    })
}
