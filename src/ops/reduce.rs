//! Slice and fiber operations along one axis.
//!
//! A slice tensor has the shape and tiling of the full tensor with the axis removed, a fiber
//! tensor is one dimensional with the shape and tiling of the axis alone. Reductions visit the
//! tiles along the axis one after another, the first contribution applies `beta` and the rest
//! accumulate.

use super::{arg, ensure_distinct, ensure_live, ensure_same_dtype, ensure_same_layout, submit_to};
use crate::{
    error::{Result, TileErr},
    kernel::{AxisDims, reduce as k, typed, typed_mut},
    tensor::{DistributedTensor, FloatElement, float_dispatch},
};

fn ensure_slice(
    op: &'static str,
    full: &DistributedTensor,
    slice: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_live(&[full, slice])?;
    ensure_distinct(op, full, slice)?;
    ensure_same_dtype(full, slice)?;

    let expected = full.layout().remove_axis(axis)?;
    if expected.shape() != slice.shape() {
        return Err(TileErr::shape(op, expected.shape(), slice.shape()));
    }

    if expected.tile_shape() != slice.layout().tile_shape() {
        return Err(TileErr::shape(
            op,
            expected.tile_shape(),
            slice.layout().tile_shape(),
        ));
    }

    Ok(())
}

fn ensure_fiber(
    op: &'static str,
    full: &DistributedTensor,
    fiber: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_live(&[full, fiber])?;
    ensure_distinct(op, full, fiber)?;
    ensure_same_dtype(full, fiber)?;

    let expected = full.layout().fiber(axis)?;
    if expected.shape() != fiber.shape() || expected.tile_shape() != fiber.layout().tile_shape()
    {
        return Err(TileErr::shape(op, expected.shape(), fiber.shape()));
    }

    Ok(())
}

/// Returns the slice tile matching full tile `i`.
fn slice_tile(
    full: &DistributedTensor,
    slice: &DistributedTensor,
    i: usize,
    axis: usize,
) -> usize {
    let mut idx = full.layout().linear_to_multi_index(i);
    idx.remove(axis);
    slice.layout().multi_index_to_linear(&idx)
}

/// Returns the full tiles along `axis` matching slice tile `s`, in axis order.
fn full_tiles(
    full: &DistributedTensor,
    slice: &DistributedTensor,
    s: usize,
    axis: usize,
) -> Vec<usize> {
    let idx = slice.layout().linear_to_multi_index(s);

    (0..full.layout().grid_shape()[axis])
        .map(|t| {
            let mut full_idx = idx.clone();
            full_idx.insert(axis, t);
            full.layout().multi_index_to_linear(&full_idx)
        })
        .collect()
}

/// Groups the full tiles by their position along `axis`.
fn fiber_groups(full: &DistributedTensor, axis: usize) -> Vec<Vec<usize>> {
    let layout = full.layout();
    let mut groups = vec![Vec::new(); layout.grid_shape()[axis]];

    for i in 0..layout.grid_size() {
        groups[layout.linear_to_multi_index(i)[axis]].push(i);
    }

    groups
}

fn dims(full: &DistributedTensor, i: usize, axis: usize) -> AxisDims {
    AxisDims::of(&full.layout().tile_shape_at(i), axis)
}

fn fiber_tile(full: &DistributedTensor, i: usize, axis: usize) -> usize {
    full.layout().linear_to_multi_index(i)[axis]
}

/// `dst := beta * dst + alpha * src` broadcast along `axis`, `src` being a slice of `dst`.
pub fn add_slice(
    alpha: f64,
    src: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_slice("add_slice", dst, src, axis)?;

    float_dispatch!("add_slice", dst.dtype(), T => {
        let (alpha, beta) = (T::of(alpha), T::of(beta));
        for i in 0..dst.grid_size() {
            let s = slice_tile(dst, src, i, axis);
            let d = dims(dst, i, axis);

            submit_to("add_slice", dst, i, vec![arg(src, s)], move |ins, out| {
                k::add_slice(alpha, typed::<T>(ins[0])?, beta, typed_mut::<T>(out)?, d);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := alpha * src * dst` with `src`, a slice of `dst`, broadcast along `axis`.
pub fn prod_slice(
    alpha: f64,
    src: &DistributedTensor,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_slice("prod_slice", dst, src, axis)?;

    float_dispatch!("prod_slice", dst.dtype(), T => {
        let alpha = T::of(alpha);
        for i in 0..dst.grid_size() {
            let s = slice_tile(dst, src, i, axis);
            let d = dims(dst, i, axis);

            submit_to("prod_slice", dst, i, vec![arg(src, s)], move |ins, out| {
                k::prod_slice(alpha, typed::<T>(ins[0])?, typed_mut::<T>(out)?, d);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := beta * dst + alpha * sum(src, axis)`
pub fn sum_slice(
    alpha: f64,
    src: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_slice("sum_slice", src, dst, axis)?;

    float_dispatch!("sum_slice", dst.dtype(), T => {
        for s in 0..dst.grid_size() {
            for (n, i) in full_tiles(src, dst, s, axis).into_iter().enumerate() {
                let (alpha, beta) = (T::of(alpha), T::of(if n == 0 { beta } else { 1. }));
                let d = dims(src, i, axis);

                submit_to("sum_slice", dst, s, vec![arg(src, i)], move |ins, out| {
                    k::sum_slice(alpha, typed::<T>(ins[0])?, beta, typed_mut::<T>(out)?, d);
                    Ok(())
                })?;
            }
        }
        Ok(())
    })
}

/// `dst := beta * dst + alpha * sum(a * b, axis)`
pub fn sumprod_slice(
    alpha: f64,
    a: &DistributedTensor,
    b: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_slice("sumprod_slice", a, dst, axis)?;
    ensure_slice("sumprod_slice", b, dst, axis)?;
    ensure_same_layout("sumprod_slice", a, b)?;

    float_dispatch!("sumprod_slice", dst.dtype(), T => {
        for s in 0..dst.grid_size() {
            for (n, i) in full_tiles(a, dst, s, axis).into_iter().enumerate() {
                let (alpha, beta) = (T::of(alpha), T::of(if n == 0 { beta } else { 1. }));
                let d = dims(a, i, axis);

                let reads = vec![arg(a, i), arg(b, i)];

                submit_to("sumprod_slice", dst, s, reads, move |ins, out| {
                    let (a, b) = (typed::<T>(ins[0])?, typed::<T>(ins[1])?);
                    k::sumprod_slice(alpha, a, b, beta, typed_mut::<T>(out)?, d);
                    Ok(())
                })?;
            }
        }
        Ok(())
    })
}

/// `dst := max(src, axis)`
pub fn max_slice(src: &DistributedTensor, dst: &DistributedTensor, axis: usize) -> Result<()> {
    ensure_slice("max_slice", src, dst, axis)?;

    float_dispatch!("max_slice", dst.dtype(), T => {
        for s in 0..dst.grid_size() {
            for (n, i) in full_tiles(src, dst, s, axis).into_iter().enumerate() {
                let d = dims(src, i, axis);

                submit_to("max_slice", dst, s, vec![arg(src, i)], move |ins, out| {
                    k::max_slice(typed::<T>(ins[0])?, typed_mut::<T>(out)?, d, n == 0);
                    Ok(())
                })?;
            }
        }
        Ok(())
    })
}

/// `dst := sum(exp(src - maxes), axis)`, `maxes` being the result of `max_slice`.
pub fn sumexp_slice(
    maxes: &DistributedTensor,
    src: &DistributedTensor,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_slice("sumexp_slice", src, dst, axis)?;
    ensure_slice("sumexp_slice", src, maxes, axis)?;
    ensure_distinct("sumexp_slice", maxes, dst)?;

    float_dispatch!("sumexp_slice", dst.dtype(), T => {
        for s in 0..dst.grid_size() {
            for (n, i) in full_tiles(src, dst, s, axis).into_iter().enumerate() {
                let beta = T::of(if n == 0 { 0. } else { 1. });
                let d = dims(src, i, axis);

                let reads = vec![arg(maxes, s), arg(src, i)];

                submit_to("sumexp_slice", dst, s, reads, move |ins, out| {
                    let (maxes, src) = (typed::<T>(ins[0])?, typed::<T>(ins[1])?);
                    k::sumexp_slice(maxes, src, beta, typed_mut::<T>(out)?, d);
                    Ok(())
                })?;
            }
        }
        Ok(())
    })
}

/// Turns `dst` into `alpha * softmax(dst, axis)` given its `maxes` and `sums` of exponents.
pub fn softmax_inplace(
    maxes: &DistributedTensor,
    sums: &DistributedTensor,
    alpha: f64,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_slice("softmax_inplace", dst, maxes, axis)?;
    ensure_slice("softmax_inplace", dst, sums, axis)?;

    float_dispatch!("softmax_inplace", dst.dtype(), T => {
        let alpha = T::of(alpha);
        for i in 0..dst.grid_size() {
            let s = slice_tile(dst, maxes, i, axis);
            let d = dims(dst, i, axis);

            let reads = vec![arg(maxes, s), arg(sums, s)];

            submit_to("softmax_inplace", dst, i, reads, move |ins, out| {
                let (maxes, sums) = (typed::<T>(ins[0])?, typed::<T>(ins[1])?);
                k::softmax_inplace(maxes, sums, alpha, typed_mut::<T>(out)?, d);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := maxes + ln(sums)`, elementwise.
pub fn logsumexp(
    maxes: &DistributedTensor,
    sums: &DistributedTensor,
    dst: &DistributedTensor,
) -> Result<()> {
    super::ensure_pair("logsumexp", maxes, dst)?;
    super::ensure_pair("logsumexp", sums, dst)?;

    float_dispatch!("logsumexp", dst.dtype(), T => {
        for i in 0..dst.grid_size() {
            submit_to("logsumexp", dst, i, vec![arg(maxes, i), arg(sums, i)], |ins, out| {
                let (maxes, sums) = (typed::<T>(ins[0])?, typed::<T>(ins[1])?);
                k::logsumexp(maxes, sums, typed_mut::<T>(out)?);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := beta * dst + alpha * src` with the fiber `src` broadcast over every other axis.
pub fn add_fiber(
    alpha: f64,
    src: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_fiber("add_fiber", dst, src, axis)?;

    float_dispatch!("add_fiber", dst.dtype(), T => {
        let (alpha, beta) = (T::of(alpha), T::of(beta));
        for i in 0..dst.grid_size() {
            let f = fiber_tile(dst, i, axis);
            let d = dims(dst, i, axis);

            submit_to("add_fiber", dst, i, vec![arg(src, f)], move |ins, out| {
                k::add_fiber(alpha, typed::<T>(ins[0])?, beta, typed_mut::<T>(out)?, d);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := alpha * src * dst` with the fiber `src` broadcast over every other axis.
pub fn prod_fiber(
    alpha: f64,
    src: &DistributedTensor,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_fiber("prod_fiber", dst, src, axis)?;

    float_dispatch!("prod_fiber", dst.dtype(), T => {
        let alpha = T::of(alpha);
        for i in 0..dst.grid_size() {
            let f = fiber_tile(dst, i, axis);
            let d = dims(dst, i, axis);

            submit_to("prod_fiber", dst, i, vec![arg(src, f)], move |ins, out| {
                k::prod_fiber(alpha, typed::<T>(ins[0])?, typed_mut::<T>(out)?, d);
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `dst := beta * dst + alpha * src` summed over every axis but `axis`.
pub fn sum_fiber(
    alpha: f64,
    src: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_fiber("sum_fiber", src, dst, axis)?;

    float_dispatch!("sum_fiber", dst.dtype(), T => {
        for (f, group) in fiber_groups(src, axis).into_iter().enumerate() {
            for (n, i) in group.into_iter().enumerate() {
                let (alpha, beta) = (T::of(alpha), T::of(if n == 0 { beta } else { 1. }));
                let d = dims(src, i, axis);

                submit_to("sum_fiber", dst, f, vec![arg(src, i)], move |ins, out| {
                    k::sum_fiber(alpha, typed::<T>(ins[0])?, beta, typed_mut::<T>(out)?, d);
                    Ok(())
                })?;
            }
        }
        Ok(())
    })
}

/// `dst := beta * dst + alpha * a * b` summed over every axis but `axis`.
pub fn sumprod_fiber(
    alpha: f64,
    a: &DistributedTensor,
    b: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
    axis: usize,
) -> Result<()> {
    ensure_fiber("sumprod_fiber", a, dst, axis)?;
    ensure_fiber("sumprod_fiber", b, dst, axis)?;
    ensure_same_layout("sumprod_fiber", a, b)?;

    float_dispatch!("sumprod_fiber", dst.dtype(), T => {
        for (f, group) in fiber_groups(a, axis).into_iter().enumerate() {
            for (n, i) in group.into_iter().enumerate() {
                let (alpha, beta) = (T::of(alpha), T::of(if n == 0 { beta } else { 1. }));
                let d = dims(a, i, axis);

                let reads = vec![arg(a, i), arg(b, i)];

                submit_to("sumprod_fiber", dst, f, reads, move |ins, out| {
                    let (a, b) = (typed::<T>(ins[0])?, typed::<T>(ins[1])?);
                    k::sumprod_fiber(alpha, a, b, beta, typed_mut::<T>(out)?, d);
                    Ok(())
                })?;
            }
        }
        Ok(())
    })
}
