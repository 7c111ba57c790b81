use super::{arg, ensure_distinct, ensure_live, ensure_scalar, submit_to};
use crate::{
    error::{Result, TileErr},
    kernel::{axpby, index as k, typed, typed_mut},
    tensor::{DType, DistributedTensor, FloatElement, float_dispatch},
};

/// Fails unless `index` is an `i64` tensor laid out like `dst` without its last axis.
fn ensure_index(
    op: &'static str,
    index: &DistributedTensor,
    dst: &DistributedTensor,
) -> Result<()> {
    ensure_live(&[index, dst])?;
    index.ensure_dtype(DType::I64)?;

    let last = dst
        .ndim()
        .checked_sub(1)
        .ok_or(TileErr::InvalidAxis { axis: 0, ndim: 0 })?;
    let expected = dst.layout().remove_axis(last)?;

    if expected.shape() != index.shape()
        || expected.tile_shape() != index.layout().tile_shape()
    {
        return Err(TileErr::shape(op, expected.shape(), index.shape()));
    }

    Ok(())
}

/// Fails unless the last axis of `t` is held by a single tile.
fn ensure_whole_last_axis(op: &'static str, t: &DistributedTensor) -> Result<()> {
    let grid = t.layout().grid_shape();
    match grid.last() {
        Some(1) => Ok(()),
        _ => Err(TileErr::shape(op, &[1], grid)),
    }
}

/// The tile of `index` matching tile `i` of `dst`.
fn index_tile(index: &DistributedTensor, dst: &DistributedTensor, i: usize) -> usize {
    let mut idx = dst.layout().linear_to_multi_index(i);
    idx.pop();
    index.layout().multi_index_to_linear(&idx)
}

/// Fails unless `vocab` is `[V, E]` whole along `V`, with `E` tiled like the last axis of `dst`.
fn ensure_vocab(
    op: &'static str,
    vocab: &DistributedTensor,
    dst: &DistributedTensor,
) -> Result<()> {
    ensure_distinct(op, vocab, dst)?;
    vocab.ensure_dtype(dst.dtype())?;

    if vocab.ndim() != 2 || vocab.layout().grid_shape()[0] != 1 {
        return Err(TileErr::shape(op, &[1, 0], vocab.layout().grid_shape()));
    }

    let last = dst.ndim() - 1;
    let (width, tile) = (vocab.shape()[1], vocab.layout().tile_shape()[1]);
    if width != dst.shape()[last] || tile != dst.layout().tile_shape()[last] {
        let got = [dst.shape()[last], dst.layout().tile_shape()[last]];
        return Err(TileErr::shape(op, &[width, tile], &got));
    }

    Ok(())
}

/// The tile of `vocab` matching tile `i` of `dst`.
fn vocab_tile(dst: &DistributedTensor, i: usize) -> usize {
    dst.layout()
        .linear_to_multi_index(i)
        .last()
        .copied()
        .unwrap_or_default()
}

/// `dst[b.., :] := vocab[index[b..], :]`
///
/// # Arguments
/// * `index` - The `i64` row numbers, laid out like `dst` without its last axis.
/// * `vocab` - The `[V, E]` table, whole along `V`.
/// * `dst` - The `[B.., E]` output.
///
/// # Returns
/// An error on a malformed operand. Out of range rows surface as a kernel fault.
pub fn embedding(
    index: &DistributedTensor,
    vocab: &DistributedTensor,
    dst: &DistributedTensor,
) -> Result<()> {
    ensure_index("embedding", index, dst)?;
    ensure_live(&[vocab])?;
    ensure_vocab("embedding", vocab, dst)?;

    let rows = vocab.shape()[0];
    let last = dst.ndim() - 1;

    float_dispatch!("embedding", dst.dtype(), T => {
        for i in 0..dst.grid_size() {
            let width = dst.layout().tile_shape_at(i)[last];
            let reads = vec![
                arg(index, index_tile(index, dst, i)),
                arg(vocab, vocab_tile(dst, i)),
            ];

            submit_to("embedding", dst, i, reads, move |ins, out| {
                let (index, vocab) = (typed::<i64>(ins[0])?, typed::<T>(ins[1])?);
                k::embedding(index, vocab, typed_mut::<T>(out)?, rows, width)
            })?;
        }
        Ok(())
    })
}

/// `vocab_grad[index[b..], :] += dst_grad[b.., :]`
pub fn embedding_backward(
    index: &DistributedTensor,
    dst_grad: &DistributedTensor,
    vocab_grad: &DistributedTensor,
) -> Result<()> {
    ensure_index("embedding_backward", index, dst_grad)?;
    ensure_live(&[vocab_grad])?;
    ensure_vocab("embedding_backward", vocab_grad, dst_grad)?;

    let rows = vocab_grad.shape()[0];
    let last = dst_grad.ndim() - 1;

    float_dispatch!("embedding_backward", dst_grad.dtype(), T => {
        for i in 0..dst_grad.grid_size() {
            let width = dst_grad.layout().tile_shape_at(i)[last];
            let v = vocab_tile(dst_grad, i);
            let reads = vec![arg(index, index_tile(index, dst_grad, i)), arg(dst_grad, i)];

            submit_to("embedding_backward", vocab_grad, v, reads, move |ins, out| {
                let (index, grad) = (typed::<i64>(ins[0])?, typed::<T>(ins[1])?);
                k::embedding_backward(index, grad, typed_mut::<T>(out)?, rows, width)
            })?;
        }
        Ok(())
    })
}

/// `dst[b.., labels[b..]] -= val`
///
/// # Arguments
/// * `labels` - The `i64` class numbers, laid out like `dst` without its last axis.
/// * `dst` - The `[B.., C]` tensor, whole along `C`.
pub fn subtract_indexed_outputs(
    val: f64,
    labels: &DistributedTensor,
    dst: &DistributedTensor,
) -> Result<()> {
    ensure_index("subtract_indexed_outputs", labels, dst)?;
    ensure_whole_last_axis("subtract_indexed_outputs", dst)?;

    let classes = dst.shape()[dst.ndim() - 1];

    float_dispatch!("subtract_indexed_outputs", dst.dtype(), T => {
        let val = T::of(val);
        for i in 0..dst.grid_size() {
            let reads = vec![arg(labels, index_tile(labels, dst, i))];

            submit_to("subtract_indexed_outputs", dst, i, reads, move |ins, out| {
                let labels = typed::<i64>(ins[0])?;
                k::subtract_indexed_outputs(val, labels, typed_mut::<T>(out)?, classes)
            })?;
        }
        Ok(())
    })
}

/// `dst := beta * dst + alpha * sum(src[b.., labels[b..]])`, `dst` being a single element.
pub fn sum_indexed(
    alpha: f64,
    labels: &DistributedTensor,
    src: &DistributedTensor,
    beta: f64,
    dst: &DistributedTensor,
) -> Result<()> {
    ensure_index("sum_indexed", labels, src)?;
    ensure_whole_last_axis("sum_indexed", src)?;
    ensure_live(&[dst])?;
    ensure_scalar("sum_indexed", dst)?;
    ensure_distinct("sum_indexed", src, dst)?;
    dst.ensure_dtype(src.dtype())?;

    let classes = src.shape()[src.ndim() - 1];

    float_dispatch!("sum_indexed", dst.dtype(), T => {
        for i in 0..src.grid_size() {
            let (a, b) = (T::of(alpha), T::of(if i == 0 { beta } else { 1. }));
            let reads = vec![arg(labels, index_tile(labels, src, i)), arg(src, i)];

            submit_to("sum_indexed", dst, 0, reads, move |ins, out| {
                let s = k::sum_indexed(typed::<i64>(ins[0])?, typed::<T>(ins[1])?, classes)?;
                let d = &mut typed_mut::<T>(out)?[0];
                *d = axpby(a, s, b, *d);
                Ok(())
            })?;
        }
        Ok(())
    })
}
