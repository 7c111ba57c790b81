//! Asynchronous tensor operations.
//!
//! Every operation validates its operands, splits the work tile by tile and submits one task
//! per output tile (or per contributing input tile for reductions) into the runtime. None of
//! them wait for the work to finish. Scalars are given as `f64` and converted to the element
//! type of the operands.

mod elementwise;
mod gemm;
mod index;
mod random;
mod reduce;
mod transfer;

pub use elementwise::{
    add, adam_step, clear, copy, dot, fill, gelutanh, gelutanh_backward, inv_sqrt, mask_scalar,
    prod, relu, relu_backward, scal, sgd_step, total_sum,
};
pub use gemm::gemm;
pub use index::{embedding, embedding_backward, subtract_indexed_outputs, sum_indexed};
pub use random::randn;
pub use reduce::{
    add_fiber, add_slice, logsumexp, max_slice, prod_fiber, prod_slice, softmax_inplace,
    sum_fiber, sum_slice, sumexp_slice, sumprod_fiber, sumprod_slice,
};
pub use transfer::{gather, redistribute, scatter};

use runtime::{BufferKey, KernelFault, Task};

use crate::{
    error::{Result, TileErr},
    tensor::{DistributedTensor, TileData, TileRef},
};

/// One tile a task touches.
pub(crate) struct TileArg {
    key: BufferKey,
    tile: TileRef,
}

pub(crate) fn arg(t: &DistributedTensor, i: usize) -> TileArg {
    TileArg {
        key: t.key(i),
        tile: t.tile(i),
    }
}

/// Submits a task locking `reads` for reading and `writes` for writing while `kernel` runs.
///
/// # Arguments
/// * `name` - The task name.
/// * `on` - Any tensor of the operation, only its runtime is used.
/// * `node` - The node executing the task.
pub(crate) fn submit<F>(
    name: &'static str,
    on: &DistributedTensor,
    node: usize,
    reads: Vec<TileArg>,
    writes: Vec<TileArg>,
    kernel: F,
) -> Result<()>
where
    F: FnOnce(&[&TileData], &mut [&mut TileData]) -> std::result::Result<(), KernelFault>
        + Send
        + 'static,
{
    let read_keys: Vec<_> = reads.iter().map(|a| a.key).collect();
    let write_keys: Vec<_> = writes.iter().map(|a| a.key).collect();

    for (i, key) in write_keys.iter().enumerate() {
        if read_keys.contains(key) || write_keys[..i].contains(key) {
            return Err(TileErr::Aliasing(name));
        }
    }

    let task = Task::new(name, node, move || {
        let read_guards: Vec<_> = reads.iter().map(|a| a.tile.read_recursive()).collect();
        let mut write_guards: Vec<_> = writes.iter().map(|a| a.tile.write()).collect();

        let ins: Vec<&TileData> = read_guards.iter().map(|g| &**g).collect();
        let mut outs: Vec<&mut TileData> = write_guards.iter_mut().map(|g| &mut **g).collect();

        kernel(&ins, &mut outs)
    })
    .reads(read_keys)
    .writes(write_keys);

    on.submit(task)?;
    Ok(())
}

/// Submits a task writing tile `i` of `dst`, executed by its owner.
pub(crate) fn submit_to<F>(
    name: &'static str,
    dst: &DistributedTensor,
    i: usize,
    reads: Vec<TileArg>,
    kernel: F,
) -> Result<()>
where
    F: FnOnce(&[&TileData], &mut TileData) -> std::result::Result<(), KernelFault>
        + Send
        + 'static,
{
    submit(
        name,
        dst,
        dst.owner(i),
        reads,
        vec![arg(dst, i)],
        move |ins, outs| kernel(ins, &mut *outs[0]),
    )
}

pub(crate) fn ensure_live(tensors: &[&DistributedTensor]) -> Result<()> {
    tensors.iter().try_for_each(|t| t.ensure_live())
}

/// Fails unless both tensors have the same shape and tiling.
pub(crate) fn ensure_same_layout(
    op: &'static str,
    a: &DistributedTensor,
    b: &DistributedTensor,
) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(TileErr::shape(op, a.shape(), b.shape()));
    }

    if a.layout().tile_shape() != b.layout().tile_shape() {
        return Err(TileErr::shape(
            op,
            a.layout().tile_shape(),
            b.layout().tile_shape(),
        ));
    }

    Ok(())
}

pub(crate) fn ensure_same_dtype(a: &DistributedTensor, b: &DistributedTensor) -> Result<()> {
    a.ensure_dtype(b.dtype())
}

pub(crate) fn ensure_distinct(
    op: &'static str,
    a: &DistributedTensor,
    b: &DistributedTensor,
) -> Result<()> {
    if a.same_buffer(b) {
        return Err(TileErr::Aliasing(op));
    }

    Ok(())
}

/// Fails unless `t` holds a single element in a single tile.
pub(crate) fn ensure_scalar(op: &'static str, t: &DistributedTensor) -> Result<()> {
    if t.layout().nelems() != 1 {
        return Err(TileErr::shape(op, &[], t.shape()));
    }

    Ok(())
}

/// Checks and prepares a binary operation between same shaped tensors.
pub(crate) fn ensure_pair(
    op: &'static str,
    src: &DistributedTensor,
    dst: &DistributedTensor,
) -> Result<()> {
    ensure_live(&[src, dst])?;
    ensure_distinct(op, src, dst)?;
    ensure_same_layout(op, src, dst)?;
    ensure_same_dtype(src, dst)
}
