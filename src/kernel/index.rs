use runtime::KernelFault;

use crate::tensor::FloatElement;

fn row(index: i64, rows: usize) -> Result<usize, KernelFault> {
    usize::try_from(index)
        .ok()
        .filter(|&r| r < rows)
        .ok_or_else(|| KernelFault::new(format!("index {index} is out of range [0, {rows})")))
}

/// Copies row `index[b]` of `vocab` (`[rows, width]`) into row `b` of `dst`.
pub fn embedding<T: Copy>(
    index: &[i64],
    vocab: &[T],
    dst: &mut [T],
    rows: usize,
    width: usize,
) -> Result<(), KernelFault> {
    for (&ix, out) in index.iter().zip(dst.chunks_exact_mut(width)) {
        let r = row(ix, rows)?;
        out.copy_from_slice(&vocab[r * width..][..width]);
    }

    Ok(())
}

/// Adds row `b` of `dst_grad` into row `index[b]` of `vocab_grad`.
pub fn embedding_backward<T: FloatElement>(
    index: &[i64],
    dst_grad: &[T],
    vocab_grad: &mut [T],
    rows: usize,
    width: usize,
) -> Result<(), KernelFault> {
    for (&ix, grad) in index.iter().zip(dst_grad.chunks_exact(width)) {
        let r = row(ix, rows)?;
        for (v, &g) in vocab_grad[r * width..][..width].iter_mut().zip(grad) {
            *v += g;
        }
    }

    Ok(())
}

/// `dst[b, labels[b]] -= val` with `dst` being `[len(labels), classes]`.
pub fn subtract_indexed_outputs<T: FloatElement>(
    val: T,
    labels: &[i64],
    dst: &mut [T],
    classes: usize,
) -> Result<(), KernelFault> {
    for (b, &label) in labels.iter().enumerate() {
        let c = row(label, classes)?;
        dst[b * classes + c] -= val;
    }

    Ok(())
}

/// Returns the sum of `src[b, labels[b]]` with `src` being `[len(labels), classes]`.
pub fn sum_indexed<T: FloatElement>(
    labels: &[i64],
    src: &[T],
    classes: usize,
) -> Result<T, KernelFault> {
    labels
        .iter()
        .enumerate()
        .map(|(b, &label)| -> Result<T, KernelFault> {
            Ok(src[b * classes + row(label, classes)?])
        })
        .sum()
}
