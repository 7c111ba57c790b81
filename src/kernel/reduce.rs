use super::{AxisDims, axpby};
use crate::tensor::FloatElement;

/// `dst[i, l, j] := beta * dst[i, l, j] + alpha * src[i, j]`
pub fn add_slice<T: FloatElement>(alpha: T, src: &[T], beta: T, dst: &mut [T], dims: AxisDims) {
    let AxisDims { m, k, n } = dims;

    for i in 0..m {
        for l in 0..k {
            let row = &mut dst[(i * k + l) * n..][..n];
            for (d, &s) in row.iter_mut().zip(&src[i * n..][..n]) {
                *d = axpby(alpha, s, beta, *d);
            }
        }
    }
}

/// `dst[i, j] := beta * dst[i, j] + alpha * sum_l src[i, l, j]`
pub fn sum_slice<T: FloatElement>(alpha: T, src: &[T], beta: T, dst: &mut [T], dims: AxisDims) {
    sumprod_slice_with(alpha, src, None, beta, dst, dims);
}

/// `dst[i, j] := beta * dst[i, j] + alpha * sum_l a[i, l, j] * b[i, l, j]`
pub fn sumprod_slice<T: FloatElement>(
    alpha: T,
    a: &[T],
    b: &[T],
    beta: T,
    dst: &mut [T],
    dims: AxisDims,
) {
    sumprod_slice_with(alpha, a, Some(b), beta, dst, dims);
}

fn sumprod_slice_with<T: FloatElement>(
    alpha: T,
    a: &[T],
    b: Option<&[T]>,
    beta: T,
    dst: &mut [T],
    dims: AxisDims,
) {
    let AxisDims { m, k, n } = dims;

    for i in 0..m {
        for j in 0..n {
            let acc: T = (0..k)
                .map(|l| {
                    let at = (i * k + l) * n + j;
                    b.map_or(a[at], |b| a[at] * b[at])
                })
                .sum();

            let d = &mut dst[i * n + j];
            *d = axpby(alpha, acc, beta, *d);
        }
    }
}

/// `dst[i, l, j] := alpha * src[i, j] * dst[i, l, j]`
pub fn prod_slice<T: FloatElement>(alpha: T, src: &[T], dst: &mut [T], dims: AxisDims) {
    let AxisDims { m, k, n } = dims;

    for i in 0..m {
        for l in 0..k {
            let row = &mut dst[(i * k + l) * n..][..n];
            for (d, &s) in row.iter_mut().zip(&src[i * n..][..n]) {
                *d *= alpha * s;
            }
        }
    }
}

/// `dst[i, j] := max(dst[i, j], max_l src[i, l, j])`, or just the max of `src` when `init`.
pub fn max_slice<T: FloatElement>(src: &[T], dst: &mut [T], dims: AxisDims, init: bool) {
    let AxisDims { m, k, n } = dims;

    for i in 0..m {
        for j in 0..n {
            let max = (0..k)
                .map(|l| src[(i * k + l) * n + j])
                .fold(T::neg_infinity(), T::max);

            let d = &mut dst[i * n + j];
            *d = if init { max } else { d.max(max) };
        }
    }
}

/// `dst[i, j] := beta * dst[i, j] + sum_l exp(src[i, l, j] - maxes[i, j])`
pub fn sumexp_slice<T: FloatElement>(
    maxes: &[T],
    src: &[T],
    beta: T,
    dst: &mut [T],
    dims: AxisDims,
) {
    let AxisDims { m, k, n } = dims;

    for i in 0..m {
        for j in 0..n {
            let max = maxes[i * n + j];
            let acc: T = (0..k)
                .map(|l| (src[(i * k + l) * n + j] - max).exp())
                .sum();

            let d = &mut dst[i * n + j];
            *d = axpby(T::one(), acc, beta, *d);
        }
    }
}

/// `dst[i, l, j] := alpha * exp(dst[i, l, j] - maxes[i, j]) / sums[i, j]`
pub fn softmax_inplace<T: FloatElement>(
    maxes: &[T],
    sums: &[T],
    alpha: T,
    dst: &mut [T],
    dims: AxisDims,
) {
    let AxisDims { m, k, n } = dims;

    for i in 0..m {
        for l in 0..k {
            let row = &mut dst[(i * k + l) * n..][..n];
            for (j, d) in row.iter_mut().enumerate() {
                let at = i * n + j;
                *d = alpha * (*d - maxes[at]).exp() / sums[at];
            }
        }
    }
}

/// `dst := maxes + ln(sums)`, elementwise.
pub fn logsumexp<T: FloatElement>(maxes: &[T], sums: &[T], dst: &mut [T]) {
    for ((d, &max), &sum) in dst.iter_mut().zip(maxes).zip(sums) {
        *d = max + sum.ln();
    }
}

/// `dst[i, l, j] := beta * dst[i, l, j] + alpha * src[l]`
pub fn add_fiber<T: FloatElement>(alpha: T, src: &[T], beta: T, dst: &mut [T], dims: AxisDims) {
    let AxisDims { m, k, n } = dims;

    for i in 0..m {
        for (l, &s) in src.iter().enumerate().take(k) {
            for d in &mut dst[(i * k + l) * n..][..n] {
                *d = axpby(alpha, s, beta, *d);
            }
        }
    }
}

/// `dst[l] := beta * dst[l] + alpha * sum_{i, j} src[i, l, j]`
pub fn sum_fiber<T: FloatElement>(alpha: T, src: &[T], beta: T, dst: &mut [T], dims: AxisDims) {
    sumprod_fiber_with(alpha, src, None, beta, dst, dims);
}

/// `dst[l] := beta * dst[l] + alpha * sum_{i, j} a[i, l, j] * b[i, l, j]`
pub fn sumprod_fiber<T: FloatElement>(
    alpha: T,
    a: &[T],
    b: &[T],
    beta: T,
    dst: &mut [T],
    dims: AxisDims,
) {
    sumprod_fiber_with(alpha, a, Some(b), beta, dst, dims);
}

fn sumprod_fiber_with<T: FloatElement>(
    alpha: T,
    a: &[T],
    b: Option<&[T]>,
    beta: T,
    dst: &mut [T],
    dims: AxisDims,
) {
    let AxisDims { m, k, n } = dims;

    for (l, d) in dst.iter_mut().enumerate().take(k) {
        let mut acc = T::zero();
        for i in 0..m {
            let start = (i * k + l) * n;
            acc += match b {
                Some(b) => a[start..start + n]
                    .iter()
                    .zip(&b[start..start + n])
                    .map(|(&x, &y)| x * y)
                    .sum::<T>(),
                None => a[start..start + n].iter().copied().sum::<T>(),
            };
        }

        *d = axpby(alpha, acc, beta, *d);
    }
}

/// `dst[i, l, j] := alpha * src[l] * dst[i, l, j]`
pub fn prod_fiber<T: FloatElement>(alpha: T, src: &[T], dst: &mut [T], dims: AxisDims) {
    let AxisDims { m, k, n } = dims;

    for i in 0..m {
        for (l, &s) in src.iter().enumerate().take(k) {
            for d in &mut dst[(i * k + l) * n..][..n] {
                *d *= alpha * s;
            }
        }
    }
}
