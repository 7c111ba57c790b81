use super::axpby;
use crate::tensor::FloatElement;

/// `dst := val`
pub fn fill<T: Copy>(val: T, dst: &mut [T]) {
    dst.fill(val);
}

/// `dst := src`
pub fn copy<T: Copy>(src: &[T], dst: &mut [T]) {
    dst.copy_from_slice(src);
}

/// `dst := alpha * src + beta * dst`
pub fn add<T: FloatElement>(alpha: T, src: &[T], beta: T, dst: &mut [T]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = axpby(alpha, s, beta, *d);
    }
}

/// `dst := alpha * dst`
pub fn scal<T: FloatElement>(alpha: T, dst: &mut [T]) {
    dst.iter_mut().for_each(|d| *d *= alpha);
}

/// `dst := src * dst`, elementwise.
pub fn prod<T: FloatElement>(src: &[T], dst: &mut [T]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d *= s;
    }
}

/// `dst := 1 / sqrt(src + eps)`
pub fn inv_sqrt<T: FloatElement>(eps: T, src: &[T], dst: &mut [T]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = (s + eps).sqrt().recip();
    }
}

pub fn relu<T: FloatElement>(src: &[T], dst: &mut [T]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s.max(T::zero());
    }
}

/// `dx += dy * relu'(x)`
pub fn relu_backward<T: FloatElement>(x: &[T], dy: &[T], dx: &mut [T]) {
    for ((d, &x), &g) in dx.iter_mut().zip(x).zip(dy) {
        if x > T::zero() {
            *d += g;
        }
    }
}

const GELU_A: f64 = 0.044715;
// sqrt(2 / pi)
const GELU_C: f64 = 0.797_884_560_802_865_4;

/// GELU with the tanh approximation.
pub fn gelutanh<T: FloatElement>(src: &[T], dst: &mut [T]) {
    let (a, c, half) = (T::of(GELU_A), T::of(GELU_C), T::of(0.5));

    for (d, &x) in dst.iter_mut().zip(src) {
        let u = c * (x + a * x * x * x);
        *d = half * x * (T::one() + u.tanh());
    }
}

/// `dx += dy * gelutanh'(x)`
pub fn gelutanh_backward<T: FloatElement>(x: &[T], dy: &[T], dx: &mut [T]) {
    let (a, c, half, three) = (T::of(GELU_A), T::of(GELU_C), T::of(0.5), T::of(3.));

    for ((d, &x), &g) in dx.iter_mut().zip(x).zip(dy) {
        let t = (c * (x + a * x * x * x)).tanh();
        let du = c * (T::one() + three * a * x * x);
        let df = half * (T::one() + t) + half * x * (T::one() - t * t) * du;
        *d += g * df;
    }
}

/// Sets `dst` to `val` wherever `mask` is false.
///
/// `mask` covers the trailing elements of `dst` and repeats over its leading elements.
pub fn mask_scalar<T: Copy>(mask: &[bool], val: T, dst: &mut [T]) {
    for chunk in dst.chunks_mut(mask.len().max(1)) {
        for (d, &keep) in chunk.iter_mut().zip(mask) {
            if !keep {
                *d = val;
            }
        }
    }
}

/// Returns the sum of `x * y`.
pub fn dot<T: FloatElement>(x: &[T], y: &[T]) -> T {
    x.iter().zip(y).map(|(&a, &b)| a * b).sum()
}

/// Hyperparameters of a stochastic gradient descent step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdParams<T> {
    pub lr: T,
    pub momentum: T,
    pub weight_decay: T,
}

/// One SGD step with optional momentum and weight decay.
///
/// `velocity` is only touched when momentum is enabled.
pub fn sgd_step<T: FloatElement>(
    hp: SgdParams<T>,
    grad: &[T],
    velocity: Option<&mut [T]>,
    param: &mut [T],
) {
    let SgdParams {
        lr,
        momentum,
        weight_decay: wd,
    } = hp;

    match velocity {
        Some(velocity) => {
            for ((p, &g), v) in param.iter_mut().zip(grad).zip(velocity) {
                *v = momentum * *v + g + wd * *p;
                *p -= lr * *v;
            }
        }
        None => {
            for (p, &g) in param.iter_mut().zip(grad) {
                *p -= lr * (g + wd * *p);
            }
        }
    }
}

/// Hyperparameters of an Adam step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams<T> {
    pub lr: T,
    pub beta1: T,
    pub beta2: T,
    pub eps: T,
    /// Decoupled weight decay, zero disables it.
    pub weight_decay: T,
}

/// One Adam (AdamW with decay) step.
///
/// # Arguments
/// * `step` - The 1-based step number, used for bias correction.
pub fn adam_step<T: FloatElement>(
    step: i32,
    hp: AdamParams<T>,
    grad: &[T],
    m: &mut [T],
    v: &mut [T],
    param: &mut [T],
) {
    let AdamParams {
        lr,
        beta1: b1,
        beta2: b2,
        eps,
        weight_decay: wd,
    } = hp;

    let bc1 = T::one() - b1.powi(step);
    let bc2 = T::one() - b2.powi(step);

    param
        .iter_mut()
        .zip(grad)
        .zip(m.iter_mut())
        .zip(v.iter_mut())
        .for_each(|(((p, &g), m), v)| {
            *p -= lr * wd * *p;
            *m = b1 * *m + (T::one() - b1) * g;
            *v = b2 * *v + (T::one() - b2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = *v / bc2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_follows_the_scalar_contract() {
        let mut dst = [1., 2., 3.];
        add(2., &[1., 1., 1.], 3., &mut dst);
        assert_eq!(dst, [5., 8., 11.]);
    }

    #[test]
    fn relu_gradient_only_flows_through_positive_inputs() {
        let x = [-1., 0., 2.];
        let mut dx = [1., 1., 1.];
        relu_backward(&x, &[5., 5., 5.], &mut dx);
        assert_eq!(dx, [1., 1., 6.]);
    }

    #[test]
    fn gelu_derivative_matches_finite_differences() {
        let h: f64 = 1e-6;
        for x in [-2.0, -0.5, 0.0, 0.3, 1.7] {
            let (mut hi, mut lo) = ([0.], [0.]);
            gelutanh(&[x + h], &mut hi);
            gelutanh(&[x - h], &mut lo);

            let mut dx = [0.];
            gelutanh_backward(&[x], &[1.], &mut dx);
            assert!((dx[0] - (hi[0] - lo[0]) / (2. * h)).abs() < 1e-6);
        }
    }

    #[test]
    fn mask_repeats_over_leading_elements() {
        let mut dst = [1., 2., 3., 4.];
        mask_scalar(&[true, false], f64::NEG_INFINITY, &mut dst);
        assert_eq!(dst, [1., f64::NEG_INFINITY, 3., f64::NEG_INFINITY]);
    }

    #[test]
    fn sgd_momentum_accumulates_velocity() {
        let hp = SgdParams {
            lr: 0.1,
            momentum: 0.5,
            weight_decay: 0.,
        };
        let mut param = [1.];
        let mut velocity = [0.];

        sgd_step(hp, &[1.], Some(&mut velocity), &mut param);
        sgd_step(hp, &[1.], Some(&mut velocity), &mut param);

        assert_eq!(velocity, [1.5]);
        assert!((param[0] - 0.75f64).abs() < 1e-12);
    }

    #[test]
    fn first_adam_step_moves_by_lr() {
        let hp = AdamParams {
            lr: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.,
        };
        let (mut m, mut v, mut p) = ([0.], [0.], [1.]);

        adam_step(1, hp, &[4.], &mut m, &mut v, &mut p);
        assert!((p[0] - 0.99f64).abs() < 1e-6);
    }
}
