use log::debug;
use ndarray::{ArrayD, IxDyn};

use super::{Layer, Parameter, ensure_float, moments, param_seed, temporary};
use crate::{
    error::{Result, TileErr},
    layout::TileLayout,
    ops,
    tag::TagAllocator,
    tensor::{DType, DistributedTensor, TensorMoments},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionConfig {
    /// Hides later positions from earlier ones.
    pub causal: bool,
    pub seed: u64,
}

/// Single head scaled dot product self attention over a `[B, S, E]` input.
///
/// `y := softmax(scale * Q·Kᵀ)·V·W_o` with `Q := x·W_q`, `K := x·W_k`, `V := x·W_v` and
/// `scale := 1 / sqrt(E)`, the softmax taken over the key positions.
#[derive(Debug)]
pub struct Attention {
    x: TensorMoments,
    y: TensorMoments,
    w_q: TensorMoments,
    w_k: TensorMoments,
    w_v: TensorMoments,
    w_o: TensorMoments,
    scale: f64,

    // `[B, S, E]`
    q: DistributedTensor,
    k: DistributedTensor,
    v: DistributedTensor,
    z: DistributedTensor,
    dz: DistributedTensor,
    dproj: DistributedTensor,

    // `[B, S, S]`, the scores turn into probabilities in place
    probs: DistributedTensor,
    dprobs: DistributedTensor,

    // `[B, S]`
    maxes: DistributedTensor,
    sums: DistributedTensor,
    rowdot: DistributedTensor,

    mask: Option<DistributedTensor>,
}

impl Attention {
    /// Creates a new `Attention` layer.
    ///
    /// Consumes tags for the output value and gradient, then `W_q`, `W_k`, `W_v` and `W_o`
    /// with their gradients, then the temporaries `q`, `k`, `v`, `z`, `dz`, `dproj`, `probs`,
    /// `dprobs`, `maxes`, `sums`, `rowdot` and, for a causal layer, the mask.
    ///
    /// # Returns
    /// `ShapeMismatch` unless `x` is three dimensional.
    pub fn generate_simple(
        x: &TensorMoments,
        config: AttentionConfig,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        let xv = x.value();
        ensure_float("attention", xv)?;
        if xv.ndim() != 3 {
            return Err(TileErr::shape("attention", &[0, 0, 0], xv.shape()));
        }

        let dtype = xv.dtype();
        let (shape, tile) = (xv.shape(), xv.layout().tile_shape());
        let (b, s, e) = (shape[0], shape[1], shape[2]);
        let (tb, ts, te) = (tile[0], tile[1], tile[2]);

        let full = xv.layout().clone();
        let weights = TileLayout::compute(&[e, e], &[te, te])?;
        let scores = TileLayout::compute(&[b, s, s], &[tb, ts, ts])?;
        let rows = scores.remove_axis(2)?;

        let (y, tags) = moments(full.clone(), xv, dtype, true, tags)?;
        let (w_q, tags) = moments(weights.clone(), xv, dtype, true, tags)?;
        let (w_k, tags) = moments(weights.clone(), xv, dtype, true, tags)?;
        let (w_v, tags) = moments(weights.clone(), xv, dtype, true, tags)?;
        let (w_o, tags) = moments(weights, xv, dtype, true, tags)?;

        let (q, tags) = temporary(full.clone(), xv, dtype, tags)?;
        let (k, tags) = temporary(full.clone(), xv, dtype, tags)?;
        let (v, tags) = temporary(full.clone(), xv, dtype, tags)?;
        let (z, tags) = temporary(full.clone(), xv, dtype, tags)?;
        let (dz, tags) = temporary(full.clone(), xv, dtype, tags)?;
        let (dproj, tags) = temporary(full, xv, dtype, tags)?;
        let (probs, tags) = temporary(scores.clone(), xv, dtype, tags)?;
        let (dprobs, tags) = temporary(scores, xv, dtype, tags)?;
        let (maxes, tags) = temporary(rows.clone(), xv, dtype, tags)?;
        let (sums, tags) = temporary(rows.clone(), xv, dtype, tags)?;
        let (rowdot, tags) = temporary(rows, xv, dtype, tags)?;

        let (mask, tags) = if config.causal {
            let layout = TileLayout::compute(&[s, s], &[ts, ts])?;
            let (mask, tags) = temporary(layout, xv, DType::Bool, tags)?;
            let lower = ArrayD::from_shape_fn(IxDyn(&[s, s]), |i| i[1] <= i[0]);
            mask.load(lower.view())?;
            (Some(mask), tags)
        } else {
            (None, tags)
        };

        let stddev = (e as f64).recip().sqrt();
        for w in [&w_q, &w_k, &w_v, &w_o] {
            ops::randn(w.value(), param_seed(config.seed, w.value()), 0., stddev)?;
        }

        Ok((
            Self {
                x: x.clone(),
                y,
                w_q,
                w_k,
                w_v,
                w_o,
                scale: stddev,
                q,
                k,
                v,
                z,
                dz,
                dproj,
                probs,
                dprobs,
                maxes,
                sums,
                rowdot,
                mask,
            },
            tags,
        ))
    }

    pub fn output(&self) -> &TensorMoments {
        &self.y
    }

    /// Returns `W_q`, `W_k`, `W_v` and `W_o`.
    pub fn weights(&self) -> [&TensorMoments; 4] {
        [&self.w_q, &self.w_k, &self.w_v, &self.w_o]
    }

    /// `dW += xᵀ·d` and `dx += d·Wᵀ` for one input projection.
    fn project_back(&self, d: &DistributedTensor, w: &TensorMoments) -> Result<()> {
        let x = self.x.value();
        ops::gemm(1., true, x, false, d, 1., w.grad_or_err()?, 2, 0)?;

        if let Some(dx) = self.x.grad() {
            ops::gemm(1., false, d, true, w.value(), 1., dx, 1, 0)?;
        }

        Ok(())
    }
}

impl Layer for Attention {
    fn name(&self) -> &'static str {
        "attention"
    }

    fn outputs(&self) -> Vec<TensorMoments> {
        vec![self.y.clone()]
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::new("w_q", self.w_q.clone()),
            Parameter::new("w_k", self.w_k.clone()),
            Parameter::new("w_v", self.w_v.clone()),
            Parameter::new("w_o", self.w_o.clone()),
        ]
    }

    fn temporaries(&self) -> Vec<DistributedTensor> {
        let mut temps = vec![
            self.q.clone(),
            self.k.clone(),
            self.v.clone(),
            self.z.clone(),
            self.dz.clone(),
            self.dproj.clone(),
            self.probs.clone(),
            self.dprobs.clone(),
            self.maxes.clone(),
            self.sums.clone(),
            self.rowdot.clone(),
        ];
        temps.extend(self.mask.clone());
        temps
    }

    fn forward_async(&mut self) -> Result<()> {
        let x = self.x.value();
        let y = self.y.value();

        ops::gemm(1., false, x, false, self.w_q.value(), 0., &self.q, 1, 0)?;
        ops::gemm(1., false, x, false, self.w_k.value(), 0., &self.k, 1, 0)?;
        ops::gemm(1., false, x, false, self.w_v.value(), 0., &self.v, 1, 0)?;

        let probs = &self.probs;
        ops::gemm(self.scale, false, &self.q, true, &self.k, 0., probs, 1, 1)?;
        if let Some(mask) = &self.mask {
            ops::mask_scalar(mask, f64::NEG_INFINITY, probs)?;
        }

        ops::max_slice(probs, &self.maxes, 2)?;
        ops::sumexp_slice(&self.maxes, probs, &self.sums, 2)?;
        ops::softmax_inplace(&self.maxes, &self.sums, 1., probs, 2)?;

        ops::gemm(1., false, probs, false, &self.v, 0., &self.z, 1, 1)?;
        ops::gemm(1., false, &self.z, false, self.w_o.value(), 0., y, 1, 0)?;

        self.maxes.mark_unused()?;
        self.sums.mark_unused()?;

        debug!(tag = y.tag(); "attention forward enqueued");
        Ok(())
    }

    fn backward_async(&mut self) -> Result<()> {
        let dy = self.y.grad_or_err()?;
        let (probs, dprobs, dz, dproj) = (&self.probs, &self.dprobs, &self.dz, &self.dproj);

        ops::gemm(1., true, &self.z, false, dy, 1., self.w_o.grad_or_err()?, 2, 0)?;
        ops::gemm(1., false, dy, true, self.w_o.value(), 0., dz, 1, 0)?;

        // through the values
        ops::gemm(1., true, probs, false, dz, 0., dproj, 1, 1)?;
        self.project_back(dproj, &self.w_v)?;

        // through the softmax, dA = scale * P * (dP - rowsum(dP * P))
        ops::gemm(1., false, dz, true, &self.v, 0., dprobs, 1, 1)?;
        ops::sumprod_slice(1., dprobs, probs, 0., &self.rowdot, 2)?;
        ops::add_slice(-1., &self.rowdot, 1., dprobs, 2)?;
        ops::prod(probs, dprobs)?;
        ops::scal(self.scale, dprobs)?;

        ops::gemm(1., false, dprobs, false, &self.k, 0., dproj, 1, 1)?;
        self.project_back(dproj, &self.w_q)?;

        ops::gemm(1., true, dprobs, false, &self.q, 0., dproj, 1, 1)?;
        self.project_back(dproj, &self.w_k)?;

        dz.mark_unused()?;
        dprobs.mark_unused()?;
        dproj.mark_unused()?;

        debug!(tag = dy.tag(); "attention backward enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Axis;
    use runtime::{Runtime, RuntimeConfig};

    use super::*;
    use crate::tensor::distribution;

    #[test]
    fn causal_attention_of_the_first_position_only_sees_itself() {
        let rt = Runtime::new(RuntimeConfig::new(2.try_into().unwrap(), None)).unwrap();
        let layout = TileLayout::compute(&[1, 3, 2], &[1, 2, 1]).unwrap();
        let dist = distribution::round_robin(&layout, 2);
        let (x, tags) =
            TensorMoments::generate(layout, dist, DType::F64, true, &rt, TagAllocator::new())
                .unwrap();

        let config = AttentionConfig {
            causal: true,
            seed: 1,
        };
        let (mut layer, _) = Attention::generate_simple(&x, config, tags).unwrap();

        let xs = ArrayD::from_shape_fn(IxDyn(&[1, 3, 2]), |i| (i[1] + 2 * i[2]) as f64 - 1.5);
        x.value().load(xs.view()).unwrap();
        layer.forward_async().unwrap();

        let probs = layer.probs.to_array::<f64>().unwrap();
        for row in probs.index_axis(Axis(0), 0).axis_iter(Axis(0)) {
            assert!((row.sum() - 1.).abs() < 1e-12);
        }
        assert_eq!(probs[[0, 0, 0]], 1.);
        assert_eq!(probs[[0, 0, 1]], 0.);
        assert_eq!(probs[[0, 1, 2]], 0.);
    }
}
