use std::num::NonZeroUsize;

use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use runtime::{Runtime, RuntimeConfig};
use tilenet::{
    DType, DistributedTensor, Model, TagAllocator, TensorMoments, TileLayout,
    layer::{
        Act, ActKind, AddSlice, Attention, AttentionConfig, Embedding, EmbeddingConfig, Layer,
        LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    model::{MlpConfig, mlp},
    tensor::distribution,
};

const H: f64 = 1e-5;

fn runtime(nodes: usize) -> Runtime {
    let nodes = NonZeroUsize::new(nodes).unwrap();
    Runtime::new(RuntimeConfig::new(nodes, NonZeroUsize::new(2))).unwrap()
}

fn input(
    rt: &Runtime,
    shape: &[usize],
    tile: &[usize],
    dtype: DType,
    grad_required: bool,
    tags: TagAllocator,
) -> (TensorMoments, TagAllocator) {
    let layout = TileLayout::compute(shape, tile).unwrap();
    let dist = distribution::round_robin(&layout, rt.nodes());
    TensorMoments::generate(layout, dist, dtype, grad_required, rt, tags).unwrap()
}

fn random(shape: &[usize], seed: u64) -> ArrayD<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.random_range(-1.0..1.0))
}

/// `sum(y * r)`, the scalar whose gradient with respect to `y` is `r`.
fn objective(y: &DistributedTensor, r: &ArrayD<f64>) -> f64 {
    (&y.to_array::<f64>().unwrap() * r).sum()
}

/// Central differences of `objective` with respect to every element of `target`.
fn numeric_gradient(
    forward: &mut dyn FnMut(),
    y: &DistributedTensor,
    r: &ArrayD<f64>,
    target: &DistributedTensor,
) -> ArrayD<f64> {
    let base = target.to_array::<f64>().unwrap();
    let mut grad = ArrayD::zeros(base.raw_dim());

    for (idx, g) in grad.indexed_iter_mut() {
        let mut probe = base.clone();

        probe[idx.slice()] += H;
        target.load(probe.view()).unwrap();
        forward();
        let up = objective(y, r);

        probe[idx.slice()] -= 2. * H;
        target.load(probe.view()).unwrap();
        forward();
        let down = objective(y, r);

        *g = (up - down) / (2. * H);
    }

    target.load(base.view()).unwrap();
    forward();
    grad
}

fn assert_close(got: &ArrayD<f64>, expected: &ArrayD<f64>, tol: f64) {
    assert_eq!(got.shape(), expected.shape());
    for (g, e) in got.iter().zip(expected) {
        assert!((g - e).abs() <= tol * (1. + e.abs()), "{got} != {expected}");
    }
}

#[test]
fn add_slice_broadcasts_and_reduces() {
    let rt = runtime(2);
    let (x, tags) = input(&rt, &[3, 4, 2], &[2, 2, 1], DType::F64, true, TagAllocator::new());
    let (s, tags) = input(&rt, &[3, 2], &[2, 1], DType::F64, true, tags);
    let (mut layer, _) = AddSlice::generate_simple(&x, &s, 1, tags).unwrap();

    let (xs, ss) = (random(&[3, 4, 2], 1), random(&[3, 2], 2));
    x.value().load(xs.view()).unwrap();
    s.value().load(ss.view()).unwrap();
    layer.forward_async().unwrap();

    let expected = &xs + &ss.clone().insert_axis(Axis(1));
    assert_close(&layer.output().value().to_array().unwrap(), &expected, 1e-12);

    let r = random(&[3, 4, 2], 3);
    layer.output().grad().unwrap().load(r.view()).unwrap();
    layer.backward_async().unwrap();

    assert_close(&x.grad().unwrap().to_array().unwrap(), &r, 1e-12);
    assert_close(&s.grad().unwrap().to_array().unwrap(), &r.sum_axis(Axis(1)), 1e-12);
}

#[test]
fn mlp_gradients_match_finite_differences() {
    let rt = runtime(3);
    let (x, tags) = input(&rt, &[4, 3], &[2, 2], DType::F64, true, TagAllocator::new());
    let config = MlpConfig {
        hidden: vec![5],
        output: 2,
        tile: 2,
        act: ActKind::GeluTanh,
        seed: 3,
    };
    let (mut model, _) = mlp(x.clone(), &config, tags).unwrap();
    let y = model.output().clone();

    x.value().load(random(&[4, 3], 4).view()).unwrap();
    model.forward_async().unwrap();

    let r = random(&[4, 2], 5);
    y.grad().unwrap().load(r.view()).unwrap();
    model.backward_async().unwrap();

    let mut forward = || model.forward_async().unwrap();
    let expected = numeric_gradient(&mut forward, y.value(), &r, x.value());
    assert_close(&x.grad().unwrap().to_array().unwrap(), &expected, 1e-6);

    let params = model.named_parameters();
    assert_eq!(params.len(), 4);
    for (name, p) in params {
        let mut forward = || model.forward_async().unwrap();
        let expected = numeric_gradient(&mut forward, y.value(), &r, p.value());
        let got = p.grad().unwrap().to_array().unwrap();
        assert!(got.iter().any(|&g| g != 0.), "{name} has no gradient");
        assert_close(&got, &expected, 1e-6);
    }
}

#[test]
fn model_trains_through_parameterless_layers_over_a_plain_input() {
    let rt = runtime(2);
    let (x, tags) = input(&rt, &[2, 3], &[1, 3], DType::F64, false, TagAllocator::new());
    let (s, tags) = input(&rt, &[3], &[3], DType::F64, false, tags);

    let mut model = Model::new(x.clone());
    let (act, tags) = Act::generate_simple(model.output(), ActKind::Relu, tags).unwrap();
    model.push(act);
    let (add, tags) = AddSlice::generate_simple(model.output(), &s, 0, tags).unwrap();
    model.push(add);

    let config = LinearConfig {
        out_features: 2,
        out_tile: 2,
        bias: true,
        seed: 4,
    };
    let (linear, _) = Linear::generate_simple(model.output(), config, tags).unwrap();
    model.push(linear);

    x.value().load(random(&[2, 3], 16).view()).unwrap();
    s.value().load(random(&[3], 17).view()).unwrap();
    model.forward_async().unwrap();

    let r = random(&[2, 2], 18);
    model.output().grad().unwrap().load(r.view()).unwrap();
    model.backward_async().unwrap();
    rt.wait_for_all().unwrap();

    let params = model.named_parameters();
    assert_eq!(params[0].0, "2.linear.weight");
    let dw = params[0].1.grad().unwrap().to_array::<f64>().unwrap();
    assert!(dw.iter().any(|&g| g != 0.));
}

#[test]
fn layer_norm_gradients_match_finite_differences() {
    let rt = runtime(2);
    let (x, tags) = input(&rt, &[3, 5], &[2, 2], DType::F64, true, TagAllocator::new());
    let config = LayerNormConfig { axis: 1, eps: 1e-5 };
    let (mut layer, _) = LayerNorm::generate_simple(&x, config, tags).unwrap();
    let y = layer.output().clone();
    let (gamma, beta) = (layer.gamma().clone(), layer.beta().clone());

    x.value().load(random(&[3, 5], 6).view()).unwrap();
    gamma.value().load(random(&[5], 7).view()).unwrap();
    beta.value().load(random(&[5], 8).view()).unwrap();
    layer.forward_async().unwrap();

    let r = random(&[3, 5], 9);
    y.grad().unwrap().load(r.view()).unwrap();
    layer.backward_async().unwrap();

    let dx = x.grad().unwrap().to_array().unwrap();
    let dgamma = gamma.grad().unwrap().to_array().unwrap();
    let dbeta = beta.grad().unwrap().to_array().unwrap();

    let mut forward = || layer.forward_async().unwrap();
    assert_close(&dx, &numeric_gradient(&mut forward, y.value(), &r, x.value()), 1e-5);
    assert_close(&dgamma, &numeric_gradient(&mut forward, y.value(), &r, gamma.value()), 1e-6);
    assert_close(&dbeta, &r.sum_axis(Axis(0)), 1e-12);
}

#[test]
fn causal_attention_gradients_match_finite_differences() {
    let rt = runtime(2);
    let (x, tags) = input(&rt, &[2, 3, 4], &[1, 2, 2], DType::F64, true, TagAllocator::new());
    let config = AttentionConfig {
        causal: true,
        seed: 12,
    };
    let (mut layer, _) = Attention::generate_simple(&x, config, tags).unwrap();
    let y = layer.output().clone();
    let [w_q, _, w_v, w_o] = layer.weights().map(|w| w.clone());

    x.value().load(random(&[2, 3, 4], 10).view()).unwrap();
    layer.forward_async().unwrap();

    let r = random(&[2, 3, 4], 11);
    y.grad().unwrap().load(r.view()).unwrap();
    layer.backward_async().unwrap();

    let mut forward = || layer.forward_async().unwrap();
    for t in [&x, &w_q, &w_v, &w_o] {
        let expected = numeric_gradient(&mut forward, y.value(), &r, t.value());
        assert_close(&t.grad().unwrap().to_array().unwrap(), &expected, 1e-6);
    }
}

#[test]
fn causal_attention_ignores_later_positions() {
    let rt = runtime(1);
    let (x, tags) = input(&rt, &[1, 3, 2], &[1, 3, 2], DType::F64, false, TagAllocator::new());
    let config = AttentionConfig {
        causal: true,
        seed: 1,
    };
    let (mut layer, _) = Attention::generate_simple(&x, config, tags).unwrap();

    let mut xs = random(&[1, 3, 2], 13);
    x.value().load(xs.view()).unwrap();
    layer.forward_async().unwrap();
    let before = layer.output().value().to_array::<f64>().unwrap();

    xs[[0, 2, 0]] += 1.;
    xs[[0, 2, 1]] -= 1.;
    x.value().load(xs.view()).unwrap();
    layer.forward_async().unwrap();
    let after = layer.output().value().to_array::<f64>().unwrap();

    for s in 0..2 {
        for e in 0..2 {
            assert!((before[[0, s, e]] - after[[0, s, e]]).abs() < 1e-12);
        }
    }
    assert!((before[[0, 2, 0]] - after[[0, 2, 0]]).abs() > 1e-9);
}

#[test]
fn embedding_gradient_accumulates_repeated_rows() {
    let rt = runtime(2);
    let (index, tags) = input(&rt, &[2, 3], &[1, 2], DType::I64, false, TagAllocator::new());
    let config = EmbeddingConfig {
        vocab: 4,
        embed: 3,
        embed_tile: 2,
        dtype: DType::F64,
        seed: 5,
    };
    let (mut layer, _) = Embedding::generate_simple(&index, config, tags).unwrap();

    let rows = ndarray::array![[1i64, 3, 1], [0, 1, 3]].into_dyn();
    index.value().load(rows.view()).unwrap();
    layer.forward_async().unwrap();

    let table = layer.table().value().to_array::<f64>().unwrap();
    let y = layer.output().value().to_array::<f64>().unwrap();
    for ((b, s), &row) in rows.indexed_iter().map(|(i, v)| ((i[0], i[1]), v)) {
        for e in 0..3 {
            assert_eq!(y[[b, s, e]], table[[row as usize, e]]);
        }
    }

    let r = random(&[2, 3, 3], 14);
    layer.output().grad().unwrap().load(r.view()).unwrap();
    layer.backward_async().unwrap();

    let mut expected = ArrayD::<f64>::zeros(IxDyn(&[4, 3]));
    for ((b, s), &row) in rows.indexed_iter().map(|(i, v)| ((i[0], i[1]), v)) {
        for e in 0..3 {
            expected[[row as usize, e]] += r[[b, s, e]];
        }
    }
    assert_close(&layer.table().grad().unwrap().to_array().unwrap(), &expected, 1e-12);
}

#[test]
fn model_parameters_survive_an_export_import_round_trip() {
    let rt = runtime(2);
    let build = |seed, tags| {
        let (x, tags) = input(&rt, &[2, 3], &[1, 3], DType::F32, true, tags);
        let config = MlpConfig {
            hidden: vec![4],
            output: 2,
            tile: 2,
            act: ActKind::Relu,
            seed,
        };
        let (model, tags): (Model, _) = mlp(x, &config, tags).unwrap();
        (model, tags)
    };

    let (mut a, tags) = build(1, TagAllocator::new());
    let (mut b, _) = build(2, tags);

    let exported = a.export_parameters::<f32>().unwrap();
    assert_ne!(exported, b.export_parameters::<f32>().unwrap());
    b.import_parameters(&exported).unwrap();
    assert_eq!(b.export_parameters::<f32>().unwrap(), exported);

    let xs = random(&[2, 3], 15).mapv(|v| v as f32);
    a.input().value().load(xs.view()).unwrap();
    b.input().value().load(xs.view()).unwrap();
    a.forward_async().unwrap();
    b.forward_async().unwrap();
    assert_eq!(
        a.output().value().to_array::<f32>().unwrap(),
        b.output().value().to_array::<f32>().unwrap()
    );

    let mut renamed = exported.clone();
    renamed[0].0 = "0.linear.kernel".into();
    assert!(b.import_parameters(&renamed).is_err());
    assert!(b.import_parameters(&exported[1..]).is_err());

    let mut reshaped = exported;
    reshaped[1].1 = ArrayD::zeros(IxDyn(&[5]));
    assert!(b.import_parameters(&reshaped).is_err());
}
