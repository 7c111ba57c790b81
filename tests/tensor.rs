use std::num::NonZeroUsize;

use ndarray::{ArrayD, IxDyn};
use runtime::{Runtime, RuntimeConfig};
use tilenet::{
    DType, DistributedTensor, TagAllocator, TileErr, TileLayout,
    ops,
    tensor::{Element, distribution},
};

fn runtime(nodes: usize) -> Runtime {
    let nodes = NonZeroUsize::new(nodes).unwrap();
    Runtime::new(RuntimeConfig::new(nodes, NonZeroUsize::new(4))).unwrap()
}

fn tensor(
    rt: &Runtime,
    shape: &[usize],
    tile: &[usize],
    dtype: DType,
    tags: TagAllocator,
) -> (DistributedTensor, TagAllocator) {
    let layout = TileLayout::compute(shape, tile).unwrap();
    let dist = distribution::round_robin(&layout, rt.nodes());
    DistributedTensor::new(layout, dist, dtype, rt, tags).unwrap()
}

#[test]
fn grid_indices_round_trip() {
    let cases: [(&[usize], &[usize]); 4] = [
        (&[7], &[3]),
        (&[4, 6], &[4, 1]),
        (&[5, 3, 9], &[2, 3, 4]),
        (&[2, 2, 2, 2], &[1, 2, 1, 5]),
    ];

    for (shape, tile) in cases {
        let layout = TileLayout::compute(shape, tile).unwrap();
        for i in 0..layout.grid_size() {
            let idx = layout.linear_to_multi_index(i);
            assert_eq!(layout.multi_index_to_linear(&idx), i);
        }
    }
}

#[test]
fn invalid_tilings_are_rejected() {
    assert!(matches!(
        TileLayout::compute(&[4, 4], &[0, 2]),
        Err(TileErr::InvalidTiling { .. })
    ));
    assert!(matches!(
        TileLayout::compute(&[4, 4], &[2]),
        Err(TileErr::InvalidTiling { .. })
    ));
}

#[test]
fn every_tensor_gets_its_own_tag() {
    let rt = runtime(3);
    let mut tags = TagAllocator::new();
    let mut seen = Vec::new();

    for n in 1..20 {
        let (t, next) = tensor(&rt, &[n, 3], &[2, 2], DType::F32, tags);
        assert!(!seen.contains(&t.tag()));
        seen.push(t.tag());
        tags = next;
    }
}

fn round_trip<T: Element>(rt: &Runtime, host: ArrayD<T>, tags: TagAllocator) -> TagAllocator {
    let (t, tags) = tensor(rt, host.shape(), &[2, 3, 2], T::DTYPE, tags);
    t.load(host.view()).unwrap();
    assert_eq!(t.to_array::<T>().unwrap(), host);
    tags
}

#[test]
fn store_after_load_returns_the_host_array_for_every_dtype() {
    let rt = runtime(2);
    let shape = IxDyn(&[3, 5, 2]);
    let tags = TagAllocator::new();

    let tags = round_trip(&rt, ArrayD::from_shape_fn(shape.clone(), |i| i[1] as f32 / 3.), tags);
    let tags = round_trip(&rt, ArrayD::from_shape_fn(shape.clone(), |i| i[0] as f64 - 0.5), tags);
    let tags = round_trip(&rt, ArrayD::from_shape_fn(shape.clone(), |i| i[2] as i32 - 7), tags);
    let tags = round_trip(&rt, ArrayD::from_shape_fn(shape.clone(), |i| i[1] as i64 * 9), tags);
    let _ = round_trip(&rt, ArrayD::from_shape_fn(shape, |i| (i[0] + i[1]) % 2 == 0), tags);

    rt.wait_for_all().unwrap();
}

#[test]
fn load_rejects_a_mismatched_host_array() {
    let rt = runtime(1);
    let (t, _) = tensor(&rt, &[2, 2], &[1, 1], DType::F64, TagAllocator::new());

    let wrong_shape = ArrayD::<f64>::zeros(IxDyn(&[2, 3]));
    assert!(matches!(t.load(wrong_shape.view()), Err(TileErr::ShapeMismatch { .. })));

    let wrong_type = ArrayD::<f32>::zeros(IxDyn(&[2, 2]));
    assert!(matches!(t.load(wrong_type.view()), Err(TileErr::DTypeMismatch { .. })));
}

#[test]
fn released_tensors_reject_every_use() {
    let rt = runtime(2);
    let (a, tags) = tensor(&rt, &[4], &[2], DType::F64, TagAllocator::new());
    let (b, _) = tensor(&rt, &[4], &[2], DType::F64, tags);
    rt.wait_for_all().unwrap();

    a.unregister().unwrap();
    assert!(matches!(a.unregister(), Err(TileErr::UseAfterRelease(0))));
    assert!(matches!(ops::copy(&a, &b), Err(TileErr::UseAfterRelease(0))));
    assert!(matches!(a.to_array::<f64>(), Err(TileErr::UseAfterRelease(0))));
    assert!(matches!(a.mark_unused(), Err(TileErr::UseAfterRelease(0))));
}

#[test]
fn reusing_an_allocator_collides() {
    let rt = runtime(1);
    let tags = TagAllocator::new();
    let (_first, _) = tensor(&rt, &[2], &[2], DType::F32, tags);

    let layout = TileLayout::compute(&[2], &[2]).unwrap();
    let res = DistributedTensor::new(layout, vec![0], DType::F32, &rt, tags);
    assert!(matches!(res, Err(TileErr::IdentifierCollision(_))));
}

#[test]
fn distributions_must_cover_the_grid() {
    let rt = runtime(2);
    let layout = TileLayout::compute(&[4], &[2]).unwrap();

    let create = |dist: Vec<usize>| {
        DistributedTensor::new(layout.clone(), dist, DType::F32, &rt, TagAllocator::new())
    };

    assert!(matches!(create(vec![0]), Err(TileErr::InvalidDistribution(_))));
    assert!(matches!(create(vec![0, 2]), Err(TileErr::InvalidDistribution(_))));
    assert!(create(vec![1, 0]).is_ok());
}

#[test]
fn redistribution_moves_data_between_tilings() {
    let rt = runtime(3);
    let host = ArrayD::from_shape_fn(IxDyn(&[5, 7]), |i| (i[0] * 7 + i[1]) as f64);

    let (src, tags) = tensor(&rt, &[5, 7], &[2, 3], DType::F64, TagAllocator::new());
    let (dst, tags) = tensor(&rt, &[5, 7], &[3, 2], DType::F64, tags);
    let (whole, _) = tensor(&rt, &[5, 7], &[5, 7], DType::F64, tags);

    src.load(host.view()).unwrap();
    ops::redistribute(&src, &dst).unwrap();
    ops::gather(&dst, &whole).unwrap();
    assert_eq!(whole.to_array::<f64>().unwrap(), host);

    assert!(matches!(ops::scatter(&src, &dst), Err(TileErr::ShapeMismatch { .. })));
    assert!(rt.stats().transfers > 0);
}

#[test]
fn randn_does_not_depend_on_the_tiling() {
    let rt = runtime(2);
    let (a, tags) = tensor(&rt, &[6, 5], &[6, 5], DType::F64, TagAllocator::new());
    let (b, _) = tensor(&rt, &[6, 5], &[4, 2], DType::F64, tags);

    ops::randn(&a, 11, 1., 2.).unwrap();
    ops::randn(&b, 11, 1., 2.).unwrap();

    let (a, b) = (a.to_array::<f64>().unwrap(), b.to_array::<f64>().unwrap());
    assert_eq!(a, b);
    assert!(a.iter().any(|&v| v != a[[0, 0]]));
}

#[test]
fn operations_reject_aliased_operands() {
    let rt = runtime(1);
    let (t, _) = tensor(&rt, &[4], &[2], DType::F32, TagAllocator::new());

    assert!(matches!(ops::copy(&t, &t), Err(TileErr::Aliasing(_))));
    assert!(matches!(ops::add(1., &t, 1., &t), Err(TileErr::Aliasing(_))));
}
