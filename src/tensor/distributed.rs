use std::{
    fmt,
    mem,
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, warn};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, Slice};
use parking_lot::{Mutex, RwLock};
use runtime::{BufferKey, KernelFault, Runtime, Task, TaskHandle};

use super::dtype::{DType, Element, TileData};
use crate::{
    error::{Result, TileErr},
    layout::TileLayout,
    tag::TagAllocator,
};

pub(crate) type TileRef = Arc<RwLock<TileData>>;

struct Shared {
    layout: TileLayout,
    distribution: Vec<usize>,
    tag: u64,
    dtype: DType,
    tiles: Vec<TileRef>,
    runtime: Runtime,
    released: AtomicBool,
}

/// A logical tensor split into tiles, each owned by one node.
///
/// Every tile is registered in the runtime under `(tag, tile index)`. Cloning yields another
/// handle to the same tiles.
#[derive(Clone)]
pub struct DistributedTensor {
    shared: Arc<Shared>,
}

impl fmt::Debug for DistributedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedTensor")
            .field("tag", &self.shared.tag)
            .field("shape", &self.shared.layout.shape())
            .field("tile", &self.shared.layout.tile_shape())
            .field("dtype", &self.shared.dtype)
            .finish()
    }
}

impl DistributedTensor {
    /// Creates a new zero filled `DistributedTensor` and registers its tiles.
    ///
    /// # Arguments
    /// * `layout` - The tiling of the tensor.
    /// * `distribution` - The owning node of every tile, in tile order.
    /// * `dtype` - The element type.
    /// * `runtime` - The runtime the tiles are registered in.
    /// * `tags` - The tag allocator, one tag is consumed.
    ///
    /// # Returns
    /// The tensor and the advanced allocator, or an error leaving nothing registered.
    pub fn new(
        layout: TileLayout,
        distribution: Vec<usize>,
        dtype: DType,
        runtime: &Runtime,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        if distribution.len() != layout.grid_size() {
            return Err(TileErr::InvalidDistribution(format!(
                "{} entries for a grid of {} tiles",
                distribution.len(),
                layout.grid_size()
            )));
        }

        let nodes = runtime.nodes();
        if let Some(node) = distribution.iter().find(|&&n| n >= nodes) {
            return Err(TileErr::InvalidDistribution(format!(
                "node {node} is out of range, the runtime has {nodes} node(s)"
            )));
        }

        let (tag, tags) = tags.next();

        let tiles: Vec<_> = (0..layout.grid_size())
            .map(|i| Arc::new(RwLock::new(TileData::zeros(dtype, layout.tile_nelems(i)))))
            .collect();

        runtime.register((0..layout.grid_size()).map(|i| {
            (
                BufferKey::new(tag, i),
                distribution[i],
                layout.tile_nelems(i) * dtype.size(),
            )
        }))?;

        debug!(tag = tag, tiles = layout.grid_size(); "tensor registered");

        let shared = Shared {
            layout,
            distribution,
            tag,
            dtype,
            tiles,
            runtime: runtime.clone(),
            released: AtomicBool::new(false),
        };

        Ok((
            Self {
                shared: Arc::new(shared),
            },
            tags,
        ))
    }

    /// Creates a new tensor with the same layout and distribution as `self`.
    pub fn like(&self, dtype: DType, tags: TagAllocator) -> Result<(Self, TagAllocator)> {
        Self::new(
            self.layout().clone(),
            self.distribution().to_vec(),
            dtype,
            self.runtime(),
            tags,
        )
    }

    pub fn tag(&self) -> u64 {
        self.shared.tag
    }

    pub fn dtype(&self) -> DType {
        self.shared.dtype
    }

    pub fn layout(&self) -> &TileLayout {
        &self.shared.layout
    }

    pub fn shape(&self) -> &[usize] {
        self.shared.layout.shape()
    }

    pub fn ndim(&self) -> usize {
        self.shared.layout.ndim()
    }

    pub fn distribution(&self) -> &[usize] {
        &self.shared.distribution
    }

    pub fn grid_size(&self) -> usize {
        self.shared.layout.grid_size()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.shared.runtime
    }

    /// Returns the runtime key of tile `i`.
    pub fn key(&self, i: usize) -> BufferKey {
        BufferKey::new(self.shared.tag, i)
    }

    pub fn keys(&self) -> Vec<BufferKey> {
        (0..self.grid_size()).map(|i| self.key(i)).collect()
    }

    /// Returns the node owning tile `i`.
    pub fn owner(&self, i: usize) -> usize {
        self.shared.distribution[i]
    }

    pub fn is_registered(&self) -> bool {
        !self.shared.released.load(Ordering::Acquire)
    }

    /// Returns whether both handles refer to the same buffers.
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn tile(&self, i: usize) -> TileRef {
        Arc::clone(&self.shared.tiles[i])
    }

    /// Returns the element ranges covered by tile `i`.
    pub(crate) fn tile_region(&self, i: usize) -> Vec<Range<usize>> {
        let layout = self.layout();
        let idx = layout.linear_to_multi_index(i);
        let offset = layout.tile_offset(&idx);

        offset
            .iter()
            .zip(layout.tile_shape_at_index(&idx))
            .map(|(&o, s)| o..o + s)
            .collect()
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if !self.is_registered() {
            return Err(TileErr::UseAfterRelease(self.shared.tag));
        }

        Ok(())
    }

    pub(crate) fn ensure_dtype(&self, dtype: DType) -> Result<()> {
        if self.dtype() != dtype {
            return Err(TileErr::DTypeMismatch {
                expected: self.dtype(),
                got: dtype,
            });
        }

        Ok(())
    }

    pub(crate) fn submit(&self, task: Task) -> Result<TaskHandle> {
        Ok(self.shared.runtime.submit(task)?)
    }

    /// Copies a host array into the tiles.
    ///
    /// Returns once the copies are enqueued, `host` is not referenced afterwards.
    ///
    /// # Arguments
    /// * `host` - An array with the tensor's shape and element type.
    ///
    /// # Returns
    /// `ShapeMismatch`, `DTypeMismatch` or `UseAfterRelease` on misuse.
    pub fn load<T: Element>(&self, host: ArrayViewD<'_, T>) -> Result<()> {
        self.ensure_live()?;
        self.ensure_dtype(T::DTYPE)?;

        if host.shape() != self.shape() {
            return Err(TileErr::shape("load", self.shape(), host.shape()));
        }

        for i in 0..self.grid_size() {
            let region = self.tile_region(i);
            let values: Vec<T> = host
                .slice_each_axis(|ax| Slice::from(region[ax.axis.index()].clone()))
                .iter()
                .copied()
                .collect();

            let tile = self.tile(i);
            self.submit(
                Task::new("load", self.owner(i), move || {
                    *tile.write() = T::wrap(values);
                    Ok(())
                })
                .write(self.key(i)),
            )?;
        }

        Ok(())
    }

    /// Copies the tiles into a host array, blocking until every pending write is done.
    ///
    /// # Arguments
    /// * `out` - An array with the tensor's shape and element type.
    ///
    /// # Returns
    /// `ShapeMismatch`, `DTypeMismatch`, `UseAfterRelease` on misuse, or the fault of a failed
    /// kernel this tensor depends on.
    pub fn store<T: Element>(&self, mut out: ArrayViewMutD<'_, T>) -> Result<()> {
        self.ensure_live()?;
        self.ensure_dtype(T::DTYPE)?;

        if out.shape() != self.shape() {
            return Err(TileErr::shape("store", self.shape(), out.shape()));
        }

        let mut staged = Vec::with_capacity(self.grid_size());
        for i in 0..self.grid_size() {
            let slot = Arc::new(Mutex::new(Vec::new()));
            let tile = self.tile(i);
            let s = Arc::clone(&slot);

            let handle = self.submit(
                Task::new("store", self.owner(i), move || {
                    let data = tile.read_recursive();
                    let values = T::slice(&data)
                        .ok_or_else(|| KernelFault::new("tile holds another element type"))?;
                    *s.lock() = values.to_vec();
                    Ok(())
                })
                .read(self.key(i)),
            )?;

            staged.push((handle, slot));
        }

        for (i, (handle, slot)) in staged.into_iter().enumerate() {
            handle.wait()?;

            let region = self.tile_region(i);
            let shape: Vec<_> = region.iter().map(|r| r.len()).collect();
            let values = mem::take(&mut *slot.lock());
            let view = ArrayViewD::from_shape(IxDyn(&shape), &values)
                .map_err(|_| TileErr::shape("store", &shape, &[values.len()]))?;

            out.slice_each_axis_mut(|ax| Slice::from(region[ax.axis.index()].clone()))
                .assign(&view);
        }

        Ok(())
    }

    /// Gathers the whole tensor into a new host array, see `store`.
    pub fn to_array<T: Element>(&self) -> Result<ArrayD<T>> {
        let mut out = ArrayD::from_elem(IxDyn(self.shape()), T::default());
        self.store(out.view_mut())?;
        Ok(out)
    }

    /// Hints the runtime that the current contents won't be read before the next write.
    ///
    /// Never blocks.
    pub fn mark_unused(&self) -> Result<()> {
        self.ensure_live()?;
        self.shared.runtime.wont_use(&self.keys());
        Ok(())
    }

    /// Releases the tiles.
    ///
    /// Every task referencing the tensor must have finished, call `Runtime::wait_for_all` first.
    ///
    /// # Returns
    /// `UseAfterRelease` if the tensor was already released or a pending task still uses it, in
    /// which case the tensor stays registered.
    pub fn unregister(&self) -> Result<()> {
        self.ensure_live()?;

        if let Err(e) = self.shared.runtime.unregister(&self.keys()) {
            warn!(tag = self.tag(); "rejected unregister: {e}");
            return Err(e.into());
        }

        self.shared.released.store(true, Ordering::Release);
        debug!(tag = self.tag(); "tensor unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};
    use runtime::RuntimeConfig;

    use super::*;
    use crate::tensor::distribution;

    fn tensor(shape: &[usize], tile: &[usize], dtype: DType) -> (Runtime, DistributedTensor) {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let layout = TileLayout::compute(shape, tile).unwrap();
        let dist = distribution::single_node(&layout, 0);
        let (t, _) = DistributedTensor::new(layout, dist, dtype, &rt, TagAllocator::new()).unwrap();
        (rt, t)
    }

    #[test]
    fn load_then_store_round_trips() {
        let (rt, t) = tensor(&[5, 3], &[2, 2], DType::F64);
        let host = ArrayD::from_shape_fn(IxDyn(&[5, 3]), |i| (i[0] * 3 + i[1]) as f64);

        t.load(host.view()).unwrap();
        assert_eq!(t.to_array::<f64>().unwrap(), host);
        rt.wait_for_all().unwrap();
    }

    #[test]
    fn wrong_distribution_is_rejected() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let layout = TileLayout::compute(&[4], &[2]).unwrap();
        let tags = TagAllocator::new();

        let err = DistributedTensor::new(layout.clone(), vec![0], DType::F32, &rt, tags)
            .unwrap_err();
        assert!(matches!(err, TileErr::InvalidDistribution(_)));

        let err = DistributedTensor::new(layout, vec![0, 1], DType::F32, &rt, tags).unwrap_err();
        assert!(matches!(err, TileErr::InvalidDistribution(_)));
    }

    #[test]
    fn shape_and_dtype_are_checked() {
        let (_rt, t) = tensor(&[2, 2], &[1, 2], DType::F32);

        let wrong_shape = ArrayD::<f32>::zeros(IxDyn(&[2, 3]));
        assert!(matches!(
            t.load(wrong_shape.view()),
            Err(TileErr::ShapeMismatch { .. })
        ));

        let wrong_type = ArrayD::<f64>::zeros(IxDyn(&[2, 2]));
        assert!(matches!(
            t.load(wrong_type.view()),
            Err(TileErr::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn clones_alias_the_same_tiles() {
        let (_rt, t) = tensor(&[3], &[3], DType::I32);
        let alias = t.clone();

        assert!(t.same_buffer(&alias));
        t.unregister().unwrap();
        assert!(!alias.is_registered());
    }
}
