use crate::error::{Result, TileErr};

/// The grid of tiles covering a logical shape.
///
/// Grid indices, element indices inside a tile and host arrays all use the same ordering: the
/// last axis varies fastest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    shape: Vec<usize>,
    tile: Vec<usize>,
    grid: Vec<usize>,
    grid_size: usize,
}

impl TileLayout {
    /// Computes the tiling grid of `shape`.
    ///
    /// Tile extents larger than the shape extent are clamped, leaving a single tile on that
    /// axis. The last tile along an axis may be shorter than the rest.
    ///
    /// # Arguments
    /// * `shape` - The logical shape, an empty slice is a scalar.
    /// * `tile_shape` - The base tile shape.
    ///
    /// # Returns
    /// The layout or `InvalidTiling` if any extent is zero or the amount of axes differ.
    pub fn compute(shape: &[usize], tile_shape: &[usize]) -> Result<Self> {
        if shape.len() != tile_shape.len()
            || shape.contains(&0)
            || tile_shape.contains(&0)
        {
            return Err(TileErr::InvalidTiling {
                shape: shape.to_vec(),
                tile: tile_shape.to_vec(),
            });
        }

        let tile: Vec<_> = shape
            .iter()
            .zip(tile_shape)
            .map(|(&s, &t)| t.min(s))
            .collect();

        let grid: Vec<_> = shape
            .iter()
            .zip(&tile)
            .map(|(&s, &t)| s.div_ceil(t))
            .collect();

        Ok(Self {
            grid_size: grid.iter().product(),
            shape: shape.to_vec(),
            tile,
            grid,
        })
    }

    /// A layout made of a single tile.
    pub fn single_tile(shape: &[usize]) -> Result<Self> {
        Self::compute(shape, shape)
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the base tile shape, after clamping.
    pub fn tile_shape(&self) -> &[usize] {
        &self.tile
    }

    /// Returns the amount of tiles along every axis.
    pub fn grid_shape(&self) -> &[usize] {
        &self.grid
    }

    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    /// Returns the amount of elements of the whole tensor.
    pub fn nelems(&self) -> usize {
        self.shape.iter().product()
    }

    /// Maps a linear tile index into a grid multi-index.
    ///
    /// # Arguments
    /// * `i` - A tile index in `[0, grid_size)`.
    pub fn linear_to_multi_index(&self, mut i: usize) -> Vec<usize> {
        debug_assert!(i < self.grid_size, "tile {i} is out of a grid of {}", self.grid_size);
        let mut idx = vec![0; self.grid.len()];

        for (slot, &extent) in idx.iter_mut().zip(&self.grid).rev() {
            *slot = i % extent;
            i /= extent;
        }

        idx
    }

    /// Maps a grid multi-index into a linear tile index.
    pub fn multi_index_to_linear(&self, idx: &[usize]) -> usize {
        idx.iter()
            .zip(&self.grid)
            .fold(0, |acc, (&i, &extent)| acc * extent + i)
    }

    /// Returns the element offset of the tile at grid position `idx`.
    pub fn tile_offset(&self, idx: &[usize]) -> Vec<usize> {
        idx.iter().zip(&self.tile).map(|(&i, &t)| i * t).collect()
    }

    /// Returns the actual shape of tile `i`, accounting for short trailing tiles.
    pub fn tile_shape_at(&self, i: usize) -> Vec<usize> {
        let idx = self.linear_to_multi_index(i);
        self.tile_shape_at_index(&idx)
    }

    pub fn tile_shape_at_index(&self, idx: &[usize]) -> Vec<usize> {
        idx.iter()
            .zip(&self.tile)
            .zip(&self.shape)
            .map(|((&i, &t), &s)| t.min(s - i * t))
            .collect()
    }

    pub fn tile_nelems(&self, i: usize) -> usize {
        self.tile_shape_at(i).iter().product()
    }

    /// Returns the layout with `axis` removed, the layout of a slice reduction along it.
    ///
    /// # Returns
    /// The reduced layout or `InvalidAxis`.
    pub fn remove_axis(&self, axis: usize) -> Result<Self> {
        self.check_axis(axis)?;

        let mut shape = self.shape.clone();
        let mut tile = self.tile.clone();
        shape.remove(axis);
        tile.remove(axis);

        Self::compute(&shape, &tile)
    }

    /// Returns the one dimensional layout of `axis`, the layout of a fiber along it.
    ///
    /// # Returns
    /// The fiber layout or `InvalidAxis`.
    pub fn fiber(&self, axis: usize) -> Result<Self> {
        self.check_axis(axis)?;
        Self::compute(&self.shape[axis..=axis], &self.tile[axis..=axis])
    }

    pub(crate) fn check_axis(&self, axis: usize) -> Result<()> {
        if axis >= self.ndim() {
            return Err(TileErr::InvalidAxis {
                axis,
                ndim: self.ndim(),
            });
        }

        Ok(())
    }
}
