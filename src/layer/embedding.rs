use log::debug;

use super::{Layer, Parameter, moments, param_seed};
use crate::{
    error::{Result, TileErr},
    layout::TileLayout,
    ops,
    tag::TagAllocator,
    tensor::{DType, DistributedTensor, TensorMoments},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbeddingConfig {
    /// The amount of rows of the table.
    pub vocab: usize,
    /// The width of a row.
    pub embed: usize,
    /// The tile extent along the width.
    pub embed_tile: usize,
    pub dtype: DType,
    pub seed: u64,
}

/// Looks up rows of a `[vocab, embed]` table for an `i64` index tensor.
///
/// Indices out of `[0, vocab)` make the lookup fault, reported by the next barrier.
#[derive(Debug)]
pub struct Embedding {
    index: TensorMoments,
    y: TensorMoments,
    table: TensorMoments,
}

impl Embedding {
    /// Creates a new `Embedding` layer.
    ///
    /// Consumes tags for the output value and gradient, then the table and its gradient. The
    /// table is drawn from `N(0, 1)`.
    ///
    /// # Arguments
    /// * `index` - The `[B..]` row numbers.
    /// * `config` - The table's shape and element type.
    /// * `tags` - The tag allocator.
    pub fn generate_simple(
        index: &TensorMoments,
        config: EmbeddingConfig,
        tags: TagAllocator,
    ) -> Result<(Self, TagAllocator)> {
        let iv = index.value();
        iv.ensure_dtype(DType::I64)?;

        if !config.dtype.is_float() {
            return Err(TileErr::UnsupportedDType {
                op: "embedding",
                dtype: config.dtype,
            });
        }

        let mut shape = iv.shape().to_vec();
        let mut tile = iv.layout().tile_shape().to_vec();
        shape.push(config.embed);
        tile.push(config.embed_tile);

        let y_layout = TileLayout::compute(&shape, &tile)?;
        let table_layout =
            TileLayout::compute(&[config.vocab, config.embed], &[config.vocab, config.embed_tile])?;

        let (y, tags) = moments(y_layout, iv, config.dtype, true, tags)?;
        let (table, tags) = moments(table_layout, iv, config.dtype, true, tags)?;

        ops::randn(table.value(), param_seed(config.seed, table.value()), 0., 1.)?;

        Ok((
            Self {
                index: index.clone(),
                y,
                table,
            },
            tags,
        ))
    }

    pub fn output(&self) -> &TensorMoments {
        &self.y
    }

    pub fn table(&self) -> &TensorMoments {
        &self.table
    }
}

impl Layer for Embedding {
    fn name(&self) -> &'static str {
        "embedding"
    }

    fn outputs(&self) -> Vec<TensorMoments> {
        vec![self.y.clone()]
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![Parameter::new("table", self.table.clone())]
    }

    fn temporaries(&self) -> Vec<DistributedTensor> {
        Vec::new()
    }

    fn forward_async(&mut self) -> Result<()> {
        let y = self.y.value();
        ops::embedding(self.index.value(), self.table.value(), y)?;

        debug!(tag = y.tag(); "embedding forward enqueued");
        Ok(())
    }

    fn backward_async(&mut self) -> Result<()> {
        let dy = self.y.grad_or_err()?;
        ops::embedding_backward(self.index.value(), dy, self.table.grad_or_err()?)?;

        debug!(tag = dy.tag(); "embedding backward enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn, array};
    use runtime::{Runtime, RuntimeConfig, RuntimeErr};

    use super::*;
    use crate::tensor::distribution;

    fn setup(rt: &Runtime) -> (TensorMoments, Embedding) {
        let layout = TileLayout::compute(&[3], &[2]).unwrap();
        let dist = distribution::round_robin(&layout, rt.nodes());
        let (index, tags) =
            TensorMoments::generate(layout, dist, DType::I64, false, rt, TagAllocator::new())
                .unwrap();

        let config = EmbeddingConfig {
            vocab: 4,
            embed: 2,
            embed_tile: 1,
            dtype: DType::F64,
            seed: 3,
        };
        let (layer, _) = Embedding::generate_simple(&index, config, tags).unwrap();
        (index, layer)
    }

    #[test]
    fn gathers_rows_and_scatters_gradients() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let (index, mut layer) = setup(&rt);

        let table = ArrayD::from_shape_fn(IxDyn(&[4, 2]), |i| (i[0] * 10 + i[1]) as f64);
        layer.table().value().load(table.view()).unwrap();
        index.value().load(array![2i64, 0, 2].into_dyn().view()).unwrap();

        layer.forward_async().unwrap();
        let y = layer.output().value().to_array::<f64>().unwrap();
        assert_eq!(y, array![[20., 21.], [0., 1.], [20., 21.]].into_dyn());

        let dy = ArrayD::from_elem(IxDyn(&[3, 2]), 1.);
        layer.output().grad().unwrap().load(dy.view()).unwrap();
        layer.backward_async().unwrap();

        let dt = layer.table().grad().unwrap().to_array::<f64>().unwrap();
        assert_eq!(dt, array![[1., 1.], [0., 0.], [2., 2.], [0., 0.]].into_dyn());
    }

    #[test]
    fn out_of_range_rows_fault_at_the_barrier() {
        let rt = Runtime::new(RuntimeConfig::single_node()).unwrap();
        let (index, mut layer) = setup(&rt);

        index.value().load(array![0i64, 4, 1].into_dyn().view()).unwrap();
        layer.forward_async().unwrap();

        assert!(matches!(rt.wait_for_all(), Err(RuntimeErr::KernelFault { .. })));
        assert!(rt.wait_for_all().is_ok());
    }
}
