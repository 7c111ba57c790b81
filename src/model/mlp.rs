use crate::{
    error::Result,
    layer::{Act, ActKind, Linear, LinearConfig},
    model::Model,
    tag::TagAllocator,
    tensor::TensorMoments,
};

/// The shape of a multilayer perceptron.
#[derive(Debug, Clone, PartialEq)]
pub struct MlpConfig {
    /// The widths of the hidden layers.
    pub hidden: Vec<usize>,
    pub output: usize,
    /// The tile extent of every layer's last axis.
    pub tile: usize,
    pub act: ActKind,
    pub seed: u64,
}

/// Builds `Linear` layers of the given widths, each hidden one followed by an activation.
///
/// # Arguments
/// * `input` - The `[B.., in_features]` input of the model.
/// * `config` - The widths and tiling.
/// * `tags` - The tag allocator.
///
/// # Returns
/// The model and the advanced allocator.
pub fn mlp(
    input: TensorMoments,
    config: &MlpConfig,
    mut tags: TagAllocator,
) -> Result<(Model, TagAllocator)> {
    let mut model = Model::new(input);

    let widths = config.hidden.iter().copied().chain([config.output]);
    let layers = config.hidden.len() + 1;

    for (i, width) in widths.enumerate() {
        let linear_config = LinearConfig {
            out_features: width,
            out_tile: config.tile.min(width),
            bias: true,
            seed: config.seed,
        };

        let (linear, next) = Linear::generate_simple(model.output(), linear_config, tags)?;
        model.push(linear);
        tags = next;

        if i + 1 < layers {
            let (act, next) = Act::generate_simple(model.output(), config.act, tags)?;
            model.push(act);
            tags = next;
        }
    }

    Ok((model, tags))
}
