use std::env;

use anyhow::Context;
use log::info;
use ndarray::{Array2, ArrayD};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;
use runtime::Runtime;

use tilenet::{
    DType, Pipeline, TagAllocator, TensorMoments, TileLayout,
    config::RunConfig,
    loss::Frob,
    model,
    optim::{Adam, Optimizer, Sgd},
    pipeline::{Batches, Placement},
    tensor::distribution,
};

const CONFIG_VAR: &str = "TILENET_CONFIG";

/// Samples `samples` inputs and the targets of a fixed random linear map.
fn synthetic(config: &RunConfig) -> (ArrayD<f32>, ArrayD<f32>) {
    let mut rng = StdRng::seed_from_u64(config.training.seed);
    let samples = config.training.samples.get();
    let (input, output) = (config.model.input.get(), config.model.output.get());

    let x = Array2::from_shape_simple_fn((samples, input), || rng.sample::<f32, _>(StandardNormal));
    let w = Array2::from_shape_simple_fn((input, output), || rng.sample::<f32, _>(StandardNormal));
    let y = x.dot(&w);

    (x.into_dyn(), y.into_dyn())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::var(CONFIG_VAR) {
        Ok(path) => RunConfig::from_file(&path).with_context(|| format!("reading {path}"))?,
        Err(_) => RunConfig::default(),
    };
    info!("running {config:?}");

    let runtime = Runtime::new(config.runtime_config())?;
    let tags = TagAllocator::new();

    let minibatch = config.training.minibatch.get();
    let tile = config.model.tile.get();
    let (input, output) = (config.model.input.get(), config.model.output.get());

    let input_layout = TileLayout::compute(&[minibatch, input], &[minibatch, tile])?;
    let input_dist = distribution::round_robin(&input_layout, runtime.nodes());
    let (x, tags) =
        TensorMoments::generate(input_layout, input_dist, DType::F32, false, &runtime, tags)?;

    let (model, tags) = model::mlp(x, &config.mlp_config(), tags)?;
    let (loss, tags) = Frob::generate(model.output(), tags)?;

    let params: Vec<_> = model.parameters().into_iter().map(|p| p.moments).collect();
    let optimizer: Box<dyn Optimizer>;
    let tags = match (
        config.training.optimizer.sgd_params(),
        config.training.optimizer.adam_params(),
    ) {
        (Some(hp), _) => {
            let (sgd, tags) = Sgd::generate(params, hp, tags)?;
            optimizer = Box::new(sgd);
            tags
        }
        (None, Some(hp)) => {
            let (adam, tags) = Adam::generate(params, hp, tags)?;
            optimizer = Box::new(adam);
            tags
        }
        (None, None) => anyhow::bail!("no optimizer configured"),
    };

    let (xs, ys) = synthetic(&config);
    let target_layout =
        TileLayout::compute(&[minibatch, output], &[minibatch, tile.min(output)])?;
    let (batches, _) = Batches::from_host(
        xs.view(),
        ys.view(),
        config.training.batch.get(),
        minibatch,
        &Placement::of(model.input().value()),
        &Placement::new(
            target_layout.clone(),
            distribution::round_robin(&target_layout, runtime.nodes()),
        ),
        &runtime,
        tags,
    )?;

    let mut pipeline = Pipeline::new(
        model,
        optimizer,
        Box::new(loss),
        batches,
        config.training.epochs,
        config.training.warmup_epochs,
    );
    pipeline.train()?;

    let losses = pipeline.epoch_losses();
    let samples = config.training.samples.get() as f64;
    for (epoch, loss) in losses.iter().enumerate() {
        info!(epoch = epoch, loss = loss / samples; "mean loss");
    }

    let stats = pipeline.stats();
    let rt = runtime.stats();
    info!(
        cycles = stats.cycles,
        steps = stats.steps,
        tasks = rt.executed,
        transfers = rt.transfers;
        "training done"
    );

    pipeline.unregister()?;
    Ok(())
}
