//! The training loop.

mod data;

pub use data::{Batches, Minibatch, Placement};

use log::{debug, info};

use crate::{
    error::{Result, TileErr},
    loss::Loss,
    model::Model,
    ops,
    optim::Optimizer,
};

/// The phases a `Pipeline` goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Warmup,
    Training,
    Done,
}

/// Counters of the work a `Pipeline` enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Forward and backward passes, one per minibatch.
    pub cycles: usize,
    /// Optimizer steps, one per batch.
    pub steps: usize,
}

/// Trains a model over a set of batches.
///
/// Gradients are accumulated over the minibatches of a batch and applied by a single optimizer
/// step at its end.
pub struct Pipeline {
    model: Model,
    optimizer: Box<dyn Optimizer>,
    loss: Box<dyn Loss>,
    batches: Batches,

    epochs: usize,
    warmup_epochs: usize,

    state: PipelineState,
    stats: PipelineStats,
    epoch_losses: Vec<f64>,
}

impl Pipeline {
    /// Creates a new `Pipeline`.
    ///
    /// # Arguments
    /// * `model` - The model to train.
    /// * `optimizer` - Updates the model's parameters.
    /// * `loss` - Seeds the gradient of the model's output.
    /// * `batches` - The training data.
    /// * `epochs` - The amount of training epochs.
    /// * `warmup_epochs` - The amount of epochs run before the training ones.
    pub fn new(
        model: Model,
        optimizer: Box<dyn Optimizer>,
        loss: Box<dyn Loss>,
        batches: Batches,
        epochs: usize,
        warmup_epochs: usize,
    ) -> Self {
        Self {
            model,
            optimizer,
            loss,
            batches,
            epochs,
            warmup_epochs,
            state: PipelineState::Idle,
            stats: PipelineStats::default(),
            epoch_losses: Vec::new(),
        }
    }

    /// Enqueues every epoch without waiting for any of them.
    ///
    /// # Returns
    /// `InvalidConfig` unless the pipeline is idle.
    pub fn train_async(&mut self) -> Result<()> {
        self.run(false)
    }

    /// Runs every epoch, waiting for each one to finish and recording its loss.
    ///
    /// # Returns
    /// `InvalidConfig` unless the pipeline is idle, or the first kernel fault.
    pub fn train(&mut self) -> Result<()> {
        self.run(true)
    }

    fn run(&mut self, blocking: bool) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(TileErr::InvalidConfig(format!(
                "the pipeline can only run once, it is {:?}",
                self.state
            )));
        }

        self.model.clear_gradients()?;

        self.set_state(PipelineState::Warmup);
        for epoch in 0..self.warmup_epochs {
            self.epoch(epoch, blocking)?;
        }

        self.set_state(PipelineState::Training);
        for epoch in 0..self.epochs {
            self.epoch(epoch, blocking)?;

            if blocking {
                let loss = self.loss.value()?;
                info!(epoch = epoch, loss = loss; "epoch done");
                self.epoch_losses.push(loss);
            }
        }

        self.set_state(PipelineState::Done);
        Ok(())
    }

    fn set_state(&mut self, state: PipelineState) {
        info!("pipeline {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn epoch(&mut self, epoch: usize, blocking: bool) -> Result<()> {
        self.loss.clear_value()?;

        for (i, batch) in self.batches.batches().iter().enumerate() {
            for minibatch in batch {
                ops::copy(&minibatch.input, self.model.input().value())?;
                self.model.forward_async()?;
                self.model.clear_activation_gradients()?;
                self.loss.seed_gradient(self.model.output(), &minibatch.target)?;
                self.model.backward_async()?;
                self.stats.cycles += 1;
            }

            self.optimizer.step()?;
            self.model.clear_gradients()?;
            self.stats.steps += 1;

            debug!(epoch = epoch, batch = i; "batch enqueued");
        }

        if blocking {
            self.model.input().value().runtime().wait_for_all()?;
        }

        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// The loss of every training epoch run by `train`.
    pub fn epoch_losses(&self) -> &[f64] {
        &self.epoch_losses
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn loss(&self) -> &dyn Loss {
        self.loss.as_ref()
    }

    pub fn batches(&self) -> &Batches {
        &self.batches
    }

    /// Unregisters the batches, the loss, the optimizer's state and the model, waiting for
    /// pending work first.
    pub fn unregister(&self) -> Result<()> {
        self.model.input().value().runtime().wait_for_all()?;

        let results = [
            self.batches.unregister(),
            self.loss.unregister(),
            self.optimizer.unregister(),
            self.model.unregister(),
        ];

        results.into_iter().collect()
    }
}
