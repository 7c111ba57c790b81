//! Ordered compositions of layers.

mod mlp;

pub use mlp::{MlpConfig, mlp};

use log::{debug, warn};
use ndarray::ArrayD;

use crate::{
    error::{Result, TileErr},
    layer::{Layer, Parameter},
    tensor::{Element, TensorMoments},
};

/// A sequence of layers chained through activations.
///
/// `activations[0]` is the external input, the following ones are the outputs of the layers in
/// the order they were pushed.
pub struct Model {
    layers: Vec<Box<dyn Layer>>,
    activations: Vec<TensorMoments>,
}

impl Model {
    /// Creates a new `Model` with no layers.
    ///
    /// # Arguments
    /// * `input` - The moments the first layer reads.
    pub fn new(input: TensorMoments) -> Self {
        Self {
            layers: Vec::new(),
            activations: vec![input],
        }
    }

    /// Appends a layer and its outputs.
    pub fn push<L: Layer + 'static>(&mut self, layer: L) {
        self.activations.extend(layer.outputs());
        self.layers.push(Box::new(layer));
    }

    pub fn input(&self) -> &TensorMoments {
        &self.activations[0]
    }

    /// Returns the last activation.
    pub fn output(&self) -> &TensorMoments {
        let last = self.activations.len() - 1;
        &self.activations[last]
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn activations(&self) -> &[TensorMoments] {
        &self.activations
    }

    /// Returns the parameters of every layer, in layer order.
    pub fn parameters(&self) -> Vec<Parameter> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    /// Returns the parameters named `"{layer index}.{layer}.{parameter}"`, in layer order.
    pub fn named_parameters(&self) -> Vec<(String, TensorMoments)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| {
                l.parameters()
                    .into_iter()
                    .map(move |p| (format!("{i}.{}.{}", l.name(), p.name), p.moments))
            })
            .collect()
    }

    /// Enqueues every layer's forward pass, in order.
    pub fn forward_async(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            layer.forward_async()?;
        }

        debug!(layers = self.layers.len(); "model forward enqueued");
        Ok(())
    }

    /// Enqueues every layer's backward pass, in reverse order.
    pub fn backward_async(&mut self) -> Result<()> {
        for layer in self.layers.iter_mut().rev() {
            layer.backward_async()?;
        }

        debug!(layers = self.layers.len(); "model backward enqueued");
        Ok(())
    }

    /// Zero fills every parameter gradient.
    pub fn clear_gradients(&self) -> Result<()> {
        self.parameters()
            .iter()
            .try_for_each(|p| p.moments.clear_grad())
    }

    /// Zero fills every activation gradient.
    pub fn clear_activation_gradients(&self) -> Result<()> {
        self.activations.iter().try_for_each(|a| a.clear_grad())
    }

    /// Unregisters the layers' parameters and temporaries, then the activations.
    ///
    /// Every tensor is attempted even after a failure.
    ///
    /// # Returns
    /// The first error met.
    pub fn unregister(&self) -> Result<()> {
        let layers = self.layers.iter().map(|l| l.unregister());
        let activations = self.activations.iter().map(|a| a.unregister());

        let mut first = Ok(());
        for res in layers.chain(activations) {
            if let Err(e) = res {
                warn!("model unregister failed: {e}");
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }

        first
    }

    /// Copies every parameter value to the host, blocking until pending writes are done.
    pub fn export_parameters<T: Element>(&self) -> Result<Vec<(String, ArrayD<T>)>> {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| Ok((name, p.value().to_array()?)))
            .collect()
    }

    /// Loads parameter values exported by `export_parameters`.
    ///
    /// # Returns
    /// `InvalidConfig` when the names or their amount differ from this model's, `ShapeMismatch`
    /// when an array doesn't fit its parameter. Nothing is loaded on error.
    pub fn import_parameters<T: Element>(&self, params: &[(String, ArrayD<T>)]) -> Result<()> {
        let named = self.named_parameters();
        if named.len() != params.len() {
            return Err(TileErr::InvalidConfig(format!(
                "expected {} parameters, got {}",
                named.len(),
                params.len()
            )));
        }

        for ((name, p), (given, array)) in named.iter().zip(params) {
            if name != given {
                return Err(TileErr::InvalidConfig(format!(
                    "expected parameter {name}, got {given}"
                )));
            }

            if p.shape() != array.shape() {
                return Err(TileErr::shape("import_parameters", p.shape(), array.shape()));
            }
        }

        for ((_, p), (_, array)) in named.iter().zip(params) {
            p.value().load(array.view())?;
        }

        Ok(())
    }
}
