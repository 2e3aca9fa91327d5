//! Dense feed-forward regression network
//!
//! A plain multilayer perceptron with ReLU hidden layers, a linear output
//! layer and inverted dropout in training mode. Weights are He-initialized
//! from an injected random source; biases start at zero.

use crate::matrix::{all_finite, check_dim, he_normal, mse, outer, relu, relu_derivative};
use crate::replay::Sample;
use ndarray::{Array1, Array2, ArrayView1};
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use specializer_core::rng::next_float;
use specializer_core::{CoreError, Result, NUM_OPTIMIZATIONS};
use tracing::trace;

use crate::features::FEATURE_DIM;

/// Layer activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Linear,
}

/// One fully connected layer; `weights` has shape `(outputs, inputs)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub activation: Activation,
    /// Drop probability applied to this layer's output in training mode
    pub dropout: f64,
}

impl DenseLayer {
    fn new(
        inputs: usize,
        outputs: usize,
        activation: Activation,
        dropout: f64,
        rng: &mut dyn RngCore,
    ) -> Self {
        Self {
            weights: he_normal(outputs, inputs, rng),
            biases: Array1::zeros(outputs),
            activation,
            dropout,
        }
    }

    pub fn inputs(&self) -> usize {
        self.weights.ncols()
    }

    pub fn outputs(&self) -> usize {
        self.weights.nrows()
    }
}

/// Network shape and training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `[inputs, hidden.., outputs]`
    pub layer_sizes: Vec<usize>,
    /// One drop probability per hidden layer
    pub dropout: Vec<f64>,
    pub learning_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            layer_sizes: vec![FEATURE_DIM, 128, 64, 32, NUM_OPTIMIZATIONS],
            dropout: vec![0.3, 0.2, 0.1],
            learning_rate: 1e-3,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.layer_sizes.len() < 2 {
            return Err(CoreError::invalid_config(
                "layer_sizes",
                "need at least an input and an output layer",
            ));
        }
        if self.layer_sizes.iter().any(|&n| n == 0) {
            return Err(CoreError::invalid_config("layer_sizes", "layers must be non-empty"));
        }
        if self.dropout.len() != self.layer_sizes.len() - 2 {
            return Err(CoreError::invalid_config(
                "dropout",
                format!("expected {} hidden dropout rates", self.layer_sizes.len() - 2),
            ));
        }
        if self.dropout.iter().any(|&p| !(0.0..1.0).contains(&p)) {
            return Err(CoreError::invalid_config("dropout", "rates must be in [0, 1)"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(CoreError::invalid_config("learning_rate", "must be positive"));
        }
        Ok(())
    }
}

/// Serialized weights, biases, layer config and learning rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub layer_sizes: Vec<usize>,
    pub layers: Vec<DenseLayer>,
    pub learning_rate: f64,
}

/// Regression model mapping feature vectors to per-optimization speedups.
///
/// The learner only talks to the network through this trait, so hosts and
/// tests can substitute their own model.
pub trait SpeedupModel: Send {
    fn input_dim(&self) -> usize;

    fn output_dim(&self) -> usize;

    /// Inference-mode forward pass
    fn forward(&self, input: &[f64]) -> Result<Vec<f64>>;

    /// One SGD step on a single sample; returns the pre-update loss
    fn train_one(&mut self, input: &[f64], target: &[f64], rng: &mut dyn RngCore) -> Result<f64>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);

    fn snapshot(&self) -> NetworkSnapshot;

    fn restore(&mut self, snapshot: &NetworkSnapshot) -> Result<()>;

    /// Draw fresh weights
    fn reinitialize(&mut self, rng: &mut dyn RngCore);

    /// Shuffled epochs of `train_one`; returns the mean loss of each epoch
    fn train_batch(
        &mut self,
        samples: &[Sample],
        epochs: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<f64>> {
        let mut history = Vec::with_capacity(epochs);
        if samples.is_empty() {
            return Ok(history);
        }

        let mut order: Vec<usize> = (0..samples.len()).collect();
        for _ in 0..epochs {
            order.shuffle(&mut *rng);
            let mut total = 0.0;
            for &i in &order {
                let sample = &samples[i];
                total += self.train_one(&sample.features, &sample.observed_speedups, &mut *rng)?;
            }
            history.push(total / samples.len() as f64);
        }
        Ok(history)
    }
}

/// Activations recorded during a forward pass, needed for backprop
struct ForwardTrace {
    /// Input fed to each layer
    inputs: Vec<Array1<f64>>,
    /// Pre-activation output of each layer
    pre_activations: Vec<Array1<f64>>,
    /// Dropout mask applied to each layer's output, if any
    masks: Vec<Option<Array1<f64>>>,
    output: Array1<f64>,
}

/// Feed-forward network `[F, H1, .., K]`
#[derive(Debug, Clone)]
pub struct DenseNetwork {
    layers: Vec<DenseLayer>,
    learning_rate: f64,
    config: NetworkConfig,
}

impl DenseNetwork {
    /// Create a network with freshly initialized weights
    pub fn new(config: NetworkConfig, rng: &mut dyn RngCore) -> Result<Self> {
        config.validate()?;
        let layers = Self::init_layers(&config, rng);
        Ok(Self {
            layers,
            learning_rate: config.learning_rate,
            config,
        })
    }

    fn init_layers(config: &NetworkConfig, rng: &mut dyn RngCore) -> Vec<DenseLayer> {
        let last = config.layer_sizes.len() - 2;
        config
            .layer_sizes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                if i == last {
                    DenseLayer::new(pair[0], pair[1], Activation::Linear, 0.0, rng)
                } else {
                    DenseLayer::new(pair[0], pair[1], Activation::Relu, config.dropout[i], rng)
                }
            })
            .collect()
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Number of trainable parameters
    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.biases.len())
            .sum()
    }

    fn run(&self, input: &[f64], mut dropout_rng: Option<&mut dyn RngCore>) -> Result<ForwardTrace> {
        check_dim(self.input_dim(), input.len())?;

        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        let mut masks = Vec::with_capacity(self.layers.len());
        let mut activation = Array1::from_vec(input.to_vec());

        for layer in &self.layers {
            let z = layer.weights.dot(&activation) + &layer.biases;
            let mut out = match layer.activation {
                Activation::Relu => relu(&z),
                Activation::Linear => z.clone(),
            };

            let mut mask = None;
            if let Some(rng) = dropout_rng.as_deref_mut() {
                if layer.dropout > 0.0 {
                    let keep = 1.0 - layer.dropout;
                    let m = Array1::from_shape_simple_fn(out.len(), || {
                        if next_float(&mut *rng) >= layer.dropout {
                            1.0 / keep
                        } else {
                            0.0
                        }
                    });
                    out = out * &m;
                    mask = Some(m);
                }
            }

            inputs.push(activation);
            pre_activations.push(z);
            masks.push(mask);
            activation = out;
        }

        if !all_finite(activation.iter()) {
            return Err(CoreError::numerical_instability(
                "network produced a non-finite output",
            ));
        }

        Ok(ForwardTrace {
            inputs,
            pre_activations,
            masks,
            output: activation,
        })
    }

    /// Per-layer `(weight, bias)` gradients of the MSE loss
    fn backward(&self, trace: &ForwardTrace, target: ArrayView1<f64>) -> Vec<(Array2<f64>, Array1<f64>)> {
        let n = self.layers.len();
        let scale = 2.0 / trace.output.len() as f64;
        let mut delta = (&trace.output - &target) * scale;
        let mut grads = Vec::with_capacity(n);

        for l in (0..n).rev() {
            let grad_w = outer(&delta, &trace.inputs[l]);
            let grad_b = delta.clone();

            if l > 0 {
                let mut prev = self.layers[l].weights.t().dot(&delta);
                if let Some(mask) = &trace.masks[l - 1] {
                    prev = prev * mask;
                }
                if self.layers[l - 1].activation == Activation::Relu {
                    prev = prev * relu_derivative(&trace.pre_activations[l - 1]);
                }
                delta = prev;
            }

            grads.push((grad_w, grad_b));
        }

        grads.reverse();
        grads
    }
}

impl SpeedupModel for DenseNetwork {
    fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, DenseLayer::inputs)
    }

    fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, DenseLayer::outputs)
    }

    fn forward(&self, input: &[f64]) -> Result<Vec<f64>> {
        Ok(self.run(input, None)?.output.to_vec())
    }

    fn train_one(&mut self, input: &[f64], target: &[f64], rng: &mut dyn RngCore) -> Result<f64> {
        check_dim(self.output_dim(), target.len())?;
        let trace = self.run(input, Some(rng))?;
        let target = ArrayView1::from(target);
        let loss = mse(&trace.output, target);
        if !loss.is_finite() {
            return Err(CoreError::numerical_instability("loss is not finite"));
        }

        let grads = self.backward(&trace, target);
        let finite = grads
            .iter()
            .all(|(w, b)| all_finite(w.iter()) && all_finite(b.iter()));
        if !finite {
            return Err(CoreError::numerical_instability("gradient is not finite"));
        }

        // Weights only change once every gradient is known to be finite.
        let lr = self.learning_rate;
        for (layer, (grad_w, grad_b)) in self.layers.iter_mut().zip(grads.iter()) {
            layer.weights.scaled_add(-lr, grad_w);
            layer.biases.scaled_add(-lr, grad_b);
        }

        trace!(loss, lr, "train step");
        Ok(loss)
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            layer_sizes: self.config.layer_sizes.clone(),
            layers: self.layers.clone(),
            learning_rate: self.learning_rate,
        }
    }

    fn restore(&mut self, snapshot: &NetworkSnapshot) -> Result<()> {
        if snapshot.layer_sizes != self.config.layer_sizes
            || snapshot.layers.len() != self.layers.len()
        {
            return Err(CoreError::snapshot(format!(
                "network shape {:?} does not match {:?}",
                snapshot.layer_sizes, self.config.layer_sizes
            )));
        }
        for (layer, pair) in snapshot.layers.iter().zip(snapshot.layer_sizes.windows(2)) {
            if layer.inputs() != pair[0]
                || layer.outputs() != pair[1]
                || layer.biases.len() != pair[1]
            {
                return Err(CoreError::snapshot("layer dimensions are inconsistent"));
            }
        }
        self.layers = snapshot.layers.clone();
        self.learning_rate = snapshot.learning_rate;
        Ok(())
    }

    fn reinitialize(&mut self, rng: &mut dyn RngCore) {
        self.layers = Self::init_layers(&self.config, rng);
        self.learning_rate = self.config.learning_rate;
    }
}
