//! Minimal feed-forward network used by the predictor ensemble.
//!
//! Inference is pure feed-forward (ReLU hidden layers, linear output);
//! training is plain stochastic gradient descent on mean squared error.
//! Inputs and targets are expected to be min-max normalised by the caller.

use ndarray::{Array1, Array2, Axis};
use rand::Rng;

struct DenseLayer {
    weights: Array2<f64>,
    biases: Array1<f64>,
}

impl DenseLayer {
    fn new(inputs: usize, outputs: usize, rng: &mut impl Rng) -> Self {
        // Uniform Glorot-style init keeps early epochs stable.
        let scale = (6.0 / (inputs + outputs) as f64).sqrt();
        let weights = Array2::from_shape_fn((outputs, inputs), |_| rng.gen_range(-scale..scale));
        let biases = Array1::zeros(outputs);
        Self { weights, biases }
    }
}

pub struct Mlp {
    layers: Vec<DenseLayer>,
    architecture: Vec<usize>,
}

fn relu(x: f64) -> f64 {
    x.max(0.0)
}

fn relu_gradient(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

impl Mlp {
    /// Build a network with the given hidden layer widths.
    pub fn new(inputs: usize, hidden: &[usize], outputs: usize, rng: &mut impl Rng) -> Self {
        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(inputs);
        sizes.extend_from_slice(hidden);
        sizes.push(outputs);

        let layers = sizes
            .windows(2)
            .map(|pair| DenseLayer::new(pair[0], pair[1], rng))
            .collect();
        Self { layers, architecture: hidden.to_vec() }
    }

    pub fn architecture(&self) -> &[usize] {
        &self.architecture
    }

    /// Forward pass. The final layer is linear.
    pub fn predict(&self, input: &Array1<f64>) -> Array1<f64> {
        let last = self.layers.len() - 1;
        let mut activation = input.clone();
        for (index, layer) in self.layers.iter().enumerate() {
            let z = layer.weights.dot(&activation) + &layer.biases;
            activation = if index == last { z } else { z.mapv(relu) };
        }
        activation
    }

    /// One SGD pass over the dataset; returns the mean squared error
    /// observed while traversing it.
    pub fn train_epoch(
        &mut self,
        inputs: &[Array1<f64>],
        targets: &[Array1<f64>],
        learning_rate: f64,
    ) -> f64 {
        let mut total_error = 0.0;
        let last = self.layers.len() - 1;

        for (input, target) in inputs.iter().zip(targets) {
            // Forward pass, keeping pre-activations for the backward pass.
            let mut activations = vec![input.clone()];
            let mut pre_activations = Vec::with_capacity(self.layers.len());
            for (index, layer) in self.layers.iter().enumerate() {
                let z = layer.weights.dot(&activations[index]) + &layer.biases;
                let a = if index == last { z.clone() } else { z.mapv(relu) };
                pre_activations.push(z);
                activations.push(a);
            }

            let output = &activations[self.layers.len()];
            let error = output - target;
            total_error += error.iter().map(|e| e * e).sum::<f64>() / error.len() as f64;

            // Backward pass.
            let mut delta = error;
            for index in (0..self.layers.len()).rev() {
                let upstream = self.layers[index].weights.t().dot(&delta);
                let gradient = delta
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&activations[index].view().insert_axis(Axis(0)));
                self.layers[index].weights =
                    &self.layers[index].weights - &(gradient * learning_rate);
                self.layers[index].biases =
                    &self.layers[index].biases - &(&delta * learning_rate);

                if index > 0 {
                    let mask = pre_activations[index - 1].mapv(relu_gradient);
                    delta = upstream * mask;
                }
            }
        }

        if inputs.is_empty() {
            0.0
        } else {
            total_error / inputs.len() as f64
        }
    }

    /// Mean squared error over a dataset without updating weights.
    pub fn evaluate(&self, inputs: &[Array1<f64>], targets: &[Array1<f64>]) -> f64 {
        if inputs.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for (input, target) in inputs.iter().zip(targets) {
            let output = self.predict(input);
            let error = &output - target;
            total += error.iter().map(|e| e * e).sum::<f64>() / error.len() as f64;
        }
        total / inputs.len() as f64
    }
}
