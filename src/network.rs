use std::iter::zip;

use itertools::izip;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rayon::prelude::*;

use crate::loss::Loss;
use crate::mnist::Batch;

fn sigmoid(x: f32) -> f32 {
    if x < -40.0 {
        0.0
    } else if x > 40.0 {
        1.0
    } else {
        1.0 / (1.0 + f32::exp(-x))
    }
}

fn sigmoid_prime(x: f32) -> f32 {
    sigmoid(x) * (1.0 - sigmoid(x))
}

/// Dense classifier: sigmoid hidden layers, linear output layer, so the
/// final activations are raw logits.
pub struct Network {
    layer_sizes: Vec<usize>,
    biases: Vec<DVector<f32>>,
    weights: Vec<DMatrix<f32>>,
}

impl Network {
    pub fn new_random(layer_sizes: &[usize], rng: &mut impl Rng) -> Self {
        assert!(layer_sizes.len() >= 2, "need an input and an output layer");

        let biases: Vec<_> = layer_sizes
            .iter()
            .skip(1)
            .map(|&nr| DVector::from_fn(nr, |_, _| rng.gen::<f32>() * 2.0 - 1.0))
            .collect();

        let weights: Vec<_> = zip(layer_sizes.iter(), layer_sizes.iter().skip(1))
            .map(|(&left_layer_len, &right_layer_len)| {
                DMatrix::from_fn(right_layer_len, left_layer_len, |_, _| {
                    rng.gen::<f32>() * 2.0 - 1.0
                })
            })
            .collect();

        Self::from_parts(biases, weights)
    }

    /// Builds a network from explicit parameters; layer sizes are derived
    /// from the weight shapes.
    pub fn from_parts(biases: Vec<DVector<f32>>, weights: Vec<DMatrix<f32>>) -> Self {
        assert!(!weights.is_empty(), "need an input and an output layer");
        assert_eq!(biases.len(), weights.len());

        let mut layer_sizes = vec![weights[0].ncols()];

        for (b, w) in zip(&biases, &weights) {
            assert_eq!(w.nrows(), b.nrows());
            assert_eq!(w.ncols(), *layer_sizes.last().unwrap());

            layer_sizes.push(w.nrows());
        }

        Network {
            layer_sizes,
            biases,
            weights,
        }
    }

    /// Trainable parameters as (biases, weights), for in-place optimizer
    /// updates.
    pub fn params_mut(&mut self) -> (&mut [DVector<f32>], &mut [DMatrix<f32>]) {
        (&mut self.biases, &mut self.weights)
    }

    pub fn feed_forward(&self, input: DVector<f32>) -> DVector<f32> {
        let last = self.weights.len() - 1;

        zip(&self.weights, &self.biases)
            .enumerate()
            .fold(input, |a, (idx, (w, b))| {
                let z = w * a + b;

                if idx == last {
                    z
                } else {
                    z.map(sigmoid)
                }
            })
    }
}

impl Network {
    // Feed forward, but track raw and squashed values per layer. Returns the
    // pre-activations and the inputs seen by each layer plus the final
    // logits.
    fn forward_trace(&self, img: &DVector<f32>) -> (Vec<DVector<f32>>, Vec<DVector<f32>>) {
        let last = self.weights.len() - 1;

        let mut activation = img.clone();
        let mut activations = Vec::<DVector<f32>>::with_capacity(self.layer_sizes.len());
        let mut zs = Vec::<DVector<f32>>::with_capacity(self.layer_sizes.len());

        for (idx, (b, w)) in zip(&self.biases, &self.weights).enumerate() {
            let z = w * &activation + b;
            let mut a2 = if idx == last { z.clone() } else { z.map(sigmoid) };

            zs.push(z);

            std::mem::swap(&mut activation, &mut a2);

            activations.push(a2);
        }

        activations.push(activation);

        (zs, activations)
    }

    /// Cost and parameter gradients for a single example.
    pub fn gradients<L: Loss>(&self, loss: &L, img: &DVector<f32>, label: u8) -> (f32, Gradients) {
        let (zs, activations) = self.forward_trace(img);

        let logits = activations.last().unwrap();
        let cost = loss.value(logits, label);
        let mut delta = loss.output_delta(logits, label);

        let mut nabla = Gradients::zeros_like(self);

        *nabla.biases.last_mut().unwrap() = delta.clone();

        *nabla.weights.last_mut().unwrap() =
            &delta * &activations[activations.len() - 2].transpose();

        for (z, w, nb, nw, a) in izip!(
            zs.iter().rev().skip(1),
            self.weights.iter().rev(),
            nabla.biases.iter_mut().rev().skip(1),
            nabla.weights.iter_mut().rev().skip(1),
            activations.iter().rev().skip(2)
        ) {
            let sp = z.map(sigmoid_prime);
            delta = (w.transpose() * delta).component_mul(&sp);

            *nb = delta.clone();
            *nw = &delta * a.transpose();
        }

        (cost, nabla)
    }

    /// Mean cost and mean parameter gradients over a batch.
    pub fn batch_gradients<L: Loss>(&self, loss: &L, batch: &Batch) -> (f32, Gradients) {
        let (cost_sum, mut nabla) = batch
            .images
            .column_iter()
            .zip(batch.labels.row_iter())
            .par_bridge()
            .map(|(img, label)| {
                let img = DVector::from_row_slice(img.as_slice());

                self.gradients(loss, &img, label.x)
            })
            .reduce_with(|(c1, mut n1), (c2, n2)| {
                n1.accumulate(n2);

                (c1 + c2, n1)
            })
            .expect("Batch size shouldn't be zero");

        let scale = 1.0 / batch.len() as f32;

        nabla.scale(scale);

        (cost_sum * scale, nabla)
    }

    /// Gradient of the cost with respect to the input pixels. Nothing else
    /// is touched: parameter gradients are neither computed nor stored.
    pub fn input_gradient<L: Loss>(&self, loss: &L, img: &DVector<f32>, label: u8) -> DVector<f32> {
        let (zs, activations) = self.forward_trace(img);

        let logits = activations.last().unwrap();
        let mut delta = loss.output_delta(logits, label);

        for (z, w) in zip(zs.iter().rev().skip(1), self.weights.iter().rev()) {
            delta = (w.transpose() * delta).component_mul(&z.map(sigmoid_prime));
        }

        self.weights[0].transpose() * delta
    }

    /// Per-pixel cost gradients for a whole batch, one column per image.
    pub fn input_gradients<L: Loss>(&self, loss: &L, batch: &Batch) -> DMatrix<f32> {
        let grads: Vec<_> = (0..batch.len())
            .into_par_iter()
            .map(|i| {
                let img = DVector::from_row_slice(batch.images.column(i).as_slice());

                self.input_gradient(loss, &img, batch.labels[i])
            })
            .collect();

        DMatrix::from_columns(&grads)
    }
}

/// Per-parameter cost gradients, shaped like the network they came from.
pub struct Gradients {
    pub biases: Vec<DVector<f32>>,
    pub weights: Vec<DMatrix<f32>>,
}

impl Gradients {
    pub fn zeros_like(network: &Network) -> Self {
        Gradients {
            biases: network
                .biases
                .iter()
                .map(|v| DVector::zeros(v.nrows()))
                .collect(),
            weights: network
                .weights
                .iter()
                .map(|m| {
                    let (r, c) = m.shape();

                    DMatrix::zeros(r, c)
                })
                .collect(),
        }
    }

    pub fn accumulate(&mut self, other: Gradients) {
        self.biases
            .iter_mut()
            .zip(other.biases)
            .for_each(|(n, dn)| *n += dn);
        self.weights
            .iter_mut()
            .zip(other.weights)
            .for_each(|(n, dn)| *n += dn);
    }

    pub fn scale(&mut self, factor: f32) {
        for b in &mut self.biases {
            *b *= factor;
        }

        for w in &mut self.weights {
            *w *= factor;
        }
    }
}
