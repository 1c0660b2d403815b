use std::iter::zip;

use clap::ValueEnum;
use itertools::izip;

use crate::network::{Gradients, Network};

/// In-place parameter update from a batch gradient.
pub trait Optimizer {
    fn step(&mut self, network: &mut Network, grads: &Gradients);
}

pub struct Sgd {
    eta: f32,
}

impl Sgd {
    pub fn new(eta: f32) -> Self {
        Sgd { eta }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, network: &mut Network, grads: &Gradients) {
        let (biases, weights) = network.params_mut();

        for (b, g) in zip(biases, grads.biases.iter()) {
            *b -= g * self.eta;
        }

        for (w, g) in zip(weights, grads.weights.iter()) {
            *w -= g * self.eta;
        }
    }
}

/// Adam keeps exponential moving averages of the gradient and its square
/// per parameter, both bias-corrected by the step count.
pub struct Adam {
    eta: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step_count: i32,
    first_moment: Gradients,
    second_moment: Gradients,
}

impl Adam {
    pub fn new(network: &Network, eta: f32) -> Self {
        Adam {
            eta,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step_count: 0,
            first_moment: Gradients::zeros_like(network),
            second_moment: Gradients::zeros_like(network),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, network: &mut Network, grads: &Gradients) {
        self.step_count += 1;

        let eta = self.eta;
        let beta1 = self.beta1;
        let beta2 = self.beta2;
        let epsilon = self.epsilon;
        let bias1 = 1.0 - beta1.powi(self.step_count);
        let bias2 = 1.0 - beta2.powi(self.step_count);

        let (biases, weights) = network.params_mut();

        for (b, m, v, g) in izip!(
            biases.iter_mut(),
            self.first_moment.biases.iter_mut(),
            self.second_moment.biases.iter_mut(),
            grads.biases.iter()
        ) {
            m.zip_apply(g, |m, g| *m = beta1 * *m + (1.0 - beta1) * g);
            v.zip_apply(g, |v, g| *v = beta2 * *v + (1.0 - beta2) * g * g);
            b.zip_zip_apply(m, v, |b, m, v| {
                *b -= eta * (m / bias1) / ((v / bias2).sqrt() + epsilon);
            });
        }

        for (w, m, v, g) in izip!(
            weights.iter_mut(),
            self.first_moment.weights.iter_mut(),
            self.second_moment.weights.iter_mut(),
            grads.weights.iter()
        ) {
            m.zip_apply(g, |m, g| *m = beta1 * *m + (1.0 - beta1) * g);
            v.zip_apply(g, |v, g| *v = beta2 * *v + (1.0 - beta2) * g * g);
            w.zip_zip_apply(m, v, |w, m, v| {
                *w -= eta * (m / bias1) / ((v / bias2).sqrt() + epsilon);
            });
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl OptimizerKind {
    pub fn build(&self, network: &Network, eta: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Adam => Box::new(Adam::new(network, eta)),
            OptimizerKind::Sgd => Box::new(Sgd::new(eta)),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    use crate::loss::{Loss, SoftmaxCrossEntropy};

    use super::*;

    fn line_net() -> Network {
        Network::from_parts(
            vec![DVector::from_vec(vec![0.5])],
            vec![DMatrix::from_row_slice(1, 1, &[2.0])],
        )
    }

    fn line_grads() -> Gradients {
        Gradients {
            biases: vec![DVector::from_vec(vec![-0.2])],
            weights: vec![DMatrix::from_row_slice(1, 1, &[0.3])],
        }
    }

    #[test]
    fn sgd_applies_plain_gradient_steps() {
        let mut net = line_net();

        Sgd::new(0.1).step(&mut net, &line_grads());

        // w = 2 - 0.1 * 0.3, b = 0.5 + 0.1 * 0.2
        let out = net.feed_forward(DVector::from_vec(vec![1.0]));

        assert_relative_eq!(out[0], 1.97 + 0.52, epsilon = 1e-6);
    }

    #[test]
    fn first_adam_step_moves_each_parameter_by_roughly_eta() {
        let mut net = line_net();
        let mut opt = Adam::new(&net, 0.1);

        opt.step(&mut net, &line_grads());

        // Bias correction cancels on step one, so the update is close to
        // eta * sign(gradient) for both parameters.
        let out = net.feed_forward(DVector::from_vec(vec![1.0]));

        assert_relative_eq!(out[0], (2.0 - 0.1) + (0.5 + 0.1), epsilon = 1e-3);
    }

    #[test]
    fn adam_descends_on_a_convex_problem() {
        let mut net = Network::from_parts(
            vec![DVector::zeros(2)],
            vec![DMatrix::zeros(2, 1)],
        );
        let loss = SoftmaxCrossEntropy;
        let img = DVector::from_vec(vec![1.0]);

        let initial = loss.value(&net.feed_forward(img.clone()), 0);
        assert_relative_eq!(initial, f32::ln(2.0), epsilon = 1e-6);

        let mut opt = Adam::new(&net, 0.05);

        for _ in 0..300 {
            let (_, grads) = net.gradients(&loss, &img, 0);
            opt.step(&mut net, &grads);
        }

        let trained = loss.value(&net.feed_forward(img), 0);

        assert!(trained < 0.1, "loss only came down to {trained}");
    }

    #[test]
    fn sgd_descends_on_a_convex_problem() {
        let mut net = Network::from_parts(
            vec![DVector::zeros(2)],
            vec![DMatrix::zeros(2, 1)],
        );
        let loss = SoftmaxCrossEntropy;
        let img = DVector::from_vec(vec![1.0]);

        let initial = loss.value(&net.feed_forward(img.clone()), 0);

        let mut opt = Sgd::new(0.5);

        for _ in 0..50 {
            let (_, grads) = net.gradients(&loss, &img, 0);
            opt.step(&mut net, &grads);
        }

        let trained = loss.value(&net.feed_forward(img), 0);

        assert!(trained < initial);
        assert!(trained < 0.1, "loss only came down to {trained}");
    }
}
