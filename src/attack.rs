use nalgebra::{DMatrix, DVector};
use permutation_iterator::Permutor;
use rand::Rng;

use crate::error::{Error, Result};
use crate::loss::Loss;
use crate::mnist::Batch;
use crate::network::Network;

// {-1, 0, +1}; f32::signum would map zero to its sign bit instead.
fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Fast gradient sign method: one step of size `eps` along the sign of the
/// per-pixel cost gradient.
pub struct Fgsm {
    pub eps: f32,
}

impl Fgsm {
    pub fn new(eps: f32) -> Self {
        Fgsm { eps }
    }

    /// Shuffles the batch, then moves every pixel of every image `eps`
    /// along the sign of the cost gradient and clamps the result back into
    /// [0, 1]. Labels travel with their images.
    pub fn perturb<L: Loss>(
        &self,
        rng: &mut impl Rng,
        network: &Network,
        loss: &L,
        batch: &Batch,
    ) -> Result<Batch> {
        if batch.is_empty() {
            return Err(Error::EmptyBatch);
        }

        if self.eps < 0.0 {
            return Err(Error::NegativeEpsilon(self.eps));
        }

        let perm: Vec<usize> = Permutor::new_with_u64_key(batch.len() as u64, rng.gen())
            .map(|i| i as usize)
            .collect();

        let shuffled = Batch {
            images: DMatrix::from_fn(batch.images.nrows(), batch.len(), |r, c| {
                batch.images[(r, perm[c])]
            }),
            labels: DVector::from_fn(batch.len(), |i, _| batch.labels[perm[i]]),
        };

        let grad = network.input_gradients(loss, &shuffled);

        // adv = x + eps * sign(grad_x J)
        let images = shuffled
            .images
            .zip_map(&grad, |x, g| (x + self.eps * sign(g)).clamp(0.0, 1.0));

        Ok(Batch {
            images,
            labels: shuffled.labels,
        })
    }
}

impl Default for Fgsm {
    fn default() -> Self {
        Fgsm { eps: 0.03 }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use crate::loss::SoftmaxCrossEntropy;

    use super::*;

    // One pixel, two classes. Logits are [x, 0.4 - x], so the decision
    // boundary sits at x = 0.2.
    fn one_pixel_net() -> Network {
        Network::from_parts(
            vec![DVector::from_vec(vec![0.0, 0.4])],
            vec![DMatrix::from_row_slice(2, 1, &[1.0, -1.0])],
        )
    }

    fn one_pixel_batch() -> Batch {
        Batch {
            images: DMatrix::from_row_slice(1, 4, &[0.1, 0.4, 0.7, 0.9]),
            labels: DVector::from_vec(vec![0, 1, 0, 1]),
        }
    }

    fn pairs(batch: &Batch) -> Vec<(u32, u8)> {
        let mut pairs: Vec<_> = (0..batch.len())
            .map(|i| (batch.images[(0, i)].to_bits(), batch.labels[i]))
            .collect();
        pairs.sort_unstable();

        pairs
    }

    #[test]
    fn default_epsilon() {
        assert_eq!(Fgsm::default().eps, 0.03);
    }

    #[test]
    fn zero_epsilon_only_permutes() {
        let batch = one_pixel_batch();

        let out = Fgsm::new(0.0)
            .perturb(
                &mut StdRng::seed_from_u64(3),
                &one_pixel_net(),
                &SoftmaxCrossEntropy,
                &batch,
            )
            .unwrap();

        assert_eq!(pairs(&batch), pairs(&out));
    }

    #[test]
    fn zero_gradient_leaves_pixels_untouched() {
        let net = Network::from_parts(
            vec![DVector::from_vec(vec![0.3, -0.1])],
            vec![DMatrix::zeros(2, 1)],
        );
        let batch = one_pixel_batch();

        let out = Fgsm::new(0.5)
            .perturb(
                &mut StdRng::seed_from_u64(9),
                &net,
                &SoftmaxCrossEntropy,
                &batch,
            )
            .unwrap();

        assert_eq!(pairs(&batch), pairs(&out));
    }

    #[test]
    fn perturbed_pixels_stay_in_unit_range() {
        let out = Fgsm::new(5.0)
            .perturb(
                &mut StdRng::seed_from_u64(5),
                &one_pixel_net(),
                &SoftmaxCrossEntropy,
                &one_pixel_batch(),
            )
            .unwrap();

        assert!(out.images.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn same_seed_same_batch_is_reproducible() {
        let net = one_pixel_net();
        let loss = SoftmaxCrossEntropy;
        let batch = one_pixel_batch();
        let fgsm = Fgsm::new(0.25);

        let a = fgsm
            .perturb(&mut StdRng::seed_from_u64(11), &net, &loss, &batch)
            .unwrap();
        let b = fgsm
            .perturb(&mut StdRng::seed_from_u64(11), &net, &loss, &batch)
            .unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn attack_increases_the_cost() {
        let net = one_pixel_net();
        let loss = SoftmaxCrossEntropy;
        let batch = Batch {
            images: DMatrix::from_row_slice(1, 1, &[0.5]),
            labels: DVector::from_vec(vec![0]),
        };

        let before = loss.value(&net.feed_forward(DVector::from_vec(vec![0.5])), 0);

        let out = Fgsm::new(0.1)
            .perturb(&mut StdRng::seed_from_u64(2), &net, &loss, &batch)
            .unwrap();
        let after = loss.value(
            &net.feed_forward(DVector::from_row_slice(out.images.column(0).as_slice())),
            out.labels[0],
        );

        assert!(after > before, "{after} vs {before}");
    }

    #[test]
    fn empty_batch_is_rejected() {
        let empty = Batch {
            images: DMatrix::zeros(1, 0),
            labels: DVector::zeros(0),
        };

        let result = Fgsm::new(0.1).perturb(
            &mut StdRng::seed_from_u64(1),
            &one_pixel_net(),
            &SoftmaxCrossEntropy,
            &empty,
        );

        assert!(matches!(result, Err(Error::EmptyBatch)));
    }

    #[test]
    fn negative_epsilon_is_rejected() {
        let result = Fgsm::new(-0.1).perturb(
            &mut StdRng::seed_from_u64(1),
            &one_pixel_net(),
            &SoftmaxCrossEntropy,
            &one_pixel_batch(),
        );

        assert!(matches!(result, Err(Error::NegativeEpsilon(_))));
    }
}
