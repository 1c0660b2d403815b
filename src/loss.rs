use nalgebra::DVector;

/// Scalar training objective, differentiable with respect to the logits.
pub trait Loss: Sync {
    fn value(&self, logits: &DVector<f32>, label: u8) -> f32;

    /// d(value)/d(logits) evaluated at `logits`.
    fn output_delta(&self, logits: &DVector<f32>, label: u8) -> DVector<f32>;
}

/// Softmax and negative log-likelihood fused on raw logits.
pub struct SoftmaxCrossEntropy;

impl Loss for SoftmaxCrossEntropy {
    fn value(&self, logits: &DVector<f32>, label: u8) -> f32 {
        // Shift by the max so the exponentials can't overflow.
        let shift = logits.max();
        let log_sum = logits.iter().map(|z| (z - shift).exp()).sum::<f32>().ln();

        shift + log_sum - logits[label as usize]
    }

    fn output_delta(&self, logits: &DVector<f32>, label: u8) -> DVector<f32> {
        let shift = logits.max();
        let mut delta = logits.map(|z| (z - shift).exp());

        delta /= delta.sum();
        delta[label as usize] -= 1.0;

        delta
    }
}
