use rand::Rng;
use rayon::prelude::*;

use crate::attack::Fgsm;
use crate::error::{Error, Result};
use crate::loss::Loss;
use crate::mnist::MNISTDataSet;
use crate::network::Network;

/// Classification accuracy in percent, scored over complete batches only;
/// a ragged tail of fewer than `batch_size` examples is skipped. With an
/// attack, every batch is perturbed before scoring.
pub fn accuracy<L: Loss>(
    network: &Network,
    loss: &L,
    data: &MNISTDataSet,
    batch_size: usize,
    attack: Option<&Fgsm>,
    rng: &mut impl Rng,
) -> Result<f32> {
    if batch_size == 0 {
        return Err(Error::InvalidBatchSize);
    }

    let batch_count = data.len() / batch_size;

    if batch_count == 0 {
        return Err(Error::EmptyDataset {
            len: data.len(),
            batch_size,
        });
    }

    let mut total = 0.0;

    for i in 0..batch_count {
        let mut batch = data.batch(i * batch_size, batch_size);

        if let Some(fgsm) = attack {
            batch = fgsm.perturb(rng, network, loss, &batch)?;
        }

        let correct: usize = batch
            .images
            .column_iter()
            .zip(batch.labels.row_iter())
            .par_bridge()
            .map(|(img, label)| {
                let res = network.feed_forward(img.clone_owned());

                usize::from(res.argmax().0 == label.x as usize)
            })
            .sum();

        total += correct as f32 / batch_size as f32;
    }

    Ok(total / batch_count as f32 * 100.0)
}
