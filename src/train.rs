use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use itertools::Itertools;
use permutation_iterator::Permutor;
use rand::Rng;

use crate::attack::Fgsm;
use crate::error::{Error, Result};
use crate::eval::accuracy;
use crate::loss::Loss;
use crate::mnist::MNISTDataSet;
use crate::network::Network;
use crate::optim::Optimizer;

pub struct TrainOptions {
    pub epochs: u32,
    pub batch_size: usize,
    /// Train on perturbed batches instead of clean ones.
    pub adversarial: bool,
    /// Attack strength applied to training batches.
    pub attack_eps: f32,
    /// Attack strength applied when scoring validation accuracy during
    /// adversarial training.
    pub eval_eps: f32,
}

impl Default for TrainOptions {
    fn default() -> Self {
        TrainOptions {
            epochs: 100,
            batch_size: 128,
            adversarial: false,
            attack_eps: 0.03,
            eval_eps: 0.35,
        }
    }
}

/// Per-epoch validation accuracies, one per line.
pub struct AccuracyLog<W: Write> {
    sink: W,
}

impl AccuracyLog<BufWriter<File>> {
    /// Appends to `path`, creating it on first use.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(AccuracyLog::new(BufWriter::new(file)))
    }
}

impl<W: Write> AccuracyLog<W> {
    pub fn new(sink: W) -> Self {
        AccuracyLog { sink }
    }

    pub fn record(&mut self, accuracy: f32) -> Result<()> {
        writeln!(self.sink, "{accuracy}")?;
        self.sink.flush()?;

        Ok(())
    }
}

/// Runs mini-batch gradient descent for `opts.epochs` epochs, scoring and
/// logging validation accuracy after each one. In adversarial mode every
/// training batch is perturbed against the current weights before the
/// gradient step, and validation is scored under attack as well.
pub fn train<L: Loss>(
    network: &mut Network,
    optimizer: &mut dyn Optimizer,
    loss: &L,
    training: &MNISTDataSet,
    validation: &MNISTDataSet,
    opts: &TrainOptions,
    log: &mut AccuracyLog<impl Write>,
    rng: &mut impl Rng,
) -> Result<()> {
    if opts.batch_size == 0 {
        return Err(Error::InvalidBatchSize);
    }

    let attack = opts.adversarial.then(|| Fgsm::new(opts.attack_eps));
    let monitor = opts.adversarial.then(|| Fgsm::new(opts.eval_eps));

    let data_len = training.len() as u64;
    let batches_len = (training.len() + opts.batch_size - 1) / opts.batch_size;

    let print_freq = Duration::from_millis(200);
    let mut last_print = Instant::now() - print_freq;

    for epoch_idx in 0..opts.epochs {
        let mut cost_sum = 0.0;

        for (batch_idx, chunk) in Permutor::new_with_u64_key(data_len, rng.gen())
            .chunks(opts.batch_size)
            .into_iter()
            .enumerate()
        {
            if last_print.elapsed() > print_freq {
                print!("\rUpdating batch {}/{}", batch_idx, batches_len);
                io::stdout().flush().unwrap();
                last_print = Instant::now();
            }

            let indices: Vec<usize> = chunk.map(|i| i as usize).collect();
            let mut batch = training.gather(&indices);

            if let Some(fgsm) = &attack {
                batch = fgsm.perturb(rng, network, loss, &batch)?;
            }

            let (cost, grads) = network.batch_gradients(loss, &batch);

            optimizer.step(network, &grads);

            cost_sum += cost;
        }

        if batches_len > 0 {
            println!(
                "\rEpoch {}/{} mean batch cost: {:.4}",
                epoch_idx + 1,
                opts.epochs,
                cost_sum / batches_len as f32
            );
        }

        print!("Evaluating network");
        io::stdout().flush().unwrap();

        let acc = accuracy(
            network,
            loss,
            validation,
            opts.batch_size,
            monitor.as_ref(),
            rng,
        )?;

        log.record(acc)?;

        println!(
            "\rEpoch {}/{} validation accuracy: {:.2}%",
            epoch_idx + 1,
            opts.epochs,
            acc
        );
    }

    Ok(())
}
