mod attack;
mod error;
mod eval;
mod loss;
mod mnist;
mod network;
mod optim;
mod train;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use attack::Fgsm;
use error::Result;
use eval::accuracy;
use loss::SoftmaxCrossEntropy;
use mnist::MNISTData;
use network::Network;
use optim::OptimizerKind;
use train::{train, AccuracyLog, TrainOptions};

/// MNIST experiment around the fast gradient sign method from
/// https://arxiv.org/abs/1412.6572: train a clean classifier, measure how
/// badly FGSM breaks it, then fine-tune on adversarial batches.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to MNIST folder with the four idx-ubyte files
    mnist_folder: PathBuf,

    /// Training epochs per phase
    #[arg(long, default_value_t = 100)]
    epochs: u32,

    /// Examples per mini-batch
    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Step size for the clean training phase
    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f32,

    /// Step size for the adversarial fine-tuning phase
    #[arg(long, default_value_t = 1e-4)]
    adv_learning_rate: f32,

    /// Attack strength used to craft training batches
    #[arg(long, default_value_t = 0.03)]
    train_epsilon: f32,

    /// Attack strength used when scoring robustness
    #[arg(long, default_value_t = 0.35)]
    eval_epsilon: f32,

    /// Hidden layer sizes, widest first
    #[arg(long, value_delimiter = ',', default_values_t = [128usize, 64])]
    hidden: Vec<usize>,

    /// Per-epoch validation accuracy log for the clean phase
    #[arg(long, default_value = "acc_log_per_epoch.txt")]
    acc_log: PathBuf,

    /// Per-epoch validation accuracy log for the adversarial phase
    #[arg(long, default_value = "acc_log_per_epoch_adv.txt")]
    adv_acc_log: PathBuf,

    /// Fixed RNG seed; omitted means seeding from the OS
    #[arg(long)]
    seed: Option<u64>,

    /// Parameter update rule
    #[arg(long, value_enum, default_value = "adam")]
    optimizer: OptimizerKind,
}

fn run(args: &Args) -> Result<()> {
    println!("Loading MNIST data");

    let data = MNISTData::parse(&args.mnist_folder)?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut layer_sizes = vec![data.training.images.shape().0];
    layer_sizes.extend_from_slice(&args.hidden);
    layer_sizes.push(10);

    let mut network = Network::new_random(&layer_sizes, &mut rng);
    let loss = SoftmaxCrossEntropy;

    println!("Training the baseline model");

    let mut optimizer = args.optimizer.build(&network, args.learning_rate);
    let mut log = AccuracyLog::open(&args.acc_log)?;

    train(
        &mut network,
        optimizer.as_mut(),
        &loss,
        &data.training,
        &data.validation,
        &TrainOptions {
            epochs: args.epochs,
            batch_size: args.batch_size,
            adversarial: false,
            attack_eps: args.train_epsilon,
            eval_eps: args.eval_epsilon,
        },
        &mut log,
        &mut rng,
    )?;

    let clean = accuracy(
        &network,
        &loss,
        &data.validation,
        args.batch_size,
        None,
        &mut rng,
    )?;

    println!("Accuracy of the network: {clean:.2}%");

    let attacked = accuracy(
        &network,
        &loss,
        &data.validation,
        args.batch_size,
        Some(&Fgsm::new(args.eval_epsilon)),
        &mut rng,
    )?;

    println!("Accuracy of the network after attack: {attacked:.2}%");

    println!("Re-training the model on adversarial batches");

    let mut optimizer = args.optimizer.build(&network, args.adv_learning_rate);
    let mut adv_log = AccuracyLog::open(&args.adv_acc_log)?;

    train(
        &mut network,
        optimizer.as_mut(),
        &loss,
        &data.training,
        &data.validation,
        &TrainOptions {
            epochs: args.epochs,
            batch_size: args.batch_size,
            adversarial: true,
            attack_eps: args.train_epsilon,
            eval_eps: args.eval_epsilon,
        },
        &mut adv_log,
        &mut rng,
    )?;

    let robust = accuracy(
        &network,
        &loss,
        &data.validation,
        args.batch_size,
        Some(&Fgsm::new(args.eval_epsilon)),
        &mut rng,
    )?;

    println!("Accuracy of the fine-tuned network after attack: {robust:.2}%");

    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
