use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("not an MNIST {expected} file (magic {found:#010x})")]
    IdxMagic { expected: &'static str, found: u32 },
    #[error("image and label counts differ ({images} images, {labels} labels)")]
    CountMismatch { images: usize, labels: usize },
    #[error("label {0} is outside the digit range 0-9")]
    LabelOutOfRange(u8),
    #[error("batch is empty")]
    EmptyBatch,
    #[error("batch size must be non-zero")]
    InvalidBatchSize,
    #[error("dataset of {len} examples yields no complete batch of {batch_size}")]
    EmptyDataset { len: usize, batch_size: usize },
    #[error("epsilon must be non-negative, got {0}")]
    NegativeEpsilon(f32),
}

pub type Result<T> = std::result::Result<T, Error>;
