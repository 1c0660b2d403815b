use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use byteorder::{BigEndian, ReadBytesExt};
use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
enum DataType {
    UnsignedByte,
    SignedByte,
    Short,
    Int,
    Float,
    Double,
    Unknown,
}

impl From<u32> for DataType {
    fn from(v: u32) -> Self {
        match (v >> 8) & 0xFF {
            0x08 => Self::UnsignedByte,
            0x09 => Self::SignedByte,
            0x0B => Self::Short,
            0x0C => Self::Int,
            0x0D => Self::Float,
            0x0E => Self::Double,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug)]
struct RawImages {
    dims: (u32, u32),
    data: Vec<f32>,
}

impl RawImages {
    fn parse(src: &mut impl Read) -> Result<Self> {
        let magic = src.read_u32::<BigEndian>()?;

        let data_type = DataType::from(magic);
        let data_dims = magic & 0xFF;

        if data_type != DataType::UnsignedByte || data_dims != 3 {
            return Err(Error::IdxMagic {
                expected: "image",
                found: magic,
            });
        }

        let count = src.read_u32::<BigEndian>()?;
        let d1 = src.read_u32::<BigEndian>()?;
        let d2 = src.read_u32::<BigEndian>()?;

        let mut data: Vec<u8> = vec![0; (count * d1 * d2) as usize];

        src.read_exact(&mut data)?;

        Ok(RawImages {
            dims: (d1, d2),
            data: data.into_iter().map(|v| (v as f32) / 255.0).collect(),
        })
    }
}

#[derive(Debug)]
struct RawLabels(Vec<u8>);

impl RawLabels {
    fn parse(src: &mut impl Read) -> Result<Self> {
        let magic = src.read_u32::<BigEndian>()?;

        let data_type = DataType::from(magic);
        let data_dims = magic & 0xFF;

        if data_type != DataType::UnsignedByte || data_dims != 1 {
            return Err(Error::IdxMagic {
                expected: "label",
                found: magic,
            });
        }

        let count = src.read_u32::<BigEndian>()?;

        let mut data = vec![0; count as usize];

        src.read_exact(&mut data)?;

        if let Some(&label) = data.iter().find(|&&l| l > 9) {
            return Err(Error::LabelOutOfRange(label));
        }

        Ok(RawLabels(data))
    }
}

/// One image per column, pixels in [0, 1]; `labels[i]` pairs with column `i`.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub images: DMatrix<f32>,
    pub labels: DVector<u8>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct MNISTDataSet {
    pub images: DMatrix<f32>,
    pub labels: DVector<u8>,
}

impl MNISTDataSet {
    fn from_raw_parts(images: RawImages, labels: RawLabels) -> Result<Self> {
        let im_size = (images.dims.0 * images.dims.1) as usize;
        let image_count = if im_size == 0 {
            0
        } else {
            images.data.len() / im_size
        };

        if image_count != labels.0.len() {
            return Err(Error::CountMismatch {
                images: image_count,
                labels: labels.0.len(),
            });
        }

        Ok(Self {
            images: DMatrix::from_vec(im_size, image_count, images.data),
            labels: DVector::from_vec(labels.0),
        })
    }

    pub fn len(&self) -> usize {
        self.images.ncols()
    }

    /// Contiguous run of examples starting at `start`.
    pub fn batch(&self, start: usize, len: usize) -> Batch {
        Batch {
            images: self.images.columns(start, len).into_owned(),
            labels: self.labels.rows(start, len).into_owned(),
        }
    }

    /// Copies the listed examples, in order, into a batch.
    pub fn gather(&self, indices: &[usize]) -> Batch {
        Batch {
            images: DMatrix::from_fn(self.images.nrows(), indices.len(), |r, c| {
                self.images[(r, indices[c])]
            }),
            labels: DVector::from_fn(indices.len(), |i, _| self.labels[indices[i]]),
        }
    }
}

#[derive(Debug)]
pub struct MNISTData {
    pub training: MNISTDataSet,
    pub validation: MNISTDataSet,
}

impl MNISTData {
    pub fn parse(dir: &Path) -> Result<Self> {
        let mut train_images = BufReader::new(File::open(dir.join("train-images-idx3-ubyte"))?);
        let mut train_labels = BufReader::new(File::open(dir.join("train-labels-idx1-ubyte"))?);
        let mut test_images = BufReader::new(File::open(dir.join("t10k-images-idx3-ubyte"))?);
        let mut test_labels = BufReader::new(File::open(dir.join("t10k-labels-idx1-ubyte"))?);

        let train_images = RawImages::parse(&mut train_images)?;
        let train_labels = RawLabels::parse(&mut train_labels)?;
        let test_images = RawImages::parse(&mut test_images)?;
        let test_labels = RawLabels::parse(&mut test_labels)?;

        Ok(Self {
            training: MNISTDataSet::from_raw_parts(train_images, train_labels)?,
            validation: MNISTDataSet::from_raw_parts(test_images, test_labels)?,
        })
    }
}
