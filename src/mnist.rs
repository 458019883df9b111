use crate::error::MnistError;
use flate2::read::GzDecoder;
use itertools::Itertools;
use log::info;
use ndarray::{Array, Array1, Array2, ArrayView1};
use std::{
    fs::File,
    io::Read,
    path::Path,
};

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;
const IMAGE_HEADER_LEN: usize = 16;
const LABEL_HEADER_LEN: usize = 8;

// A parsed pair of MNIST files. Row i of images is the flattened, normalized digit whose class is
// labels[i].
#[derive(Debug, Clone)]
pub struct MnistDataset {
    pub images: Array2<f32>,
    pub labels: Array1<u8>,
}

impl MnistDataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// Read a gzip-compressed MNIST image file and label file.
// Pixels are scaled from 0..=255 to 0.0..=1.0 and each image is flattened into one row, so a
// standard 28x28 file yields an array of shape `(count, 784)`.
pub fn parse_mnist(
    image_path: impl AsRef<Path>,
    label_path: impl AsRef<Path>,
) -> Result<MnistDataset, MnistError> {
    let image_path = image_path.as_ref();
    let label_path = label_path.as_ref();

    let images = read_images(GzDecoder::new(File::open(image_path)?))?;
    let labels = read_labels(GzDecoder::new(File::open(label_path)?))?;

    // Both files describe the same examples, so a disagreement means the wrong pair was given.
    if images.nrows() != labels.len() {
        return Err(MnistError::CountMismatch {
            images: images.nrows(),
            labels: labels.len(),
        });
    }

    info!(
        "Parsed {} examples of {} pixels from {} and {}",
        images.nrows(),
        images.ncols(),
        image_path.display(),
        label_path.display()
    );

    Ok(MnistDataset { images, labels })
}

// Parse an uncompressed MNIST image stream.
pub fn read_images<R: Read>(mut reader: R) -> Result<Array2<f32>, MnistError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    // The header is four big-endian u32s: magic (2051), image count, rows, columns.
    let (mut header, payload) = split_header(&bytes, IMAGE_HEADER_LEN, IMAGE_MAGIC)?;
    let (count, rows, columns): (u32, u32, u32) =
        header.next_tuple().ok_or(MnistError::TruncatedHeader {
            expected: IMAGE_HEADER_LEN,
            found: bytes.len(),
        })?;
    // A corrupt header can declare dimensions whose byte count does not fit in usize.
    let overflow = || MnistError::DimensionsOverflow {
        count,
        rows,
        columns,
    };
    let pixels = (rows as usize)
        .checked_mul(columns as usize)
        .ok_or_else(overflow)?;
    let count = count as usize;
    check_payload(count.checked_mul(pixels).ok_or_else(overflow)?, payload.len())?;

    Ok(Array::from_shape_fn((count, pixels), |(image, pixel)| {
        f32::from(payload[image * pixels + pixel]) / 255.0
    }))
}

// Parse an uncompressed MNIST label stream.
pub fn read_labels<R: Read>(mut reader: R) -> Result<Array1<u8>, MnistError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    // The header is two big-endian u32s: magic (2049), label count.
    let (mut header, payload) = split_header(&bytes, LABEL_HEADER_LEN, LABEL_MAGIC)?;
    let count = header.next().ok_or(MnistError::TruncatedHeader {
        expected: LABEL_HEADER_LEN,
        found: bytes.len(),
    })? as usize;

    check_payload(count, payload.len())?;

    Ok(Array1::from(payload.to_vec()))
}

// Checks the magic number and splits the bytes into the remaining header words and the payload.
fn split_header(
    bytes: &[u8],
    header_len: usize,
    magic: u32,
) -> Result<(impl Iterator<Item = u32> + '_, &[u8]), MnistError> {
    if bytes.len() < header_len {
        return Err(MnistError::TruncatedHeader {
            expected: header_len,
            found: bytes.len(),
        });
    }

    let (header, payload) = bytes.split_at(header_len);
    let mut words = header
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));

    match words.next() {
        Some(found) if found == magic => Ok((words, payload)),
        found => Err(MnistError::BadMagic {
            expected: magic,
            found: found.unwrap_or_default(),
        }),
    }
}

fn check_payload(expected: usize, found: usize) -> Result<(), MnistError> {
    if expected == found {
        Ok(())
    } else {
        Err(MnistError::PayloadSize { expected, found })
    }
}

// Draws a single flattened image as block characters, one text line per image row.
pub fn render_digit(image: ArrayView1<f32>, columns: usize) -> String {
    image
        .iter()
        .chunks(columns.max(1))
        .into_iter()
        .map(|row| {
            row.map(|&activation| match activation {
                a if a < 0.2 => ' ',
                a if a < 0.4 => '░',
                a if a < 0.6 => '▒',
                a if a < 0.8 => '▓',
                _ => '█',
            })
            .collect::<String>()
        })
        .join("\n")
}
