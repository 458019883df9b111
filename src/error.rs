use thiserror::Error;

#[derive(Error, Debug)]
pub enum MnistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header too short: expected {expected} bytes, found {found}")]
    TruncatedHeader { expected: usize, found: usize },

    #[error("Bad magic number: expected {expected}, found {found}")]
    BadMagic { expected: u32, found: u32 },

    #[error("Image dimensions {count}x{rows}x{columns} overflow the addressable size")]
    DimensionsOverflow { count: u32, rows: u32, columns: u32 },

    #[error("Payload size mismatch: header declares {expected} bytes, found {found}")]
    PayloadSize { expected: usize, found: usize },

    #[error("Image file holds {images} images but label file holds {labels} labels")]
    CountMismatch { images: usize, labels: usize },
}

#[derive(Error, Debug, PartialEq)]
pub enum TensorError {
    #[error("Shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: (usize, usize),
        rhs: (usize, usize),
    },

    #[error("Backward needs a 1x1 output, got {0:?}")]
    NotScalar((usize, usize)),

    #[error("Loss over an empty batch is undefined")]
    EmptyBatch,

    #[error("Output does not depend on node {0}")]
    NoGradient(usize),
}

#[derive(Error, Debug, PartialEq)]
pub enum TrainError {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    #[error("{inputs} input rows but {labels} labels")]
    LengthMismatch { inputs: usize, labels: usize },

    #[error("Label {label} is out of range for {classes} classes")]
    LabelOutOfRange { label: u8, classes: usize },
}
