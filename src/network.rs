use crate::autodiff::Tape;
use crate::error::TrainError;
use crate::loss::{loss_err, one_hot, softmax_loss};
use crate::mnist::MnistDataset;
use log::{debug, info};
use ndarray::{Array, Array1, Array2, s};
use ndarray_rand::{
    RandomExt,
    rand::{Rng, SeedableRng, rngs::SmallRng},
    rand_distr::StandardNormal,
};
use std::ops::Range;

// Hyper-parameters for train_nn.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub hidden_dim: usize,
    pub epochs: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            hidden_dim: 500,
            epochs: 10,
            learning_rate: 0.5,
            batch_size: 100,
            seed: 0,
        }
    }
}

// Loss and error of the weights after one epoch, on both the training and test sets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub train_err: f32,
    pub test_loss: f32,
    pub test_err: f32,
}

// Contiguous row ranges visited by one epoch, in order. The last range is shorter when `len` is
// not a multiple of `batch_size`.
pub fn batch_ranges(
    len: usize,
    batch_size: usize,
) -> Result<impl Iterator<Item = Range<usize>>, TrainError> {
    if batch_size == 0 {
        return Err(TrainError::ZeroBatchSize);
    }
    Ok((0..len)
        .step_by(batch_size)
        .map(move |start| start..(start + batch_size).min(len)))
}

// Draw the two weight matrices from a standard normal distribution, scaling `W1` by
// `1/sqrt(hidden_dim)` and `W2` by `1/sqrt(num_classes)`.
pub fn init_weights<R: Rng + ?Sized>(
    input_dim: usize,
    hidden_dim: usize,
    num_classes: usize,
    rng: &mut R,
) -> (Array2<f32>, Array2<f32>) {
    let w1: Array2<f32> = Array::random_using((input_dim, hidden_dim), StandardNormal, rng);
    let w2: Array2<f32> = Array::random_using((hidden_dim, num_classes), StandardNormal, rng);
    (
        w1 / (hidden_dim as f32).sqrt(),
        w2 / (num_classes as f32).sqrt(),
    )
}

// Run one epoch of mini-batch SGD for the bias-free network `logits = ReLU(X W1) W2`.
// Batches are taken in the original order of `x` without shuffling. The one-hot matrix for each
// batch has as many columns as `w2`, so every label must be below `w2.ncols()`.
pub fn nn_epoch(
    x: &Array2<f32>,
    y: &Array1<u8>,
    mut w1: Array2<f32>,
    mut w2: Array2<f32>,
    learning_rate: f32,
    batch_size: usize,
) -> Result<(Array2<f32>, Array2<f32>), TrainError> {
    if x.nrows() != y.len() {
        return Err(TrainError::LengthMismatch {
            inputs: x.nrows(),
            labels: y.len(),
        });
    }
    let num_classes = w2.ncols();

    for (batch, rows) in batch_ranges(x.nrows(), batch_size)?.enumerate() {
        let y_one_hot = one_hot(y.slice(s![rows.clone()]), num_classes)?;

        // Every batch records onto a fresh tape. The weights are moved onto it and taken back out
        // of the gradient step below, so no copies of them are made.
        let mut tape = Tape::new();
        let x_batch = tape.leaf(x.slice(s![rows, ..]).to_owned());
        let w1_var = tape.leaf(w1);
        let w2_var = tape.leaf(w2);
        let y_var = tape.leaf(y_one_hot);

        let z1 = tape.matmul(x_batch, w1_var)?;
        let a1 = tape.relu(z1);
        let z2 = tape.matmul(a1, w2_var)?;
        let loss = softmax_loss(&mut tape, z2, y_var)?;

        debug!("Batch {batch}: loss {}", tape.value(loss)[[0, 0]]);

        let grads = tape.backward(loss)?;
        w1 = tape.value(w1_var) - &(grads.wrt(w1_var)? * learning_rate);
        w2 = tape.value(w2_var) - &(grads.wrt(w2_var)? * learning_rate);
    }

    Ok((w1, w2))
}

// Train a fresh network for `config.epochs` epochs, reporting loss and error after each one.
pub fn train_nn(
    train: &MnistDataset,
    test: &MnistDataset,
    config: &TrainConfig,
) -> Result<(Array2<f32>, Array2<f32>, Vec<EpochStats>), TrainError> {
    let num_classes = train
        .labels
        .iter()
        .chain(test.labels.iter())
        .max()
        .map_or(0, |&label| usize::from(label) + 1);

    let mut rng = SmallRng::seed_from_u64(config.seed);
    let (mut w1, mut w2) = init_weights(
        train.images.ncols(),
        config.hidden_dim,
        num_classes,
        &mut rng,
    );

    info!(
        "Training {} -> {} -> {} network on {} examples for {} epochs",
        train.images.ncols(),
        config.hidden_dim,
        num_classes,
        train.len(),
        config.epochs
    );

    let mut history = Vec::with_capacity(config.epochs);
    for epoch in 0..config.epochs {
        (w1, w2) = nn_epoch(
            &train.images,
            &train.labels,
            w1,
            w2,
            config.learning_rate,
            config.batch_size,
        )?;

        let train_logits = logits(&train.images, &w1, &w2);
        let (train_loss, train_err) = loss_err(train_logits.view(), train.labels.view())?;
        let test_logits = logits(&test.images, &w1, &w2);
        let (test_loss, test_err) = loss_err(test_logits.view(), test.labels.view())?;

        info!(
            "Epoch {epoch}: train loss {train_loss:.5} err {train_err:.5} | test loss {test_loss:.5} err {test_err:.5}"
        );
        history.push(EpochStats {
            epoch,
            train_loss,
            train_err,
            test_loss,
            test_err,
        });
    }

    Ok((w1, w2, history))
}

// Forward pass without recording gradients.
fn logits(x: &Array2<f32>, w1: &Array2<f32>, w2: &Array2<f32>) -> Array2<f32> {
    x.dot(w1).mapv(|z| z.max(0.0)).dot(w2)
}
