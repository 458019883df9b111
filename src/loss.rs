use crate::autodiff::{Tape, Var};
use crate::error::{TensorError, TrainError};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

// Average softmax (cross-entropy) loss of the logits `z` against the one-hot labels `y_one_hot`.
// Both nodes must be `(batch, classes)`. The result is a `1x1` node so it can be fed straight
// into `Tape::backward`. The log-sum-exp is computed directly, without subtracting the row
// maximum first, so logits large enough to overflow `exp` produce an infinite loss.
pub fn softmax_loss(tape: &mut Tape, z: Var, y_one_hot: Var) -> Result<Var, TensorError> {
    let batch = tape.value(z).nrows();
    if batch == 0 {
        return Err(TensorError::EmptyBatch);
    }

    let exp_z = tape.exp(z);
    let row_sums = tape.sum_rows(exp_z);
    let log_sums = tape.log(row_sums);
    let log_sum_exp = tape.sum(log_sums);

    let picked = tape.mul(y_one_hot, z)?;
    let true_logits = tape.sum(picked);

    let total = tape.sub(log_sum_exp, true_logits)?;
    Ok(tape.scale(total, 1.0 / batch as f32))
}

// Builds a (labels.len() x classes) matrix with a single 1.0 per row at the label's index.
pub(crate) fn one_hot(labels: ArrayView1<u8>, classes: usize) -> Result<Array2<f32>, TrainError> {
    let mut encoded = Array2::zeros((labels.len(), classes));
    for (mut row, &label) in encoded.axis_iter_mut(Axis(0)).zip(labels.iter()) {
        let slot = row
            .get_mut(usize::from(label))
            .ok_or(TrainError::LabelOutOfRange { label, classes })?;
        *slot = 1.0;
    }
    Ok(encoded)
}

// Average softmax loss and classification error of the logits `h` against the labels `y`.
// The error is the fraction of rows whose largest logit is not at the label's index.
pub fn loss_err(h: ArrayView2<f32>, y: ArrayView1<u8>) -> Result<(f32, f32), TrainError> {
    if h.nrows() != y.len() {
        return Err(TrainError::LengthMismatch {
            inputs: h.nrows(),
            labels: y.len(),
        });
    }

    let mut tape = Tape::new();
    let z = tape.leaf(h.to_owned());
    let y_one_hot = tape.leaf(one_hot(y, h.ncols())?);
    let loss = softmax_loss(&mut tape, z, y_one_hot)?;

    let mistakes = h
        .axis_iter(Axis(0))
        .zip(y.iter())
        .filter(|(row, label)| {
            row.iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(index, _)| index)
                != Some(usize::from(**label))
        })
        .count();

    Ok((tape.value(loss)[[0, 0]], mistakes as f32 / y.len() as f32))
}
