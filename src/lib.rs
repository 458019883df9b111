pub mod autodiff;
pub mod error;
pub mod loss;
pub mod mnist;
pub mod network;

pub use autodiff::{Gradients, Tape, Var};
pub use error::{MnistError, TensorError, TrainError};
pub use loss::{loss_err, softmax_loss};
pub use mnist::{MnistDataset, parse_mnist, read_images, read_labels, render_digit};
pub use network::{EpochStats, TrainConfig, batch_ranges, init_weights, nn_epoch, train_nn};
