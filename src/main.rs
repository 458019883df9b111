use clap::Parser;
use mnist_sgd::{TrainConfig, parse_mnist, render_digit, train_nn};
use ndarray::Axis;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Gzipped MNIST training images
    #[arg(long, default_value = "data/train-images-idx3-ubyte.gz")]
    train_images: String,

    /// Gzipped MNIST training labels
    #[arg(long, default_value = "data/train-labels-idx1-ubyte.gz")]
    train_labels: String,

    /// Gzipped MNIST test images
    #[arg(long, default_value = "data/t10k-images-idx3-ubyte.gz")]
    test_images: String,

    /// Gzipped MNIST test labels
    #[arg(long, default_value = "data/t10k-labels-idx1-ubyte.gz")]
    test_labels: String,

    /// Width of the hidden layer
    #[arg(long, default_value_t = 500)]
    hidden_dim: usize,

    /// Number of passes over the training set
    #[arg(short, long, default_value_t = 10)]
    epochs: usize,

    /// SGD step size
    #[arg(short, long, default_value_t = 0.5)]
    learning_rate: f32,

    /// Mini-batch size
    #[arg(short, long, default_value_t = 100)]
    batch_size: usize,

    /// Seed for weight initialization
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Print the first N training digits before training
    #[arg(short, long, default_value_t = 0)]
    preview: usize,
}

impl From<&Args> for TrainConfig {
    fn from(args: &Args) -> Self {
        TrainConfig {
            hidden_dim: args.hidden_dim,
            epochs: args.epochs,
            learning_rate: args.learning_rate,
            batch_size: args.batch_size,
            seed: args.seed,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let train = parse_mnist(&args.train_images, &args.train_labels)?;
    let test = parse_mnist(&args.test_images, &args.test_labels)?;

    // MNIST images are square, so the side length is recovered from the pixel count.
    let columns = (train.images.ncols() as f64).sqrt() as usize;
    for (image, label) in train
        .images
        .axis_iter(Axis(0))
        .zip(train.labels.iter())
        .take(args.preview)
    {
        println!("{}\nAnswer: {label}\n", render_digit(image, columns));
    }

    let (_, _, history) = train_nn(&train, &test, &TrainConfig::from(&args))?;

    println!("| Epoch | Train Loss | Train Err | Test Loss | Test Err |");
    for stats in history {
        println!(
            "|  {:>2}   |  {:.5}   |  {:.5}  |  {:.5}  |  {:.5} |",
            stats.epoch, stats.train_loss, stats.train_err, stats.test_loss, stats.test_err
        );
    }

    Ok(())
}
