use crate::{
    cross_validate, evaluate, train, AugmentationLevel, EncoderType, EvaluateConfig, LossKind,
    ModelConfig, ReduceLrOnPlateauConfig, TrainingConfig,
};
use anyhow::{anyhow, Context as _};
use burn::{backend::Autodiff, config::Config as _, optim::AdamConfig};
use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Log debug output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Train a segmentation model with stratified k-fold cross-validation
    Train {
        /// Directory holding the training images
        #[arg(short, long, required_unless_present = "config")]
        data_folder: Option<PathBuf>,
        /// Annotation table with `Image_Label,EncodedPixels` columns
        #[arg(short = 'c', long, default_value = "train.csv")]
        train_csv: PathBuf,
        /// Directory to save config, history and model_weights/ into
        #[arg(short, long, default_value = "segtrain_artifact")]
        artifact_dir: PathBuf,
        /// Load every hyper-parameter from a saved train_config.json instead
        #[arg(long)]
        config: Option<PathBuf>,
        /// Fold to train; all folds are trained in turn when omitted
        #[arg(short, long)]
        fold: Option<usize>,
        #[arg(long, default_value = "5")]
        total_folds: usize,
        #[arg(short, long, default_value=EncoderType::default())]
        encoder: EncoderType,
        #[arg(short, long, default_value = "30")]
        num_epochs: usize,
        #[arg(short = 'b', long, default_value = "4")]
        train_batch_size: usize,
        #[arg(long, default_value = "4")]
        val_batch_size: usize,
        /// Gradients are accumulated over effective_batch_size / train_batch_size batches
        #[arg(long, default_value = "32")]
        effective_batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        /// Initial learning rate, decayed when the validation loss plateaus
        #[arg(short, long, default_value = "5.0e-4")]
        learning_rate: f64,
        /// Validation dice a checkpoint has to beat to be saved
        #[arg(long, default_value = "0.0")]
        initial_best_metric: f64,
        /// Stop after this many epochs without improvement
        #[arg(long)]
        early_stopping: Option<usize>,
        /// Augmentation policy for training images
        #[arg(long, default_value=AugmentationLevel::default())]
        augmentation: AugmentationLevel,
        /// Network input height
        #[arg(long, default_value = "320")]
        height: u32,
        /// Network input width
        #[arg(long, default_value = "640")]
        width: u32,
        #[arg(long, default_value=LossKind::default())]
        loss: LossKind,
        /// Probability threshold used by the dice and IoU metrics
        #[arg(short, long, default_value = "0.5")]
        threshold: f32,
        /// Path to a model checkpoint to start from
        #[arg(short, long)]
        pretrained: Option<PathBuf>,
        /// Path to an optimizer checkpoint (`-optim.mpk`) to resume from
        #[arg(long)]
        optimizer_state: Option<PathBuf>,
        /// Random seed for reproducibility and fold assignment
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Score a checkpoint on the validation split of one fold
    Evaluate {
        /// Path to the model checkpoint (`.mpk`)
        #[arg(short, long)]
        checkpoint: PathBuf,
        #[arg(short, long)]
        data_folder: PathBuf,
        #[arg(long, default_value = "train.csv")]
        train_csv: PathBuf,
        #[arg(short, long, default_value=EncoderType::default())]
        encoder: EncoderType,
        #[arg(short, long, default_value = "0")]
        fold: usize,
        #[arg(long, default_value = "5")]
        total_folds: usize,
        #[arg(short, long, default_value = "4")]
        batch_size: usize,
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        #[arg(long, default_value = "320")]
        height: u32,
        #[arg(long, default_value = "640")]
        width: u32,
        #[arg(long, default_value=LossKind::default())]
        loss: LossKind,
        #[arg(short, long, default_value = "0.5")]
        threshold: f32,
        /// Seed used during training, needed to rebuild its folds
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .context("failed to install the log subscriber")
}

pub fn run() -> anyhow::Result<()> {
    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle", not(feature = "tch"), target_os = "macos"))]
    let device = burn::backend::candle::CandleDevice::Metal(0);
    #[cfg(all(feature = "candle", not(feature = "tch"), not(target_os = "macos")))]
    let device = burn::backend::candle::CandleDevice::Cuda(0);

    #[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    let args = Cli::parse();
    init_logging(args.verbose)?;

    match args.subcmd {
        SubCmd::Train {
            data_folder,
            train_csv,
            artifact_dir,
            config,
            fold,
            total_folds,
            encoder,
            num_epochs,
            train_batch_size,
            val_batch_size,
            effective_batch_size,
            num_workers,
            learning_rate,
            initial_best_metric,
            early_stopping,
            augmentation,
            height,
            width,
            loss,
            threshold,
            pretrained,
            optimizer_state,
            seed,
        } => {
            let config = match config {
                Some(path) => {
                    info!(path = %path.display(), "loading training config");
                    TrainingConfig::load(&path)
                        .map_err(|err| anyhow!("failed to load {}: {err:?}", path.display()))?
                }
                None => TrainingConfig::new(
                    ModelConfig::new(encoder),
                    AdamConfig::new(),
                    ReduceLrOnPlateauConfig::new(),
                    data_folder.context("--data-folder is required without --config")?,
                    train_csv,
                )
                .with_total_folds(total_folds)
                .with_num_epochs(num_epochs)
                .with_train_batch_size(train_batch_size)
                .with_val_batch_size(val_batch_size)
                .with_effective_batch_size(effective_batch_size)
                .with_num_workers(num_workers)
                .with_learning_rate(learning_rate)
                .with_initial_best_metric(initial_best_metric)
                .with_early_stopping(early_stopping)
                .with_augmentation(augmentation)
                .with_image_size([height, width])
                .with_loss(loss)
                .with_threshold(threshold)
                .with_pretrained(pretrained)
                .with_optimizer_state(optimizer_state)
                .with_seed(seed),
            };
            match fold {
                Some(fold) => {
                    let summary =
                        train::<MyAutodiffBackend>(&artifact_dir, config.with_fold(fold), device)?;
                    info!(fold, best_metric = summary.best_metric, "done");
                }
                None => {
                    cross_validate::<MyAutodiffBackend>(&artifact_dir, config, device)?;
                }
            }
        }
        SubCmd::Evaluate {
            checkpoint,
            data_folder,
            train_csv,
            encoder,
            fold,
            total_folds,
            batch_size,
            num_workers,
            height,
            width,
            loss,
            threshold,
            seed,
        } => {
            let evaluation = evaluate::<MyBackend>(
                EvaluateConfig::new(ModelConfig::new(encoder), checkpoint, data_folder, train_csv)
                    .with_fold(fold)
                    .with_total_folds(total_folds)
                    .with_batch_size(batch_size)
                    .with_num_workers(num_workers)
                    .with_image_size([height, width])
                    .with_loss(loss)
                    .with_threshold(threshold)
                    .with_seed(seed),
                device,
            )?;
            serde_json::to_writer_pretty(std::io::stdout(), &evaluation)?;
            println!();
        }
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "segtrain", &mut std::io::stdout());
        }
    }
    Ok(())
}
