use crate::{
    augment::{
        training_augmentation, validation_augmentation, AugmentationLevel, Preprocessing,
        IMAGENET_MEAN, IMAGENET_STD,
    },
    checkpoint::{CheckpointFiles, CheckpointKind, CheckpointMeta, Checkpointer},
    data::{provider, Annotations, Phase, SegmentationBatch, SegmentationDataset},
    folds::FoldSplit,
    loss::{LossKind, SegmentationLoss},
    metric::{epoch_log, EpochMetrics, Meter},
    model::{ModelConfig, SegmentationModel},
    scheduler::{ReduceLrOnPlateau, ReduceLrOnPlateauConfig},
    Error,
};
use burn::{
    data::dataloader::DataLoader,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tracing::{info, warn};

#[derive(Config)]
pub struct TrainingConfig {
    model: ModelConfig,
    optimizer: AdamConfig,
    scheduler: ReduceLrOnPlateauConfig,
    /// Directory holding the images named in the annotation table
    data_folder: PathBuf,
    /// `Image_Label,EncodedPixels` table
    train_csv: PathBuf,
    #[config(default = 0)]
    fold: usize,
    #[config(default = 5)]
    total_folds: usize,
    #[config(default = 30)]
    num_epochs: usize,
    #[config(default = 4)]
    train_batch_size: usize,
    #[config(default = 4)]
    val_batch_size: usize,
    /// Batches are accumulated until this many samples contributed to the gradient
    #[config(default = 32)]
    effective_batch_size: usize,
    #[config(default = 4)]
    num_workers: usize,
    #[config(default = 5.0e-4)]
    learning_rate: f64,
    #[config(default = 0.0)]
    initial_best_metric: f64,
    early_stopping: Option<usize>,
    #[config(default = "AugmentationLevel::Default")]
    augmentation: AugmentationLevel,
    /// `[height, width]` fed to the network
    #[config(default = "[320, 640]")]
    image_size: [u32; 2],
    #[config(default = "IMAGENET_MEAN")]
    mean: [f32; 3],
    #[config(default = "IMAGENET_STD")]
    std: [f32; 3],
    #[config(default = "LossKind::BceDice")]
    loss: LossKind,
    #[config(default = 0.5)]
    threshold: f32,
    #[config(default = 42)]
    seed: u64,
    pretrained: Option<PathBuf>,
    optimizer_state: Option<PathBuf>,
}

impl TrainingConfig {
    pub fn accumulation_steps(&self) -> usize {
        (self.effective_batch_size / self.train_batch_size.max(1)).max(1)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.train_batch_size == 0 || self.val_batch_size == 0 {
            return Err(Error::Config("batch sizes must be positive".into()));
        }
        if self.num_epochs == 0 {
            return Err(Error::Config("num_epochs must be positive".into()));
        }
        self.model.check_image_size(self.image_size)?;
        if self.fold >= self.total_folds {
            return Err(Error::Config(format!(
                "fold {} is out of range for {} folds",
                self.fold, self.total_folds
            )));
        }
        Ok(())
    }
}

/// Loss and dice per epoch, one entry per completed phase.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub train_loss: Vec<f64>,
    pub train_dice: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_dice: Vec<f64>,
    pub learning_rate: Vec<f64>,
}

impl History {
    fn record(&mut self, phase: Phase, loss: f64, dice: f64) {
        match phase {
            Phase::Train => {
                self.train_loss.push(loss);
                self.train_dice.push(dice);
            }
            Phase::Val => {
                self.val_loss.push(loss);
                self.val_dice.push(dice);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub fold: usize,
    pub best_metric: f64,
    pub best_epoch: Option<usize>,
    pub epochs_run: usize,
    pub early_stopped: bool,
    pub best_checkpoint: Option<CheckpointFiles>,
    pub last_checkpoint: Option<CheckpointFiles>,
    pub history: History,
}

/// Trains one fold with gradient accumulation, plateau scheduling, early
/// stopping and checkpointing.
pub struct Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<SegmentationModel<B>, B>,
{
    config: TrainingConfig,
    model: SegmentationModel<B>,
    optimizer: O,
    scheduler: ReduceLrOnPlateau,
    criterion: SegmentationLoss,
    train_loader: Arc<dyn DataLoader<SegmentationBatch<B>>>,
    val_loader: Arc<dyn DataLoader<SegmentationBatch<B::InnerBackend>>>,
    train_batches: usize,
    val_batches: usize,
    checkpointer: Checkpointer,
    best_metric: f64,
    history: History,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<SegmentationModel<B>, B>,
{
    pub fn new(
        config: TrainingConfig,
        annotations: &Annotations,
        model: SegmentationModel<B>,
        optimizer: O,
        artifact_dir: &Path,
        device: B::Device,
    ) -> crate::Result<Self> {
        config.validate()?;
        let split = FoldSplit::new(
            &annotations.strata(),
            config.fold,
            config.total_folds,
            config.seed,
        )?;
        info!(
            fold = config.fold,
            train = split.train.len(),
            val = split.val.len(),
            "split annotations"
        );

        let preprocessing = Preprocessing::new(config.mean, config.std);
        let train_set = SegmentationDataset::new(
            &config.data_folder,
            annotations,
            &split.train,
            training_augmentation(config.augmentation, config.image_size),
            preprocessing.clone(),
        )?;
        let val_set = SegmentationDataset::new(
            &config.data_folder,
            annotations,
            &split.val,
            validation_augmentation(config.image_size),
            preprocessing,
        )?;
        let train_batches = split.train.len().div_ceil(config.train_batch_size);
        let val_batches = split.val.len().div_ceil(config.val_batch_size);

        let train_loader = provider::<B>(
            train_set,
            Phase::Train,
            config.train_batch_size,
            config.num_workers,
            config.seed,
            device.clone(),
        );
        let val_loader = provider::<B::InnerBackend>(
            val_set,
            Phase::Val,
            config.val_batch_size,
            config.num_workers,
            config.seed,
            device,
        );

        let checkpointer = Checkpointer::new(
            artifact_dir.join("model_weights"),
            config.model.encoder().name(),
            config.fold,
        )?;

        Ok(Self {
            scheduler: config.scheduler.init(config.learning_rate)?,
            criterion: SegmentationLoss::new(config.loss),
            best_metric: config.initial_best_metric,
            config,
            model,
            optimizer,
            train_loader,
            val_loader,
            train_batches,
            val_batches,
            checkpointer,
            history: History::default(),
        })
    }

    pub fn model(&self) -> &SegmentationModel<B> {
        &self.model
    }

    /// Runs one pass over the phase's loader and returns the mean batch loss
    /// together with the epoch metrics.
    pub fn iterate(&mut self, epoch: usize, phase: Phase) -> crate::Result<(f64, EpochMetrics)> {
        let started = Instant::now();
        info!(fold = self.config.fold, epoch, %phase, lr = self.scheduler.lr(), "starting epoch");
        let mut meter = Meter::new(self.config.threshold);
        let epoch_loss = match phase {
            Phase::Train => {
                let progress = progress_bar(self.train_batches, epoch, phase);
                let loss = self.train_epoch(&mut meter, &progress)?;
                progress.finish_and_clear();
                loss
            }
            Phase::Val => {
                let progress = progress_bar(self.val_batches, epoch, phase);
                let loss = validate(
                    &self.model.valid(),
                    self.val_loader.as_ref(),
                    &self.criterion,
                    &mut meter,
                    &progress,
                )?;
                progress.finish_and_clear();
                loss
            }
        };
        let metrics = epoch_log(phase, epoch, epoch_loss, &meter, started);
        self.history.record(phase, epoch_loss, metrics.dice);
        Ok((epoch_loss, metrics))
    }

    fn train_epoch(&mut self, meter: &mut Meter, progress: &ProgressBar) -> crate::Result<f64> {
        let steps = self.config.accumulation_steps();
        let lr = self.scheduler.lr();
        let loader = Arc::clone(&self.train_loader);
        let mut accumulator = GradientsAccumulator::<SegmentationModel<B>>::new();
        let mut running_loss = 0.0;
        let mut batches = 0usize;

        for batch in loader.iter() {
            let output = self.model.forward(batch.images);
            let loss = self
                .criterion
                .forward(output.clone(), batch.masks.clone())
                .div_scalar(steps as f64);
            running_loss += loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            accumulator.accumulate(&self.model, grads);
            batches += 1;
            if batches % steps == 0 {
                self.model = self
                    .optimizer
                    .step(lr, self.model.clone(), accumulator.grads());
            }

            meter.update(batch.masks, output.detach())?;
            progress.inc(1);
            progress.set_message(format!("loss {:.4}", running_loss * steps as f64 / batches as f64));
        }

        if batches % steps != 0 {
            warn!(
                leftover = batches % steps,
                "discarding gradients of an incomplete accumulation window"
            );
        }
        Ok(mean_loss(running_loss * steps as f64, batches))
    }

    /// Runs the epoch loop and returns what happened to the fold.
    pub fn start(mut self) -> crate::Result<TrainingSummary> {
        let fold = self.config.fold;
        let mut epochs_without_improvement = 0;
        let mut best_epoch = None;
        let mut best_checkpoint = None;
        let mut last_meta: Option<CheckpointMeta> = None;
        let mut early_stopped = false;
        let mut epochs_run = 0;

        for epoch in 0..self.config.num_epochs {
            if let Some(limit) = self.config.early_stopping {
                if epochs_without_improvement >= limit {
                    info!(
                        fold,
                        epoch,
                        limit,
                        best = self.best_metric,
                        "no improvement for {limit} epochs, stopping early"
                    );
                    early_stopped = true;
                    break;
                }
            }

            self.iterate(epoch, Phase::Train)?;
            let (val_loss, val_metrics) = self.iterate(epoch, Phase::Val)?;
            let lr = self.scheduler.step(val_loss);
            self.history.learning_rate.push(lr);

            let improved = val_metrics.dice > self.best_metric;
            if improved {
                self.best_metric = val_metrics.dice;
            }
            let meta = CheckpointMeta {
                epoch,
                fold,
                encoder: self.config.model.encoder().name().to_string(),
                best_metric: self.best_metric,
                val_dice: val_metrics.dice,
                val_loss,
                learning_rate: lr,
                scheduler: self.scheduler.clone(),
            };
            if improved {
                info!(fold, epoch, dice = val_metrics.dice, "new optimal found, saving state");
                best_checkpoint = Some(self.checkpointer.save(
                    CheckpointKind::Best,
                    &self.model,
                    &self.optimizer,
                    &meta,
                )?);
                best_epoch = Some(epoch);
                epochs_without_improvement = 0;
            } else {
                epochs_without_improvement += 1;
            }
            last_meta = Some(meta);
            epochs_run += 1;
        }

        let mut last_checkpoint = None;
        if let Some(meta) = last_meta.filter(|_| early_stopped || self.config.num_epochs > 1) {
            last_checkpoint = Some(self.checkpointer.save(
                CheckpointKind::Last,
                &self.model,
                &self.optimizer,
                &meta,
            )?);
        }

        Ok(TrainingSummary {
            fold,
            best_metric: self.best_metric,
            best_epoch,
            epochs_run,
            early_stopped,
            best_checkpoint,
            last_checkpoint,
            history: self.history,
        })
    }
}

/// Evaluates `model` over `loader` without touching gradients.
pub(crate) fn validate<B: Backend>(
    model: &SegmentationModel<B>,
    loader: &dyn DataLoader<SegmentationBatch<B>>,
    criterion: &SegmentationLoss,
    meter: &mut Meter,
    progress: &ProgressBar,
) -> crate::Result<f64> {
    let mut running_loss = 0.0;
    let mut batches = 0usize;
    for batch in loader.iter() {
        let output = model.forward(batch.images);
        let loss = criterion.forward(output.clone(), batch.masks.clone());
        running_loss += loss.into_scalar().elem::<f64>();
        batches += 1;
        meter.update(batch.masks, output)?;
        progress.inc(1);
        progress.set_message(format!("loss {:.4}", running_loss / batches as f64));
    }
    Ok(mean_loss(running_loss, batches))
}

fn mean_loss(total: f64, batches: usize) -> f64 {
    if batches == 0 {
        f64::NAN
    } else {
        total / batches as f64
    }
}

pub(crate) fn progress_bar(len: usize, epoch: usize, phase: Phase) -> ProgressBar {
    let progress = ProgressBar::new(len as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    progress.set_prefix(format!("epoch {epoch} {phase}"));
    progress
}

fn create_artifact_dir(artifact_dir: &Path) -> crate::Result<()> {
    std::fs::create_dir_all(artifact_dir)?;
    Ok(())
}

fn init_model<B: Backend>(
    config: &TrainingConfig,
    num_classes: usize,
    device: &B::Device,
) -> crate::Result<SegmentationModel<B>> {
    let model = config.model.init::<B>(device, num_classes);
    match &config.pretrained {
        Some(path) => {
            info!(path = %path.display(), "loading pretrained weights");
            let record = Recorder::<B>::load(&CompactRecorder::new(), path.clone(), device)?;
            Ok(model.load_record(record))
        }
        None => Ok(model),
    }
}

fn train_fold<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: TrainingConfig,
    annotations: &Annotations,
    device: B::Device,
) -> crate::Result<TrainingSummary> {
    let fold = config.fold;
    let model = init_model::<B>(&config, annotations.num_classes(), &device)?;
    let mut optimizer = config.optimizer.init::<B, SegmentationModel<B>>();
    if let Some(path) = &config.optimizer_state {
        info!(path = %path.display(), "restoring optimizer state");
        let record = Recorder::<B>::load(&CompactRecorder::new(), path.clone(), &device)?;
        optimizer = optimizer.load_record(record);
    }

    let summary = Trainer::new(config, annotations, model, optimizer, artifact_dir, device)?.start()?;
    let history_path = artifact_dir.join(format!("fold_{fold}_history.json"));
    serde_json::to_writer_pretty(BufWriter::new(File::create(&history_path)?), &summary)?;
    info!(
        fold,
        best_metric = summary.best_metric,
        epochs = summary.epochs_run,
        "finished fold"
    );
    Ok(summary)
}

/// Trains the fold named by `config`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: impl AsRef<Path>,
    config: TrainingConfig,
    device: B::Device,
) -> crate::Result<TrainingSummary> {
    let artifact_dir = artifact_dir.as_ref();
    create_artifact_dir(artifact_dir)?;
    config.validate()?;

    B::seed(config.seed);
    config.save(artifact_dir.join("train_config.json"))?;

    let annotations = Annotations::from_csv(&config.train_csv)?;
    train_fold::<B>(artifact_dir, config, &annotations, device)
}

/// Trains every fold in turn, each from a freshly initialized model.
pub fn cross_validate<B: AutodiffBackend>(
    artifact_dir: impl AsRef<Path>,
    config: TrainingConfig,
    device: B::Device,
) -> crate::Result<Vec<TrainingSummary>> {
    let artifact_dir = artifact_dir.as_ref();
    create_artifact_dir(artifact_dir)?;
    config.validate()?;
    config.save(artifact_dir.join("train_config.json"))?;

    let annotations = Annotations::from_csv(&config.train_csv)?;
    let mut summaries = Vec::with_capacity(config.total_folds);
    for fold in 0..config.total_folds {
        B::seed(config.seed);
        let config = config.clone().with_fold(fold);
        summaries.push(train_fold::<B>(artifact_dir, config, &annotations, device.clone())?);
    }

    let mean = summaries.iter().map(|s| s.best_metric).sum::<f64>() / summaries.len() as f64;
    info!(folds = summaries.len(), mean_best_dice = mean, "cross-validation finished");
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EncoderType;

    fn config() -> TrainingConfig {
        TrainingConfig::new(
            ModelConfig::new(EncoderType::Small),
            AdamConfig::new(),
            ReduceLrOnPlateauConfig::new(),
            "images".into(),
            "train.csv".into(),
        )
    }

    #[test]
    fn accumulation_follows_the_effective_batch() {
        assert_eq!(config().accumulation_steps(), 8);
        assert_eq!(config().with_train_batch_size(5).accumulation_steps(), 6);
        assert_eq!(config().with_train_batch_size(64).accumulation_steps(), 1);
    }

    #[test]
    fn defaults_match_the_reference_setup() {
        let config = config();
        assert_eq!(config.total_folds, 5);
        assert_eq!(config.num_epochs, 30);
        assert_eq!(config.image_size, [320, 640]);
        assert_eq!(config.loss, LossKind::BceDice);
        assert_eq!(config.augmentation, AugmentationLevel::Default);
        assert!(config.early_stopping.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_sizes_the_encoder_cannot_halve() {
        assert!(config().with_image_size([300, 640]).validate().is_err());
        assert!(config().with_fold(5).validate().is_err());
        assert!(config().with_train_batch_size(0).validate().is_err());
    }

    #[test]
    fn history_is_recorded_per_phase() {
        let mut history = History::default();
        history.record(Phase::Train, 0.9, 0.1);
        history.record(Phase::Val, 0.8, 0.2);
        assert_eq!(history.train_loss, vec![0.9]);
        assert_eq!(history.val_dice, vec![0.2]);
    }
}
