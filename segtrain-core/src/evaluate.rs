use crate::{
    augment::{validation_augmentation, Preprocessing, IMAGENET_MEAN, IMAGENET_STD},
    data::{provider, Annotations, Phase, SegmentationDataset},
    folds::FoldSplit,
    loss::{LossKind, SegmentationLoss},
    metric::{epoch_log, EpochMetrics, Meter},
    train::{progress_bar, validate},
    Error, ModelConfig,
};
use burn::{
    config::Config,
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Instant};
use tracing::info;

#[derive(Config, Debug)]
pub struct EvaluateConfig {
    model: ModelConfig,
    /// Model record written by training (`.mpk`)
    checkpoint: PathBuf,
    data_folder: PathBuf,
    train_csv: PathBuf,
    #[config(default = 0)]
    fold: usize,
    #[config(default = 5)]
    total_folds: usize,
    #[config(default = 4)]
    batch_size: usize,
    #[config(default = 4)]
    num_workers: usize,
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
    /// Must match the seed used for training to reproduce the fold split
    #[config(default = 42)]
    seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub fold: usize,
    pub loss: f64,
    pub metrics: EpochMetrics,
}

/// Scores a saved checkpoint on the validation part of one fold.
pub fn evaluate<B: Backend>(config: EvaluateConfig, device: B::Device) -> crate::Result<Evaluation> {
    if config.batch_size == 0 {
        return Err(Error::Config("batch size must be positive".into()));
    }
    if config.fold >= config.total_folds {
        return Err(Error::Config(format!(
            "fold {} is out of range for {} folds",
            config.fold, config.total_folds
        )));
    }
    config.model.check_image_size(config.image_size)?;

    let annotations = Annotations::from_csv(&config.train_csv)?;
    let split = FoldSplit::new(
        &annotations.strata(),
        config.fold,
        config.total_folds,
        config.seed,
    )?;
    let dataset = SegmentationDataset::new(
        &config.data_folder,
        &annotations,
        &split.val,
        validation_augmentation(config.image_size),
        Preprocessing::new(config.mean, config.std),
    )?;

    info!(checkpoint = %config.checkpoint.display(), fold = config.fold, "evaluating");
    let record = Recorder::<B>::load(&CompactRecorder::new(), config.checkpoint.clone(), &device)?;
    let model = config
        .model
        .init::<B>(&device, annotations.num_classes())
        .load_record(record);

    let batches = split.val.len().div_ceil(config.batch_size);
    let loader = provider::<B>(
        dataset,
        Phase::Val,
        config.batch_size,
        config.num_workers,
        config.seed,
        device,
    );

    let started = Instant::now();
    let mut meter = Meter::new(config.threshold);
    let progress = progress_bar(batches, 0, Phase::Val);
    let loss = validate(
        &model,
        loader.as_ref(),
        &SegmentationLoss::new(config.loss),
        &mut meter,
        &progress,
    )?;
    progress.finish_and_clear();

    Ok(Evaluation {
        fold: config.fold,
        loss,
        metrics: epoch_log(Phase::Val, 0, loss, &meter, started),
    })
}
