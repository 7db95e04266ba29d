use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, ModuleVisitor, ParamId};
use burn::optim::AdamConfig;
use burn::tensor::{backend::Backend as TensorBackend, Tensor};
use image::{Rgb, RgbImage};
use segtrain_core::{
    cross_validate, data::{Annotations, Phase}, evaluate, train, AugmentationLevel, EncoderType,
    Error, EvaluateConfig, LossKind, ModelConfig, ReduceLrOnPlateauConfig, SegmentationModel,
    Trainer, TrainingConfig,
};
use std::fmt::Write as _;
use std::path::Path;

type Backend = NdArray<f32>;
type AutodiffBackend = Autodiff<Backend>;

/// Collects convolution kernels. Batch-norm running statistics move on every
/// forward pass, so they are left out.
#[derive(Default)]
struct Kernels(Vec<f32>);

impl<B: TensorBackend> ModuleVisitor<B> for Kernels {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        if D == 4 {
            self.0
                .extend(tensor.clone().into_data().to_vec::<f32>().unwrap());
        }
    }
}

fn kernels<B: TensorBackend>(model: &SegmentationModel<B>) -> Vec<f32> {
    let mut kernels = Kernels::default();
    model.visit(&mut kernels);
    kernels.0
}

/// Runs one training epoch and reports whether any kernel moved.
fn weights_change_after_one_epoch(dir: &Path, config: TrainingConfig) -> bool {
    let artifacts = tempfile::tempdir().unwrap();
    let device = Default::default();
    let annotations = Annotations::from_csv(dir.join("train.csv")).unwrap();
    let model = ModelConfig::new(EncoderType::Tiny)
        .init::<AutodiffBackend>(&device, annotations.num_classes());
    let optimizer = AdamConfig::new().init::<AutodiffBackend, SegmentationModel<AutodiffBackend>>();
    let mut trainer = Trainer::new(
        config,
        &annotations,
        model,
        optimizer,
        artifacts.path(),
        device,
    )
    .unwrap();

    let before = kernels(trainer.model());
    trainer.iterate(0, Phase::Train).unwrap();
    before != kernels(trainer.model())
}

const WIDTH: u32 = 32;
const HEIGHT: u32 = 16;

/// Eight images with a bright rectangle, annotated for two classes.
fn write_dataset(dir: &Path) {
    let mut table = String::from("Image_Label,EncodedPixels\n");
    for i in 0..8u32 {
        let name = format!("img{i}.png");
        let left = 2 + i;
        RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
            if (left..left + 8).contains(&x) && (4..12).contains(&y) {
                Rgb([220, 200, 180])
            } else {
                Rgb([20, 30, 40])
            }
        })
        .save(dir.join(&name))
        .unwrap();

        // column-major runs: rows 4..12 of columns left..left + 8
        let rle = (left..left + 8)
            .map(|x| format!("{} 8", x * HEIGHT + 4 + 1))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(table, "{name}_Fish,{rle}").unwrap();
        let second = if i % 2 == 0 { "1 16" } else { "" };
        writeln!(table, "{name}_Gravel,{second}").unwrap();
    }
    std::fs::write(dir.join("train.csv"), table).unwrap();
}

fn config(dir: &Path) -> TrainingConfig {
    TrainingConfig::new(
        ModelConfig::new(EncoderType::Tiny),
        AdamConfig::new(),
        ReduceLrOnPlateauConfig::new(),
        dir.to_path_buf(),
        dir.join("train.csv"),
    )
    .with_total_folds(2)
    .with_train_batch_size(2)
    .with_val_batch_size(2)
    .with_effective_batch_size(4)
    .with_num_workers(1)
    .with_image_size([HEIGHT, WIDTH])
    .with_augmentation(AugmentationLevel::Level1)
    .with_loss(LossKind::BceDice)
    .with_learning_rate(1e-3)
}

#[test]
fn trains_a_fold_and_writes_checkpoints() {
    let data = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    write_dataset(data.path());

    let summary = train::<AutodiffBackend>(
        artifacts.path(),
        config(data.path())
            .with_num_epochs(2)
            .with_initial_best_metric(-1.0),
        Default::default(),
    )
    .unwrap();

    assert_eq!(summary.fold, 0);
    assert_eq!(summary.epochs_run, 2);
    assert!(!summary.early_stopped);
    assert_eq!(summary.history.train_loss.len(), 2);
    assert_eq!(summary.history.val_dice.len(), 2);
    assert_eq!(summary.history.learning_rate.len(), 2);
    assert!(summary.history.train_loss.iter().all(|l| l.is_finite()));

    let best = summary.best_checkpoint.expect("first epoch beats -1");
    assert!(best.model.is_file());
    assert!(best.optimizer.is_file());
    assert!(best.meta.is_file());
    assert!(best
        .model
        .starts_with(artifacts.path().join("model_weights")));

    let last = summary.last_checkpoint.expect("more than one epoch");
    assert!(last
        .model
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("model_tiny_fold_0_last_epoch_1_dice_"));

    assert!(artifacts.path().join("train_config.json").is_file());
    assert!(artifacts.path().join("fold_0_history.json").is_file());

    let evaluation = evaluate::<Backend>(
        EvaluateConfig::new(
            ModelConfig::new(EncoderType::Tiny),
            best.model,
            data.path().to_path_buf(),
            data.path().join("train.csv"),
        )
        .with_total_folds(2)
        .with_batch_size(2)
        .with_num_workers(1)
        .with_image_size([HEIGHT, WIDTH]),
        Default::default(),
    )
    .unwrap();
    assert!(evaluation.loss.is_finite());
    assert!((0.0..=1.0).contains(&evaluation.metrics.dice));
}

#[test]
fn stops_early_without_improvement() {
    let data = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    write_dataset(data.path());

    let summary = train::<AutodiffBackend>(
        artifacts.path(),
        config(data.path())
            .with_fold(1)
            .with_num_epochs(3)
            .with_early_stopping(Some(1))
            .with_initial_best_metric(2.0),
        Default::default(),
    )
    .unwrap();

    assert!(summary.early_stopped);
    assert_eq!(summary.epochs_run, 1);
    assert!(summary.best_checkpoint.is_none());
    assert_eq!(summary.best_metric, 2.0);
    let last = summary.last_checkpoint.expect("early stop saves the last epoch");
    assert!(last.optimizer.is_file());
}

#[test]
fn rejects_image_sizes_the_encoder_cannot_handle() {
    let data = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    write_dataset(data.path());
    let result = train::<AutodiffBackend>(
        artifacts.path(),
        config(data.path()).with_image_size([18, 32]),
        Default::default(),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn incomplete_accumulation_windows_never_step() {
    let data = tempfile::tempdir().unwrap();
    write_dataset(data.path());
    // four training images in batches of two never fill a window of 32 batches
    let config = config(data.path()).with_effective_batch_size(64);
    assert_eq!(config.accumulation_steps(), 32);
    assert!(!weights_change_after_one_epoch(data.path(), config));
}

#[test]
fn full_accumulation_windows_step() {
    let data = tempfile::tempdir().unwrap();
    write_dataset(data.path());
    let config = config(data.path()).with_effective_batch_size(2);
    assert_eq!(config.accumulation_steps(), 1);
    assert!(weights_change_after_one_epoch(data.path(), config));
}

#[test]
fn cross_validation_trains_every_fold() {
    let data = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    write_dataset(data.path());

    let summaries = cross_validate::<AutodiffBackend>(
        artifacts.path(),
        config(data.path())
            .with_num_epochs(1)
            .with_initial_best_metric(-1.0),
        Default::default(),
    )
    .unwrap();

    assert_eq!(
        summaries.iter().map(|s| s.fold).collect::<Vec<_>>(),
        vec![0, 1]
    );
    for summary in &summaries {
        assert_eq!(summary.epochs_run, 1);
        let best = summary.best_checkpoint.as_ref().expect("first epoch beats -1");
        assert!(best.model.is_file());
        assert!(artifacts
            .path()
            .join(format!("fold_{}_history.json", summary.fold))
            .is_file());
    }
}

#[test]
fn evaluation_rejects_inputs_the_model_cannot_take() {
    let data = tempfile::tempdir().unwrap();
    write_dataset(data.path());
    let config = EvaluateConfig::new(
        ModelConfig::new(EncoderType::Tiny),
        data.path().join("missing.mpk"),
        data.path().to_path_buf(),
        data.path().join("train.csv"),
    )
    .with_total_folds(2)
    .with_num_workers(1);

    let odd_size = evaluate::<Backend>(config.clone().with_image_size([18, 32]), Default::default());
    assert!(matches!(odd_size, Err(Error::Config(_))));
    let no_batch = evaluate::<Backend>(
        config.with_image_size([HEIGHT, WIDTH]).with_batch_size(0),
        Default::default(),
    );
    assert!(matches!(no_batch, Err(Error::Config(_))));
}
