pub mod augment;
pub mod checkpoint;
#[cfg(any(feature = "tch", feature = "candle", feature = "ndarray"))]
mod cli;
pub mod data;
mod error;
mod evaluate;
pub mod folds;
pub mod loss;
pub mod metric;
pub mod model;
pub mod scheduler;
mod train;
pub mod transforms;

pub use augment::{training_augmentation, validation_augmentation, AugmentationLevel, Compose};
#[cfg(any(feature = "tch", feature = "candle", feature = "ndarray"))]
pub use cli::run;
pub use error::{Error, Result};
pub use evaluate::{evaluate, EvaluateConfig, Evaluation};
pub use loss::LossKind;
pub use model::{EncoderType, ModelConfig, SegmentationModel};
pub use scheduler::{PlateauMode, ReduceLrOnPlateauConfig};
pub use train::{cross_validate, train, History, Trainer, TrainingConfig, TrainingSummary};
