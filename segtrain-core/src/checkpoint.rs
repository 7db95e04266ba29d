use crate::model::SegmentationModel;
use crate::scheduler::ReduceLrOnPlateau;
use crate::Result;
use burn::{
    module::Module,
    optim::Optimizer,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};
use tracing::info;

/// Written next to every checkpoint as `<name>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub fold: usize,
    pub encoder: String,
    pub best_metric: f64,
    pub val_dice: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    pub scheduler: ReduceLrOnPlateau,
}

impl CheckpointMeta {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_reader(File::open(path)?)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Best,
    Last,
}

/// Paths of the files making up one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFiles {
    pub model: PathBuf,
    pub optimizer: PathBuf,
    pub meta: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Checkpointer {
    directory: PathBuf,
    encoder: String,
    fold: usize,
}

impl Checkpointer {
    pub fn new(directory: impl Into<PathBuf>, encoder: &str, fold: usize) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            encoder: encoder.to_string(),
            fold,
        })
    }

    pub fn name(&self, kind: CheckpointKind, epoch: usize, dice: f64) -> String {
        let (encoder, fold) = (&self.encoder, self.fold);
        match kind {
            CheckpointKind::Best => {
                format!("model_{encoder}_fold_{fold}_epoch_{epoch}_dice_{dice:.4}")
            }
            CheckpointKind::Last => {
                format!("model_{encoder}_fold_{fold}_last_epoch_{epoch}_dice_{dice:.4}")
            }
        }
    }

    /// Names carry a dotted dice score, so every path gets its extension
    /// spelled out; the recorder would otherwise treat the decimals as one.
    pub fn files(&self, name: &str) -> CheckpointFiles {
        CheckpointFiles {
            model: self.directory.join(format!("{name}.mpk")),
            optimizer: self.directory.join(format!("{name}-optim.mpk")),
            meta: self.directory.join(format!("{name}.json")),
        }
    }

    pub fn save<B, O>(
        &self,
        kind: CheckpointKind,
        model: &SegmentationModel<B>,
        optimizer: &O,
        meta: &CheckpointMeta,
    ) -> Result<CheckpointFiles>
    where
        B: AutodiffBackend,
        O: Optimizer<SegmentationModel<B>, B>,
    {
        let files = self.files(&self.name(kind, meta.epoch, meta.val_dice));
        let recorder = CompactRecorder::new();
        model.clone().save_file(files.model.clone(), &recorder)?;
        Recorder::<B>::record(&recorder, optimizer.to_record(), files.optimizer.clone())?;
        serde_json::to_writer_pretty(BufWriter::new(File::create(&files.meta)?), meta)?;
        info!(path = %files.model.display(), ?kind, "saved checkpoint");
        Ok(files)
    }
}
