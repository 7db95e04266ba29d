use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use clap::builder::OsStr;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-7;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LossKind {
    Bce,
    Dice,
    Jaccard,
    #[default]
    BceDice,
}

impl From<LossKind> for OsStr {
    fn from(value: LossKind) -> Self {
        match value {
            LossKind::Bce => "bce",
            LossKind::Dice => "dice",
            LossKind::Jaccard => "jaccard",
            LossKind::BceDice => "bce-dice",
        }
        .into()
    }
}

/// Loss over raw logits and binary target masks of the same shape.
#[derive(Debug, Clone, Copy)]
pub struct SegmentationLoss {
    kind: LossKind,
}

impl SegmentationLoss {
    pub fn new(kind: LossKind) -> Self {
        Self { kind }
    }

    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        match self.kind {
            LossKind::Bce => bce_with_logits(logits, targets),
            LossKind::Dice => dice_loss(sigmoid(logits), targets),
            LossKind::Jaccard => jaccard_loss(sigmoid(logits), targets),
            LossKind::BceDice => {
                bce_with_logits(logits.clone(), targets.clone()) + dice_loss(sigmoid(logits), targets)
            }
        }
    }
}

/// `max(x, 0) - x * y + log(1 + exp(-|x|))`, averaged.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let loss = logits.clone().clamp_min(0.0) - logits.clone() * targets
        + logits.abs().neg().exp().log1p();
    loss.mean()
}

/// `1 - F1` computed over the whole batch.
pub fn dice_loss<B: Backend, const D: usize>(
    probabilities: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let tp = (probabilities.clone() * targets.clone()).sum();
    let fp = probabilities.sum() - tp.clone();
    let fn_ = targets.sum() - tp.clone();
    let numerator = tp.clone().mul_scalar(2.0).add_scalar(EPS);
    let denominator = (tp.mul_scalar(2.0) + fn_ + fp).add_scalar(EPS);
    (numerator / denominator).neg().add_scalar(1.0)
}

pub fn jaccard_loss<B: Backend, const D: usize>(
    probabilities: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let intersection = (probabilities.clone() * targets.clone()).sum();
    let union = probabilities.sum() + targets.sum() - intersection.clone();
    (intersection.add_scalar(EPS) / union.add_scalar(EPS))
        .neg()
        .add_scalar(1.0)
}
