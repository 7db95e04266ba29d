use crate::data::Phase;
use crate::{Error, Result};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub dice: f64,
    pub dice_neg: f64,
    pub dice_pos: f64,
    pub iou: f64,
}

/// Accumulates per-plane dice and IoU over an epoch.
///
/// A plane is one class channel of one image. Planes with empty ground truth
/// score into `dice_neg`, the rest into `dice_pos`; both feed `dice`.
#[derive(Debug, Clone)]
pub struct Meter {
    threshold: f32,
    dice: Vec<f64>,
    dice_neg: Vec<f64>,
    dice_pos: Vec<f64>,
    iou: Vec<f64>,
}

impl Meter {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            dice: Vec::new(),
            dice_neg: Vec::new(),
            dice_pos: Vec::new(),
            iou: Vec::new(),
        }
    }

    /// `targets` and `logits` are `[batch_size, num_classes, height, width]`.
    pub fn update<B: Backend>(&mut self, targets: Tensor<B, 4>, logits: Tensor<B, 4>) -> Result<()> {
        let [_, _, height, width] = logits.dims();
        let probabilities = sigmoid(logits)
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| Error::Tensor(format!("{err:?}")))?;
        let truth = targets
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| Error::Tensor(format!("{err:?}")))?;
        self.update_planes(&probabilities, &truth, height * width);
        Ok(())
    }

    pub fn update_planes(&mut self, probabilities: &[f32], truth: &[f32], plane_len: usize) {
        for (prediction, truth) in probabilities
            .chunks(plane_len)
            .zip(truth.chunks(plane_len))
        {
            let (mut predicted, mut expected, mut overlap) = (0usize, 0usize, 0usize);
            for (&p, &t) in prediction.iter().zip(truth) {
                let p = p > self.threshold;
                let t = t > 0.5;
                predicted += p as usize;
                expected += t as usize;
                overlap += (p && t) as usize;
            }

            if expected == 0 {
                let score = if predicted == 0 { 1.0 } else { 0.0 };
                self.dice_neg.push(score);
                self.dice.push(score);
            } else {
                let score = 2.0 * overlap as f64 / (predicted + expected) as f64;
                self.dice_pos.push(score);
                self.dice.push(score);
            }

            let union = predicted + expected - overlap;
            if union > 0 {
                self.iou.push(overlap as f64 / union as f64);
            }
        }
    }

    pub fn metrics(&self) -> EpochMetrics {
        EpochMetrics {
            dice: nanmean(&self.dice),
            dice_neg: nanmean(&self.dice_neg),
            dice_pos: nanmean(&self.dice_pos),
            iou: nanmean(&self.iou),
        }
    }
}

fn nanmean(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

pub fn epoch_log(phase: Phase, epoch: usize, epoch_loss: f64, meter: &Meter, started: Instant) -> EpochMetrics {
    let metrics = meter.metrics();
    info!(
        %phase,
        epoch,
        "Loss: {:.4} | IoU: {:.4} | dice: {:.4} | dice_neg: {:.4} | dice_pos: {:.4} | {:.1?}",
        epoch_loss,
        metrics.iou,
        metrics.dice,
        metrics.dice_neg,
        metrics.dice_pos,
        started.elapsed(),
    );
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    #[test]
    fn splits_planes_into_positive_and_negative() {
        let mut meter = Meter::new(0.5);
        // plane 0: empty truth, empty prediction
        // plane 1: empty truth, one false positive
        // plane 2: truth {0, 1}, prediction {1, 2}
        let probabilities = [0.1, 0.2, 0.3, 0.0, 0.9, 0.0, 0.0, 0.0, 0.2, 0.8, 0.7, 0.1];
        let truth = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0];
        meter.update_planes(&probabilities, &truth, 4);

        let metrics = meter.metrics();
        assert_eq!(metrics.dice_neg, 0.5);
        assert_eq!(metrics.dice_pos, 0.5);
        assert!((metrics.dice - 0.5).abs() < 1e-12);
        // plane 0 has no union, plane 1 scores 0, plane 2 scores 1/3
        assert!((metrics.iou - 1.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn empty_categories_are_nan() {
        let mut meter = Meter::new(0.5);
        meter.update_planes(&[0.0, 0.0], &[0.0, 0.0], 2);
        let metrics = meter.metrics();
        assert_eq!(metrics.dice, 1.0);
        assert!(metrics.dice_pos.is_nan());
        assert!(metrics.iou.is_nan());
        assert!(Meter::new(0.5).metrics().dice.is_nan());
    }

    #[test]
    fn update_applies_sigmoid_to_logits() {
        let device = Default::default();
        let logits = Tensor::<NdArray<f32>, 4>::from_data(
            TensorData::new(vec![5.0, -5.0, 5.0, -5.0], [1, 2, 1, 2]),
            &device,
        );
        let targets = Tensor::<NdArray<f32>, 4>::from_data(
            TensorData::new(vec![1.0, 0.0, 1.0, 0.0], [1, 2, 1, 2]),
            &device,
        );
        let mut meter = Meter::new(0.5);
        meter.update(targets, logits).unwrap();
        let metrics = meter.metrics();
        assert_eq!(metrics.dice, 1.0);
        assert_eq!(metrics.iou, 1.0);
    }
}
