use crate::Error;
use burn::config::Config;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Smallest learning rate change that is actually applied.
const MIN_LR_DELTA: f64 = 1e-8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateauMode {
    #[default]
    Min,
    Max,
}

#[derive(Config, Debug)]
pub struct ReduceLrOnPlateauConfig {
    #[config(default = 0.9)]
    factor: f64,
    #[config(default = 3)]
    patience: usize,
    /// Relative improvement needed to count as a better metric.
    #[config(default = 1.0e-4)]
    threshold: f64,
    #[config(default = 0)]
    cooldown: usize,
    #[config(default = 0.0)]
    min_lr: f64,
    #[config(default = "PlateauMode::Min")]
    mode: PlateauMode,
}

impl ReduceLrOnPlateauConfig {
    pub fn init(&self, initial_lr: f64) -> crate::Result<ReduceLrOnPlateau> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(Error::Config(format!(
                "plateau factor must be in (0, 1), got {}",
                self.factor
            )));
        }
        if !(initial_lr > 0.0) {
            return Err(Error::Config(format!(
                "learning rate must be positive, got {initial_lr}"
            )));
        }
        Ok(ReduceLrOnPlateau {
            factor: self.factor,
            patience: self.patience,
            threshold: self.threshold,
            cooldown: self.cooldown,
            min_lr: self.min_lr,
            mode: self.mode,
            lr: initial_lr,
            best: None,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        })
    }
}

/// Decays the learning rate once a monitored metric stops improving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    threshold: f64,
    cooldown: usize,
    min_lr: f64,
    mode: PlateauMode,
    lr: f64,
    best: Option<f64>,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Feeds one epoch's metric and returns the learning rate for the next epoch.
    pub fn step(&mut self, metric: f64) -> f64 {
        if !metric.is_finite() {
            warn!(metric, "ignoring non-finite metric in plateau scheduler");
            return self.lr;
        }

        if self.is_better(metric) {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            let lr = (self.lr * self.factor).max(self.min_lr);
            if self.lr - lr > MIN_LR_DELTA {
                info!(from = self.lr, to = lr, "reducing learning rate");
                self.lr = lr;
            }
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
        }

        self.lr
    }

    fn is_better(&self, metric: f64) -> bool {
        let Some(best) = self.best else {
            return true;
        };
        match self.mode {
            PlateauMode::Min => metric < best * (1.0 - self.threshold),
            PlateauMode::Max => metric > best * (1.0 + self.threshold),
        }
    }
}
