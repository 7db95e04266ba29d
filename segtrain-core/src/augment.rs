use crate::transforms::{Sample, Transform};
use crate::{Error, Result};
use clap::{builder::OsStr, ValueEnum};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Named training augmentation policies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum AugmentationLevel {
    #[default]
    #[value(name = "default")]
    #[serde(rename = "default")]
    Default,
    #[value(name = "1")]
    #[serde(rename = "1")]
    Level1,
    #[value(name = "2")]
    #[serde(rename = "2")]
    Level2,
}

impl AugmentationLevel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Level1 => "1",
            Self::Level2 => "2",
        }
    }
}

impl fmt::Display for AugmentationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AugmentationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "1" => Ok(Self::Level1),
            "2" => Ok(Self::Level2),
            other => Err(Error::UnknownAugmentation(other.to_string())),
        }
    }
}

impl From<AugmentationLevel> for OsStr {
    fn from(value: AugmentationLevel) -> Self {
        value.name().into()
    }
}

/// Transforms applied in order, each one rolling its own probability.
#[derive(Debug, Clone, PartialEq)]
pub struct Compose {
    transforms: Vec<Transform>,
}

impl Compose {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn apply<R: Rng + ?Sized>(&self, sample: Sample, rng: &mut R) -> Sample {
        self.transforms
            .iter()
            .fold(sample, |sample, transform| transform.apply(sample, rng))
    }
}

/// Builds the training pipeline registered under `level`.
///
/// `image_size` is `[height, width]` of the network input.
pub fn training_augmentation(level: AugmentationLevel, image_size: [u32; 2]) -> Compose {
    let [height, width] = image_size;
    let resize = Transform::Resize { height, width };
    let flip = Transform::HorizontalFlip { p: 0.5 };
    let transforms = match level {
        AugmentationLevel::Default => vec![
            flip,
            shift_scale_rotate(0.5),
            Transform::grid_distortion(0.3),
            Transform::OpticalDistortion {
                distort_limit: 0.1,
                shift_limit: 0.5,
                p: 0.3,
            },
            Transform::RandomBrightnessContrast {
                brightness_limit: 0.1,
                contrast_limit: 0.1,
                p: 0.1,
            },
            resize,
        ],
        AugmentationLevel::Level1 => vec![
            flip,
            shift_scale_rotate(0.3),
            Transform::grid_distortion(0.5),
            optical_distortion(),
            resize,
        ],
        AugmentationLevel::Level2 => vec![
            resize,
            flip,
            shift_scale_rotate(0.3),
            Transform::grid_distortion(0.5),
            optical_distortion(),
            Transform::blur(),
            Transform::brightness_contrast(),
        ],
    };
    Compose::new(transforms)
}

pub fn validation_augmentation(image_size: [u32; 2]) -> Compose {
    let [height, width] = image_size;
    Compose::new(vec![Transform::Resize { height, width }])
}

fn shift_scale_rotate(scale_limit: f32) -> Transform {
    Transform::ShiftScaleRotate {
        shift_limit: 0.1,
        scale_limit,
        rotate_limit: 15.0,
        p: 0.5,
    }
}

fn optical_distortion() -> Transform {
    Transform::OpticalDistortion {
        distort_limit: 0.1,
        shift_limit: 0.2,
        p: 0.5,
    }
}

/// Normalizes the image with per-channel statistics and lays image and masks
/// out channel-first as `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessing {
    mean: [f32; 3],
    std: [f32; 3],
}

impl Default for Preprocessing {
    fn default() -> Self {
        Self::new(IMAGENET_MEAN, IMAGENET_STD)
    }
}

impl Preprocessing {
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { mean, std }
    }

    /// Returns `(image [3, H, W], masks [C, H, W])` flattened row-major.
    pub fn apply(&self, sample: &Sample) -> (Vec<f32>, Vec<f32>) {
        let (width, height) = sample.dimensions();
        let plane = (width * height) as usize;

        let mut image = vec![0.0f32; 3 * plane];
        for (i, pixel) in sample.image.pixels().enumerate() {
            for c in 0..3 {
                image[c * plane + i] = (pixel[c] as f32 / 255.0 - self.mean[c]) / self.std[c];
            }
        }

        let mut masks = Vec::with_capacity(sample.masks.len() * plane);
        for mask in &sample.masks {
            masks.extend(mask.pixels().map(|p| if p[0] > 0 { 1.0 } else { 0.0 }));
        }

        (image, masks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn registry_resolves_known_levels() {
        assert_eq!("default".parse::<AugmentationLevel>().unwrap(), AugmentationLevel::Default);
        assert_eq!("1".parse::<AugmentationLevel>().unwrap(), AugmentationLevel::Level1);
        assert_eq!("2".parse::<AugmentationLevel>().unwrap(), AugmentationLevel::Level2);
        assert!(matches!(
            "3".parse::<AugmentationLevel>(),
            Err(Error::UnknownAugmentation(name)) if name == "3"
        ));
    }

    #[test]
    fn level_names_round_trip_through_serde() {
        let json = serde_json::to_string(&AugmentationLevel::Level2).unwrap();
        assert_eq!(json, "\"2\"");
        let level: AugmentationLevel = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(level, AugmentationLevel::Default);
    }

    #[test]
    fn policies_follow_the_registry_layout() {
        let default = training_augmentation(AugmentationLevel::Default, [320, 640]);
        assert_eq!(default.transforms().len(), 6);
        assert_eq!(
            default.transforms().last(),
            Some(&Transform::Resize {
                height: 320,
                width: 640
            })
        );

        let level1 = training_augmentation(AugmentationLevel::Level1, [320, 640]);
        assert_eq!(level1.transforms().len(), 5);
        assert!(!level1
            .transforms()
            .iter()
            .any(|t| matches!(t, Transform::RandomBrightnessContrast { .. })));

        let level2 = training_augmentation(AugmentationLevel::Level2, [320, 640]);
        assert_eq!(level2.transforms().len(), 7);
        assert!(matches!(level2.transforms()[0], Transform::Resize { .. }));
        assert!(matches!(level2.transforms()[5], Transform::Blur { .. }));

        let val = validation_augmentation([320, 640]);
        assert_eq!(val.transforms().len(), 1);
    }

    #[test]
    fn every_policy_produces_the_network_input_size() {
        let image = RgbImage::from_fn(90, 45, |x, y| Rgb([x as u8, y as u8, 7]));
        let mask = GrayImage::from_fn(90, 45, |x, y| Luma([((x + y) % 3 == 0) as u8]));
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for level in [
            AugmentationLevel::Default,
            AugmentationLevel::Level1,
            AugmentationLevel::Level2,
        ] {
            let compose = training_augmentation(level, [16, 32]);
            for _ in 0..5 {
                let out = compose.apply(Sample::new(image.clone(), vec![mask.clone()]), &mut rng);
                assert_eq!(out.dimensions(), (32, 16));
                assert_eq!(out.masks[0].dimensions(), (32, 16));
            }
        }
    }

    #[test]
    fn preprocessing_normalizes_channel_first() {
        let image = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 255, 0])
            }
        });
        let mask = GrayImage::from_fn(2, 1, |x, _| Luma([x as u8]));
        let sample = Sample::new(image, vec![mask]);
        let (data, masks) = Preprocessing::new([0.5; 3], [0.5; 3]).apply(&sample);
        assert_eq!(data, vec![1.0, -1.0, -1.0, 1.0, -1.0, -1.0]);
        assert_eq!(masks, vec![0.0, 1.0]);
    }
}
