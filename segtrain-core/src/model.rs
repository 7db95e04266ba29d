use burn::nn::{
    conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    pool::{MaxPool2d, MaxPool2dConfig},
    BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
};
use burn::prelude::*;
use clap::builder::OsStr;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(channels_in: usize, channels_out: usize, device: &B::Device) -> Self {
        let conv = |channels_in| {
            Conv2dConfig::new([channels_in, channels_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        Self {
            conv1: conv(channels_in),
            norm1: BatchNormConfig::new(channels_out).init(device),
            conv2: conv(channels_out),
            norm2: BatchNormConfig::new(channels_out).init(device),
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.norm1.forward(self.conv1.forward(x)));
        self.activation.forward(self.norm2.forward(self.conv2.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    stem: ConvBlock<B>,
    blocks: Vec<ConvBlock<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> Encoder<B> {
    /// Returns the bottleneck features and the skip connections, shallowest first.
    fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Vec<Tensor<B, 4>>) {
        let mut x = self.stem.forward(x);
        let mut skips = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            skips.push(x.clone());
            x = block.forward(self.pool.forward(x));
        }
        (x, skips)
    }
}

#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    up: ConvTranspose2d<B>,
    block: ConvBlock<B>,
}

impl<B: Backend> UpBlock<B> {
    fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.up.forward(x);
        self.block.forward(Tensor::cat(vec![x, skip], 1))
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    blocks: Vec<UpBlock<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> Decoder<B> {
    fn forward(&self, x: Tensor<B, 4>, skips: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let x = self
            .blocks
            .iter()
            .zip(skips.into_iter().rev())
            .fold(x, |x, (block, skip)| block.forward(x, skip));
        self.head.forward(x)
    }
}

/// U-Net style network producing one logit map per class.
#[derive(Module, Debug)]
pub struct SegmentationModel<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
}

impl<B: Backend> SegmentationModel<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, num_classes, height, width]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let (x, skips) = self.encoder.forward(images);
        self.decoder.forward(x, skips)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    encoder: EncoderType,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device, num_classes: usize) -> SegmentationModel<B> {
        let widths = self.encoder.widths();
        let stem = ConvBlock::new(3, widths[0], device);
        let down = widths
            .windows(2)
            .map(|w| ConvBlock::new(w[0], w[1], device))
            .collect();
        let up = widths
            .windows(2)
            .rev()
            .map(|w| UpBlock {
                up: ConvTranspose2dConfig::new([w[1], w[0]], [2, 2])
                    .with_stride([2, 2])
                    .init(device),
                block: ConvBlock::new(w[0] * 2, w[0], device),
            })
            .collect();
        SegmentationModel {
            encoder: Encoder {
                stem,
                blocks: down,
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            },
            decoder: Decoder {
                blocks: up,
                head: Conv2dConfig::new([widths[0], num_classes], [1, 1]).init(device),
            },
        }
    }

    pub fn encoder(&self) -> EncoderType {
        self.encoder
    }

    /// Input height and width must be multiples of this.
    pub fn downsampling_factor(&self) -> usize {
        1 << (self.encoder.depth() - 1)
    }

    /// Rejects `[height, width]` inputs the encoder cannot pool down evenly.
    pub fn check_image_size(&self, image_size: [u32; 2]) -> crate::Result<()> {
        let factor = self.downsampling_factor() as u32;
        let [height, width] = image_size;
        if height == 0 || width == 0 || height % factor != 0 || width % factor != 0 {
            return Err(crate::Error::Config(format!(
                "image size {height}x{width} must be a positive multiple of {factor} for the {} encoder",
                self.encoder.name()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    Tiny,
    Small,
    #[default]
    Medium,
    Large,
}

impl EncoderType {
    fn base_width(self) -> usize {
        match self {
            Self::Tiny => 8,
            Self::Small => 16,
            Self::Medium => 32,
            Self::Large => 64,
        }
    }

    fn depth(self) -> usize {
        match self {
            Self::Tiny => 3,
            Self::Small => 4,
            Self::Medium | Self::Large => 5,
        }
    }

    fn widths(self) -> Vec<usize> {
        (0..self.depth()).map(|i| self.base_width() << i).collect()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl From<EncoderType> for OsStr {
    fn from(value: EncoderType) -> Self {
        value.name().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn forward_keeps_spatial_size() {
        let device = Default::default();
        let config = ModelConfig::new(EncoderType::Tiny);
        let model = config.init::<TestBackend>(&device, 4);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 32], &device);
        assert_eq!(model.forward(images).dims(), [2, 4, 16, 32]);
    }

    #[test]
    fn deeper_encoders_need_coarser_inputs() {
        assert_eq!(ModelConfig::new(EncoderType::Tiny).downsampling_factor(), 4);
        assert_eq!(ModelConfig::new(EncoderType::Small).downsampling_factor(), 8);
        assert_eq!(ModelConfig::new(EncoderType::Large).downsampling_factor(), 16);
        assert_eq!(EncoderType::Small.widths(), vec![16, 32, 64, 128]);
    }

    #[test]
    fn image_size_must_pool_evenly() {
        let config = ModelConfig::new(EncoderType::Tiny);
        assert!(config.check_image_size([16, 32]).is_ok());
        assert!(config.check_image_size([18, 32]).is_err());
        assert!(config.check_image_size([0, 32]).is_err());
    }
}
