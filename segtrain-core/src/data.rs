use crate::augment::{Compose, Preprocessing};
use crate::transforms::Sample;
use crate::{Error, Result};
use burn::{
    data::dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder, Dataset},
    prelude::*,
    tensor::TensorData,
};
use image::{GrayImage, ImageReader, Luma};
use rand::thread_rng;
use serde::Deserialize;
use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Val,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Train => "train",
            Phase::Val => "val",
        })
    }
}

#[derive(Debug, Deserialize)]
struct AnnotationRow {
    #[serde(rename = "Image_Label")]
    image_label: String,
    #[serde(rename = "EncodedPixels")]
    encoded_pixels: Option<String>,
}

/// Run-length encoded masks of one image, one entry per class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAnnotation {
    pub file_name: String,
    pub rles: Vec<Option<String>>,
}

impl ImageAnnotation {
    pub fn num_masks(&self) -> usize {
        self.rles.iter().filter(|rle| rle.is_some()).count()
    }
}

/// The `Image_Label,EncodedPixels` table.
#[derive(Debug, Clone)]
pub struct Annotations {
    pub classes: Vec<String>,
    pub images: Vec<ImageAnnotation>,
}

impl Annotations {
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        Self::from_reader(std::fs::File::open(path)?)
    }

    pub fn from_reader(reader: impl io::Read) -> Result<Self> {
        let mut classes: Vec<String> = vec![];
        let mut order: Vec<String> = vec![];
        let mut rows: HashMap<String, HashMap<String, Option<String>>> = HashMap::new();

        for row in csv::Reader::from_reader(reader).deserialize() {
            let row: AnnotationRow = row?;
            let (file_name, class) = row.image_label.rsplit_once('_').ok_or_else(|| {
                Error::Annotation(format!(
                    "`{}` is not of the form <image>_<class>",
                    row.image_label
                ))
            })?;
            if !classes.iter().any(|c| c == class) {
                classes.push(class.to_string());
            }
            let rle = row.encoded_pixels.filter(|rle| !rle.trim().is_empty());
            if let Some(rle) = &rle {
                rle_runs(rle).map_err(|err| {
                    Error::Rle(format!("`{}`: {err}", row.image_label))
                })?;
            }
            let entry = rows.entry(file_name.to_string()).or_insert_with(|| {
                order.push(file_name.to_string());
                HashMap::new()
            });
            if entry.insert(class.to_string(), rle).is_some() {
                return Err(Error::Annotation(format!(
                    "duplicate label `{}`",
                    row.image_label
                )));
            }
        }

        let images = order
            .into_iter()
            .map(|file_name| {
                let mut by_class = rows.remove(&file_name).unwrap_or_default();
                let rles = classes
                    .iter()
                    .map(|class| {
                        by_class.remove(class).ok_or_else(|| {
                            Error::Annotation(format!("{file_name} has no row for class {class}"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ImageAnnotation { file_name, rles })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { classes, images })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Number of non-empty masks per image, used to stratify the folds.
    pub fn strata(&self) -> Vec<usize> {
        self.images.iter().map(ImageAnnotation::num_masks).collect()
    }
}

/// Parses `start length` pairs. Starts are 1-based.
pub fn rle_runs(rle: &str) -> Result<Vec<(usize, usize)>> {
    let numbers = rle
        .split_whitespace()
        .map(|token| {
            token
                .parse::<usize>()
                .map_err(|_| Error::Rle(format!("`{token}` is not a number")))
        })
        .collect::<Result<Vec<_>>>()?;
    if numbers.len() % 2 != 0 {
        return Err(Error::Rle("expected start/length pairs".to_string()));
    }
    numbers
        .chunks_exact(2)
        .map(|pair| match pair[0] {
            0 => Err(Error::Rle("run starts are 1-based".to_string())),
            start => Ok((start, pair[1])),
        })
        .collect()
}

/// Decodes a run-length mask of `width x height` pixels.
///
/// Runs are `start length` pairs with 1-based starts over the pixels in
/// column-major order (top to bottom, then left to right).
pub fn rle_decode(rle: &str, width: u32, height: u32) -> Result<GrayImage> {
    let total = width as usize * height as usize;
    let mut column_major = vec![0u8; total];
    for (start, len) in rle_runs(rle)? {
        let end = (start - 1)
            .checked_add(len)
            .filter(|&end| end <= total)
            .ok_or_else(|| {
                Error::Rle(format!(
                    "run {start}+{len} outside a {width}x{height} mask"
                ))
            })?;
        column_major[start - 1..end].fill(1);
    }

    Ok(GrayImage::from_fn(width, height, |x, y| {
        Luma([column_major[x as usize * height as usize + y as usize]])
    }))
}

pub fn load_sample(path: &Path, rles: &[Option<String>]) -> Result<Sample> {
    let image = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let (width, height) = image.dimensions();
    let masks = rles
        .iter()
        .map(|rle| match rle {
            Some(rle) => rle_decode(rle, width, height),
            None => Ok(GrayImage::new(width, height)),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Sample::new(image, masks))
}

#[derive(Debug, Clone)]
pub struct SegmentationItem {
    /// `[3, height, width]`
    pub image: Vec<f32>,
    /// `[num_classes, height, width]`
    pub mask: Vec<f32>,
    pub num_classes: usize,
    pub height: usize,
    pub width: usize,
    pub path: PathBuf,
}

pub struct SegmentationDataset {
    images: Vec<(PathBuf, Vec<Option<String>>)>,
    num_classes: usize,
    augmentation: Compose,
    preprocessing: Preprocessing,
}

impl SegmentationDataset {
    /// Selects the annotated images at `indices`, resolving their files in
    /// `data_folder`. Every file must exist.
    pub fn new(
        data_folder: &Path,
        annotations: &Annotations,
        indices: &[usize],
        augmentation: Compose,
        preprocessing: Preprocessing,
    ) -> Result<Self> {
        let images = indices
            .iter()
            .map(|&i| {
                let annotation = annotations.images.get(i).ok_or_else(|| {
                    Error::Config(format!("sample index {i} is out of range"))
                })?;
                let path = data_folder.join(&annotation.file_name);
                if !path.is_file() {
                    return Err(Error::MissingFile(path));
                }
                Ok((path, annotation.rles.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            images,
            num_classes: annotations.num_classes(),
            augmentation,
            preprocessing,
        })
    }
}

impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        let (path, rles) = self.images.get(index)?;
        let sample = load_sample(path, rles)
            .unwrap_or_else(|err| panic!("Failed to load sample {}: {err}", path.display()));
        let sample = self.augmentation.apply(sample, &mut thread_rng());
        let (width, height) = sample.dimensions();
        let (image, mask) = self.preprocessing.apply(&sample);
        Some(SegmentationItem {
            image,
            mask,
            num_classes: self.num_classes,
            height: height as usize,
            width: width as usize,
            path: path.clone(),
        })
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

#[derive(Clone)]
pub struct SegmentationBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    /// `[batch_size, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch_size, num_classes, height, width]`
    pub masks: Tensor<B, 4>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SegmentationItem>) -> SegmentationBatch<B> {
        let images = items
            .iter()
            .map(|item| {
                let data = TensorData::new(item.image.clone(), [3, item.height, item.width]);
                Tensor::<B, 3>::from_data(data, &self.device).unsqueeze::<4>()
            })
            .collect::<Vec<_>>();
        let masks = items
            .iter()
            .map(|item| {
                let data = TensorData::new(
                    item.mask.clone(),
                    [item.num_classes, item.height, item.width],
                );
                Tensor::<B, 3>::from_data(data, &self.device).unsqueeze::<4>()
            })
            .collect::<Vec<_>>();

        let images = Tensor::cat(images, 0);
        let masks = Tensor::cat(masks, 0);
        let paths = items.iter().map(|item| item.path.clone()).collect();

        SegmentationBatch {
            images,
            masks,
            paths,
        }
    }
}

/// Wraps a dataset in a data loader for one phase. Only the training loader
/// is shuffled.
pub fn provider<B: Backend>(
    dataset: SegmentationDataset,
    phase: Phase,
    batch_size: usize,
    num_workers: usize,
    seed: u64,
    device: B::Device,
) -> Arc<dyn DataLoader<SegmentationBatch<B>>> {
    let builder = DataLoaderBuilder::new(SegmentationBatcher::<B>::new(device))
        .batch_size(batch_size)
        .num_workers(num_workers);
    match phase {
        Phase::Train => builder.shuffle(seed).build(dataset),
        Phase::Val => builder.build(dataset),
    }
}
