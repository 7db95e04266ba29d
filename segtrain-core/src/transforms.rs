use image::{
    imageops::{self, FilterType},
    GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage,
};
use imageproc::{
    filter::box_filter,
    geometric_transformations::{warp, Interpolation, Projection},
};
use rand::Rng;

/// An image with one binary mask plane per class.
///
/// Mask pixels are either 0 or 1 and every plane has the image's dimensions.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: RgbImage,
    pub masks: Vec<GrayImage>,
}

impl Sample {
    pub fn new(image: RgbImage, masks: Vec<GrayImage>) -> Self {
        Self { image, masks }
    }

    /// (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn map_geometry(
        self,
        image_op: impl Fn(&RgbImage) -> RgbImage,
        mask_op: impl Fn(&GrayImage) -> GrayImage,
    ) -> Self {
        Self {
            image: image_op(&self.image),
            masks: self.masks.iter().map(mask_op).collect(),
        }
    }
}

/// A single randomized transform. Geometric variants move the image and the
/// masks together, photometric variants only touch the image.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    HorizontalFlip {
        p: f64,
    },
    /// Limits are fractions of the image size for the shift, fractions of 1
    /// for the scale and degrees for the rotation.
    ShiftScaleRotate {
        shift_limit: f32,
        scale_limit: f32,
        rotate_limit: f32,
        p: f64,
    },
    GridDistortion {
        num_steps: u32,
        distort_limit: f32,
        p: f64,
    },
    OpticalDistortion {
        distort_limit: f32,
        shift_limit: f32,
        p: f64,
    },
    RandomBrightnessContrast {
        brightness_limit: f32,
        contrast_limit: f32,
        p: f64,
    },
    Blur {
        blur_limit: u32,
        p: f64,
    },
    Resize {
        height: u32,
        width: u32,
    },
}

impl Transform {
    pub fn grid_distortion(p: f64) -> Self {
        Self::GridDistortion {
            num_steps: 5,
            distort_limit: 0.3,
            p,
        }
    }

    pub fn blur() -> Self {
        Self::Blur {
            blur_limit: 7,
            p: 0.5,
        }
    }

    pub fn brightness_contrast() -> Self {
        Self::RandomBrightnessContrast {
            brightness_limit: 0.2,
            contrast_limit: 0.2,
            p: 0.5,
        }
    }

    pub fn probability(&self) -> f64 {
        match *self {
            Self::HorizontalFlip { p }
            | Self::ShiftScaleRotate { p, .. }
            | Self::GridDistortion { p, .. }
            | Self::OpticalDistortion { p, .. }
            | Self::RandomBrightnessContrast { p, .. }
            | Self::Blur { p, .. } => p,
            Self::Resize { .. } => 1.0,
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, sample: Sample, rng: &mut R) -> Sample {
        let p = self.probability();
        if p < 1.0 && rng.gen::<f64>() >= p {
            return sample;
        }
        match *self {
            Self::HorizontalFlip { .. } => sample.map_geometry(
                |image| imageops::flip_horizontal(image),
                |mask| imageops::flip_horizontal(mask),
            ),
            Self::ShiftScaleRotate {
                shift_limit,
                scale_limit,
                rotate_limit,
                ..
            } => {
                let (width, height) = sample.dimensions();
                let angle = uniform(rng, rotate_limit).to_radians();
                let scale = 1.0 + uniform(rng, scale_limit);
                let dx = uniform(rng, shift_limit) * width as f32;
                let dy = uniform(rng, shift_limit) * height as f32;
                let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
                let projection = Projection::translate(cx + dx, cy + dy)
                    * Projection::rotate(angle)
                    * Projection::scale(scale, scale)
                    * Projection::translate(-cx, -cy);
                sample.map_geometry(
                    |image| warp(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0])),
                    |mask| warp(mask, &projection, Interpolation::Nearest, Luma([0])),
                )
            }
            Self::GridDistortion {
                num_steps,
                distort_limit,
                ..
            } => {
                let (width, height) = sample.dimensions();
                let num_steps = num_steps.max(1);
                let x_steps = (0..=num_steps)
                    .map(|_| 1.0 + uniform(rng, distort_limit))
                    .collect::<Vec<_>>();
                let y_steps = (0..=num_steps)
                    .map(|_| 1.0 + uniform(rng, distort_limit))
                    .collect::<Vec<_>>();
                let xx = grid_coordinates(width, num_steps, &x_steps);
                let yy = grid_coordinates(height, num_steps, &y_steps);
                let map = |x: u32, y: u32| (xx[x as usize], yy[y as usize]);
                sample.map_geometry(
                    |image| remap(image, Interpolation::Bilinear, map),
                    |mask| remap(mask, Interpolation::Nearest, map),
                )
            }
            Self::OpticalDistortion {
                distort_limit,
                shift_limit,
                ..
            } => {
                let (width, height) = sample.dimensions();
                let k = uniform(rng, distort_limit);
                let dx = uniform(rng, shift_limit).round();
                let dy = uniform(rng, shift_limit).round();
                let (fx, fy) = (width as f32, height as f32);
                let (cx, cy) = (fx * 0.5 + dx, fy * 0.5 + dy);
                let map = |u: u32, v: u32| {
                    let x = (u as f32 - cx) / fx;
                    let y = (v as f32 - cy) / fy;
                    let r2 = x * x + y * y;
                    let radial = 1.0 + k * r2 + k * r2 * r2;
                    (x * radial * fx + cx, y * radial * fy + cy)
                };
                sample.map_geometry(
                    |image| remap(image, Interpolation::Bilinear, map),
                    |mask| remap(mask, Interpolation::Nearest, map),
                )
            }
            Self::RandomBrightnessContrast {
                brightness_limit,
                contrast_limit,
                ..
            } => {
                let alpha = 1.0 + uniform(rng, contrast_limit);
                let beta = uniform(rng, brightness_limit) * 255.0;
                let mut sample = sample;
                for pixel in sample.image.pixels_mut() {
                    pixel.apply(|v| (v as f32 * alpha + beta).round().clamp(0.0, 255.0) as u8);
                }
                sample
            }
            Self::Blur { blur_limit, .. } => {
                let kernel = 3 + 2 * rng.gen_range(0..=(blur_limit.max(3) - 3) / 2);
                let radius = kernel / 2;
                let mut sample = sample;
                sample.image = blur_rgb(&sample.image, radius);
                sample
            }
            Self::Resize { height, width } => {
                if sample.dimensions() == (width, height) {
                    return sample;
                }
                sample.map_geometry(
                    |image| imageops::resize(image, width, height, FilterType::Triangle),
                    |mask| imageops::resize(mask, width, height, FilterType::Nearest),
                )
            }
        }
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, limit: f32) -> f32 {
    if limit <= 0.0 {
        return 0.0;
    }
    rng.gen_range(-limit..=limit)
}

/// Source coordinate for every output column (or row) of a distorted grid.
///
/// The axis is cut into cells of `len / num_steps` pixels; cell `i` is
/// stretched by `steps[i]` and the cell crossing the border is pinned to it.
fn grid_coordinates(len: u32, num_steps: u32, steps: &[f32]) -> Vec<f32> {
    let len_usize = len as usize;
    let step = (len / num_steps).max(1) as usize;
    let mut coords = vec![0.0f32; len_usize];
    let mut prev = 0.0f32;
    for (idx, stretch) in steps.iter().enumerate() {
        let start = idx * step;
        if start >= len_usize {
            break;
        }
        let (end, cur) = match start + step {
            end if end > len_usize => (len_usize, len as f32),
            end => (end, prev + step as f32 * stretch),
        };
        linspace(prev, cur, &mut coords[start..end]);
        prev = cur;
    }
    coords
}

fn linspace(from: f32, to: f32, out: &mut [f32]) {
    match out.len() {
        0 => {}
        1 => out[0] = from,
        n => {
            let delta = (to - from) / (n - 1) as f32;
            for (i, v) in out.iter_mut().enumerate() {
                *v = from + delta * i as f32;
            }
        }
    }
}

/// Reflects an out-of-range index back into `0..len` without repeating the
/// edge pixel (`gfedcb|abcdefgh|gfedcba`).
fn reflect101(i: i64, len: u32) -> u32 {
    let n = len as i64;
    if n <= 1 {
        return 0;
    }
    let period = 2 * n - 2;
    let i = i.rem_euclid(period);
    (if i >= n { period - i } else { i }) as u32
}

fn remap<P>(
    src: &ImageBuffer<P, Vec<u8>>,
    interpolation: Interpolation,
    map: impl Fn(u32, u32) -> (f32, f32),
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (width, height) = src.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| {
        let (sx, sy) = map(x, y);
        match interpolation {
            Interpolation::Nearest => *src.get_pixel(
                reflect101(sx.round() as i64, width),
                reflect101(sy.round() as i64, height),
            ),
            _ => bilinear(src, sx, sy),
        }
    })
}

fn bilinear<P>(src: &ImageBuffer<P, Vec<u8>>, sx: f32, sy: f32) -> P
where
    P: Pixel<Subpixel = u8>,
{
    let (width, height) = src.dimensions();
    let (x0, y0) = (sx.floor(), sy.floor());
    let (fx, fy) = (sx - x0, sy - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);
    let (xa, xb) = (reflect101(x0, width), reflect101(x0 + 1, width));
    let (ya, yb) = (reflect101(y0, height), reflect101(y0 + 1, height));
    let p00 = src.get_pixel(xa, ya).channels();
    let p10 = src.get_pixel(xb, ya).channels();
    let p01 = src.get_pixel(xa, yb).channels();
    let p11 = src.get_pixel(xb, yb).channels();
    let mut out = *src.get_pixel(xa, ya);
    for (c, v) in out.channels_mut().iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *v = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn blur_rgb(image: &RgbImage, radius: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let planes = (0..3)
        .map(|c| {
            let plane = GrayImage::from_fn(width, height, |x, y| Luma([image.get_pixel(x, y)[c]]));
            box_filter(&plane, radius, radius)
        })
        .collect::<Vec<_>>();
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            planes[0].get_pixel(x, y)[0],
            planes[1].get_pixel(x, y)[0],
            planes[2].get_pixel(x, y)[0],
        ])
    })
}
