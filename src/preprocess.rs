use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::config::InputFormat;
use crate::errors::{Result, SparseInstError};

/// Per-channel `(x - mean) / std` normalisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    mean: [f32; 3],
    std: [f32; 3],
}

impl Normalizer {
    pub const fn new(mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { mean, std }
    }

    pub fn normalize(&self, image: ArrayView3<f32>) -> Array3<f32> {
        let mut normalized = image.to_owned();
        for (c, mut plane) in normalized.outer_iter_mut().enumerate() {
            let (mean, std) = (self.mean[c], self.std[c]);
            plane.mapv_inplace(|v| (v - mean) / std);
        }
        normalized
    }

    pub fn normalize_batch(&self, images: ArrayView4<f32>) -> Array4<f32> {
        let mut normalized = images.to_owned();
        for mut image in normalized.outer_iter_mut() {
            let plane = self.normalize(image.view());
            image.assign(&plane);
        }
        normalized
    }
}

/// A batch of differently sized images zero-padded into one canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageList {
    /// `(batch, channels, H, W)`, `H` and `W` multiples of the size divisibility.
    pub tensor: Array4<f32>,
    /// Unpadded `(height, width)` of every image.
    pub image_sizes: Vec<(usize, usize)>,
}

impl ImageList {
    /// Pads `images` (each `(channels, h, w)`) to the largest height and width
    /// in the batch, rounded up to a multiple of `size_divisibility`.
    pub fn from_tensors(images: &[ArrayView3<f32>], size_divisibility: usize) -> Result<Self> {
        let Some(first) = images.first() else {
            return Err(SparseInstError::validation("images", "batch is empty"));
        };
        let channels = first.len_of(Axis(0));
        if let Some(other) = images.iter().find(|i| i.len_of(Axis(0)) != channels) {
            return Err(SparseInstError::validation(
                "images",
                format!(
                    "mix {} and {} channels",
                    channels,
                    other.len_of(Axis(0))
                ),
            ));
        }

        let image_sizes: Vec<_> = images
            .iter()
            .map(|i| (i.len_of(Axis(1)), i.len_of(Axis(2))))
            .collect();
        let round_up = |v: usize| match size_divisibility {
            0 | 1 => v,
            d => v.div_ceil(d) * d,
        };
        let max_h = round_up(image_sizes.iter().map(|s| s.0).max().unwrap_or(0));
        let max_w = round_up(image_sizes.iter().map(|s| s.1).max().unwrap_or(0));

        let mut tensor = Array4::<f32>::zeros((images.len(), channels, max_h, max_w));
        for (mut canvas, (image, &(h, w))) in tensor
            .outer_iter_mut()
            .zip(images.iter().zip(&image_sizes))
        {
            canvas.slice_mut(s![.., ..h, ..w]).assign(image);
        }

        Ok(Self {
            tensor,
            image_sizes,
        })
    }

    /// `(H, W)` of the padded canvas.
    pub fn max_shape(&self) -> (usize, usize) {
        let (_, _, h, w) = self.tensor.dim();
        (h, w)
    }

    pub fn len(&self) -> usize {
        self.image_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_sizes.is_empty()
    }

    /// `(batch, H, W)` indicator of real (non-padding) pixels.
    pub fn valid_mask(&self) -> Array3<f32> {
        let (h, w) = self.max_shape();
        let mut mask = Array3::<f32>::zeros((self.len(), h, w));
        for (mut plane, &(height, width)) in mask.outer_iter_mut().zip(&self.image_sizes) {
            plane.slice_mut(s![..height, ..width]).fill(1.0);
        }
        mask
    }
}

/// Converts an RGB image into a `(3, h, w)` tensor of raw pixel values in the
/// channel order the model expects.
pub fn image_to_tensor(image: &RgbImage, format: InputFormat) -> Array3<f32> {
    let view = image.as_ndarray3();
    let view = match format {
        InputFormat::Rgb => view,
        InputFormat::Bgr => view.slice_move(s![..;-1, .., ..]),
    };
    view.mapv(f32::from)
}

/// Shrinks `image` so its longer side is at most `max_size`, keeping the aspect
/// ratio. Smaller images are returned unchanged.
pub fn fit_within(image: &RgbImage, max_size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longer = width.max(height);
    if longer <= max_size {
        return image.clone();
    }
    let scale = max_size as f32 / longer as f32;
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, max_size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, max_size);
    imageops::resize(image, new_width, new_height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_normalize() {
        let normalizer = Normalizer::new([1.0, 2.0, 3.0], [2.0, 2.0, 0.5]);
        let image = Array3::from_elem((3, 2, 2), 5.0f32);
        let normalized = normalizer.normalize(image.view());
        assert_eq!(normalized[[0, 0, 0]], 2.0);
        assert_eq!(normalized[[1, 1, 1]], 1.5);
        assert_eq!(normalized[[2, 0, 1]], 4.0);

        let batch = image.insert_axis(Axis(0));
        let normalized_batch = normalizer.normalize_batch(batch.view());
        assert_eq!(normalized_batch.index_axis(Axis(0), 0), normalized);
    }

    #[test]
    fn test_image_list_padding() -> Result<()> {
        let a = Array3::from_elem((3, 30, 50), 1.0f32);
        let b = Array3::from_elem((3, 40, 20), 2.0f32);
        let list = ImageList::from_tensors(&[a.view(), b.view()], 32)?;

        assert_eq!(list.tensor.shape(), &[2, 3, 64, 64]);
        assert_eq!(list.max_shape(), (64, 64));
        assert_eq!(list.image_sizes, vec![(30, 50), (40, 20)]);
        assert_eq!(list.tensor[[0, 0, 29, 49]], 1.0);
        assert_eq!(list.tensor[[0, 0, 30, 49]], 0.0);
        assert_eq!(list.tensor[[1, 2, 39, 19]], 2.0);
        assert_eq!(list.tensor[[1, 2, 39, 20]], 0.0);

        let mask = list.valid_mask();
        assert_eq!(mask.shape(), &[2, 64, 64]);
        assert_eq!(mask.sum(), (30 * 50 + 40 * 20) as f32);
        Ok(())
    }

    #[test]
    fn test_image_list_rejects_empty_batch() {
        assert!(ImageList::from_tensors(&[], 32).is_err());
    }

    #[test]
    fn test_image_to_tensor_channel_order() {
        let image = RgbImage::from_pixel(3, 2, Rgb([10, 20, 30]));

        let rgb = image_to_tensor(&image, InputFormat::Rgb);
        assert_eq!(rgb.shape(), &[3, 2, 3]);
        assert_eq!(rgb[[0, 1, 2]], 10.0);

        let bgr = image_to_tensor(&image, InputFormat::Bgr);
        assert_eq!(bgr[[0, 1, 2]], 30.0);
        assert_eq!(bgr[[2, 0, 0]], 10.0);
    }

    #[test]
    fn test_fit_within() {
        let image = RgbImage::new(200, 100);
        assert_eq!(fit_within(&image, 50).dimensions(), (50, 25));
        assert_eq!(fit_within(&image, 400).dimensions(), (200, 100));
    }
}
