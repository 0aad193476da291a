//! Box-supervised training targets.
//!
//! Ground-truth boxes are rasterised into coarse pseudo-masks, and every image
//! gets a color-similarity map on the stride-4 grid: for each pixel and each of
//! its dilated neighbors, how close the two are in Lab space, masked by whether
//! the neighbor lies inside the real image.

use std::ops::Range;

use ndarray::prelude::*;
use tracing::debug;

use crate::config::InputFormat;
use crate::ops::{avg_pool2d, rgb_to_lab, unfold_without_center};
use crate::structures::{GtInstances, TargetRecord};

/// Stride of the mask prediction grid relative to the input canvas.
pub const MASK_STRIDE: usize = 4;

/// Photometric affinity between every pixel of a single image and its
/// `kernel_size² - 1` dilated neighbors.
///
/// `images` is `(1, channels, h, w)` in a color space where Euclidean distance is
/// meaningful; `image_masks` is the `(h, w)` validity mask. The result is
/// `(kernel_size² - 1, h, w)` holding `exp(-0.5 * distance)` scaled by the
/// neighbor's validity.
///
/// # Panics
///
/// Panics if the batch dimension is not 1, if the mask does not match the image,
/// or if `kernel_size` is even.
pub fn images_color_similarity(
    images: ArrayView4<f32>,
    image_masks: ArrayView2<f32>,
    kernel_size: usize,
    dilation: usize,
) -> Array3<f32> {
    assert_eq!(
        images.len_of(Axis(0)),
        1,
        "color similarity is computed for one image at a time"
    );
    let (_, channels, height, width) = images.dim();
    assert_eq!(
        image_masks.dim(),
        (height, width),
        "validity mask does not match the image"
    );

    let unfolded_images = unfold_without_center(images, kernel_size, dilation);
    let unfolded_weights = unfold_without_center(
        image_masks.insert_axis(Axis(0)).insert_axis(Axis(0)),
        kernel_size,
        dilation,
    );
    let image = images.index_axis(Axis(0), 0);
    let neighbors = unfolded_images.len_of(Axis(2));

    Array3::from_shape_fn((neighbors, height, width), |(n, y, x)| {
        let distance = (0..channels)
            .map(|c| {
                let diff = image[[c, y, x]] - unfolded_images[[0, c, n, y, x]];
                diff * diff
            })
            .sum::<f32>()
            .sqrt();
        (-0.5 * distance).exp() * unfolded_weights[[0, 0, n, y, x]]
    })
}

/// Rasterises `(n, 4)` boxes into `(n, height, width)` box-shaped masks.
///
/// Coordinates are truncated to integers and the far edge is inclusive, so a box
/// `(x1, y1, x2, y2)` covers rows `y1..=y2` and columns `x1..=x2`. Parts outside
/// the canvas are clipped. No boxes give a `(0, height, width)` stack.
pub fn pseudo_masks_from_boxes(boxes: ArrayView2<f32>, height: usize, width: usize) -> Array3<f32> {
    let mut masks = Array3::<f32>::zeros((boxes.nrows(), height, width));
    for (mut mask, per_box) in masks.outer_iter_mut().zip(boxes.outer_iter()) {
        let rows = inclusive_span(per_box[1], per_box[3], height);
        let cols = inclusive_span(per_box[0], per_box[2], width);
        mask.slice_mut(s![rows, cols]).fill(1.0);
    }
    masks
}

fn inclusive_span(start: f32, end: f32, len: usize) -> Range<usize> {
    // float to int casts saturate, negative coordinates land on 0
    let lo = (start.trunc() as usize).min(len);
    let hi = ((end + 1.0).trunc() as usize).min(len);
    lo..hi.max(lo)
}

/// Builds the image-level color-similarity map of every image in a batch.
///
/// `images` is the zero-padded batch of raw pixel values `(batch, 3, H, W)` and
/// `image_masks` its `(batch, H, W)` validity mask. Images are area-downsampled
/// by [`MASK_STRIDE`], quantised to bytes and converted to Lab; the mask is
/// sampled at the center of every stride cell.
///
/// # Panics
///
/// Panics if `H` or `W` is not a multiple of [`MASK_STRIDE`]; the canvas
/// padding upstream guarantees it.
pub fn add_bitmasks_from_boxes(
    images: ArrayView4<f32>,
    image_masks: ArrayView3<f32>,
    kernel_size: usize,
    dilation: usize,
    input_format: InputFormat,
) -> Vec<Array3<f32>> {
    let stride = MASK_STRIDE;
    let start = stride / 2;
    let (_, _, height, width) = images.dim();

    assert_eq!(height % stride, 0, "canvas height {height} is not a multiple of {stride}");
    assert_eq!(width % stride, 0, "canvas width {width} is not a multiple of {stride}");

    let downsampled = avg_pool2d(images, stride);
    let image_masks = image_masks.slice(s![.., start..;stride, start..;stride]);

    downsampled
        .outer_iter()
        .zip(image_masks.outer_iter())
        .map(|(image, mask)| {
            let bytes = image.mapv(|v| v as u8);
            let lab = rgb_to_lab(bytes.view(), input_format.rgb_channels());
            images_color_similarity(
                lab.insert_axis(Axis(0)).view(),
                mask,
                kernel_size,
                dilation,
            )
        })
        .collect()
}

/// Packs ground truth and color similarity into per-image target records.
///
/// Caller-owned instances are left untouched.
///
/// # Panics
///
/// Panics if the two slices describe different batch sizes, or if an image's
/// boxes are not `(n, 4)` with one label per box.
pub fn prepare_targets(
    instances: &[&GtInstances],
    color_similarities: Vec<Array3<f32>>,
) -> Vec<TargetRecord> {
    assert_eq!(
        instances.len(),
        color_similarities.len(),
        "one color-similarity map is needed per image"
    );

    instances
        .iter()
        .zip(color_similarities)
        .map(|(per_image, color_similarity)| {
            assert_eq!(
                per_image.gt_boxes.ncols(),
                4,
                "boxes must be (n, 4) as x1, y1, x2, y2"
            );
            assert_eq!(
                per_image.gt_classes.len(),
                per_image.gt_boxes.nrows(),
                "one label is needed per box"
            );
            let (h, w) = per_image.image_size;
            let masks = pseudo_masks_from_boxes(per_image.gt_boxes.view(), h, w);
            debug!(instances = per_image.len(), height = h, width = w, "prepared targets");
            TargetRecord {
                labels: per_image.gt_classes.clone(),
                boxes: per_image.gt_boxes.clone(),
                masks,
                color_similarity,
            }
        })
        .collect()
}
