use ndarray::{prelude::*, Zip};
use tracing::debug;

use crate::config::ModelConfig;
use crate::ops::{resize_bilinear_stack, sigmoid, upsample_bilinear};
use crate::structures::{Detections, RawOutput};
use crate::targets::MASK_STRIDE;

/// Guards the maskness ratio against an all-zero soft mask.
pub const MASKNESS_EPSILON: f32 = 1e-6;

/// Scales every score by its mask's maskness: the share of the soft mask's mass
/// that falls inside its own binarised region.
///
/// `mask_pred` and `masks` are `(n, h, w)`; the result has one entry per score.
pub fn rescoring_mask(
    scores: ArrayView1<f32>,
    mask_pred: ArrayView3<bool>,
    masks: ArrayView3<f32>,
) -> Array1<f32> {
    Zip::from(scores)
        .and(mask_pred.outer_iter())
        .and(masks.outer_iter())
        .map_collect(|&score, binary, soft| {
            let inside = Zip::from(&binary)
                .and(&soft)
                .fold(0.0f32, |acc, &b, &s| if b { acc + s } else { acc });
            score * (inside / (soft.sum() + MASKNESS_EPSILON))
        })
}

/// `sqrt(sigmoid(class) * sigmoid(objectness))` for every slot and class.
pub fn combine_scores(pred_logits: ArrayView3<f32>, pred_scores: ArrayView3<f32>) -> Array3<f32> {
    let objectness = pred_scores.mapv(sigmoid);
    let mut scores = pred_logits.mapv(sigmoid);
    scores.zip_mut_with(&objectness, |score, &obj| *score = (*score * obj).sqrt());
    scores
}

/// Best class and its score per slot. Ties go to the lowest class index.
fn best_classes(scores: ArrayView2<f32>) -> (Array1<f32>, Array1<usize>) {
    let mut best = Array1::<f32>::zeros(scores.nrows());
    let mut labels = Array1::<usize>::zeros(scores.nrows());
    for (slot, row) in scores.outer_iter().enumerate() {
        let (label, score) = row
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bs), (i, &s)| {
                if s > bs {
                    (i, s)
                } else {
                    (bi, bs)
                }
            });
        best[slot] = score;
        labels[slot] = label;
    }
    (best, labels)
}

/// Indices of the `limit` highest scores, in their original order.
fn top_k(scores: ArrayView1<f32>, limit: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.truncate(limit);
    order.sort_unstable();
    order
}

/// Turns the probabilities of one image into final detections.
///
/// * `scores`: `(slots, classes)` combined probabilities
/// * `masks`: `(slots, h / 4, w / 4)` mask probabilities
/// * `max_shape`: padded canvas the network saw
/// * `image_size`: unpadded size of the image inside the canvas
/// * `original_size`: size the masks are finally resampled to
pub fn postprocess_image(
    scores: ArrayView2<f32>,
    masks: ArrayView3<f32>,
    max_shape: (usize, usize),
    image_size: (usize, usize),
    original_size: (usize, usize),
    config: &ModelConfig,
) -> Detections {
    let (best, labels) = best_classes(scores);

    let mut keep: Vec<usize> = (0..best.len())
        .filter(|&i| best[i] > config.cls_threshold)
        .collect();
    if keep.is_empty() {
        return Detections::empty(original_size);
    }

    let soft = masks.select(Axis(0), &keep);
    let binary = soft.mapv(|v| v > config.mask_threshold);
    let mut kept_scores = rescoring_mask(
        best.select(Axis(0), &keep).view(),
        binary.view(),
        soft.view(),
    );

    if config.max_detections > 0 && keep.len() > config.max_detections {
        let survivors = top_k(kept_scores.view(), config.max_detections);
        debug!(
            kept = keep.len(),
            limit = config.max_detections,
            "capping detections"
        );
        kept_scores = kept_scores.select(Axis(0), &survivors);
        keep = survivors.iter().map(|&i| keep[i]).collect();
    }
    let soft = masks.select(Axis(0), &keep);

    // canvas resolution, drop the padding, then back to the original size
    let (h, w) = image_size;
    let canvas = resize_bilinear_stack(soft.view(), max_shape.0, max_shape.1);
    let cropped = canvas.slice(s![.., ..h, ..w]);
    let resized = resize_bilinear_stack(cropped, original_size.0, original_size.1);
    let pred_masks = resized.mapv(|v| v > config.mask_threshold);

    Detections {
        image_size: original_size,
        scores: kept_scores,
        pred_classes: labels.select(Axis(0), &keep),
        pred_masks: Some(pred_masks),
    }
}

/// Post-processes a whole batch; one [`Detections`] per image, in input order.
///
/// `image_sizes` are the unpadded sizes inside the `max_shape` canvas and
/// `original_sizes` the sizes the caller wants masks at.
pub fn inference(
    output: &RawOutput,
    max_shape: (usize, usize),
    image_sizes: &[(usize, usize)],
    original_sizes: &[(usize, usize)],
    config: &ModelConfig,
) -> Vec<Detections> {
    let pred_scores = combine_scores(output.pred_logits.view(), output.pred_scores.view());
    let pred_masks = output.pred_masks.mapv(sigmoid);

    pred_scores
        .outer_iter()
        .zip(pred_masks.outer_iter())
        .zip(image_sizes.iter().zip(original_sizes))
        .map(|((scores, masks), (&image_size, &original_size))| {
            let detections = postprocess_image(
                scores,
                masks,
                max_shape,
                image_size,
                original_size,
                config,
            );
            debug!(
                detections = detections.len(),
                height = original_size.0,
                width = original_size.1,
                "post-processed image"
            );
            detections
        })
        .collect()
}

/// Raw scores and soft masks upsampled to the input canvas, without
/// thresholding or cropping. Scores are `(batch, slots, classes)` and masks
/// `(batch, slots, H, W)`.
pub fn raw_predictions(output: &RawOutput) -> (Array3<f32>, Array4<f32>) {
    let scores = combine_scores(output.pred_logits.view(), output.pred_scores.view());
    let masks = output.pred_masks.mapv(sigmoid);
    (scores, upsample_bilinear(masks.view(), MASK_STRIDE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            cls_threshold: 0.3,
            mask_threshold: 0.5,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_perfect_overlap_keeps_score() {
        let mask = Array3::from_shape_fn((1, 4, 4), |(_, y, _)| if y < 2 { 1.0f32 } else { 0.0 });
        let binary = mask.mapv(|v| v > 0.5);
        let rescored = rescoring_mask(array![0.8f32].view(), binary.view(), mask.view());
        assert!((rescored[0] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_rescoring_is_monotonic_in_overlap() {
        // same total mass, more of it inside the binary region
        let binary = Array3::from_shape_fn((1, 1, 4), |(_, _, x)| x < 2);
        let diffuse = array![[[0.25f32, 0.25, 0.25, 0.25]]];
        let focused = array![[[0.5f32, 0.3, 0.1, 0.1]]];

        let low = rescoring_mask(array![1.0f32].view(), binary.view(), diffuse.view());
        let high = rescoring_mask(array![1.0f32].view(), binary.view(), focused.view());
        assert!(high[0] >= low[0]);
        assert!((low[0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_zero_mask_does_not_divide_by_zero() {
        let soft = Array3::<f32>::zeros((2, 3, 3));
        let binary = soft.mapv(|v| v > 0.5);
        let rescored = rescoring_mask(array![0.9f32, 0.4].view(), binary.view(), soft.view());
        assert!(rescored.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_combine_scores_geometric_mean() {
        let logits = array![[[0.0f32, 10.0]]];
        let objectness = array![[[0.0f32]]];
        let scores = combine_scores(logits.view(), objectness.view());
        assert!((scores[[0, 0, 0]] - 0.5).abs() < 1e-6);
        assert!((scores[[0, 0, 1]] - (sigmoid(10.0f32) * 0.5).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_best_class_tie_goes_to_first() {
        let scores = array![[0.2f32, 0.7, 0.7], [0.9, 0.1, 0.9]];
        let (best, labels) = best_classes(scores.view());
        assert_eq!(labels, array![1usize, 0]);
        assert_eq!(best, array![0.7f32, 0.9]);
    }

    #[test]
    fn test_all_below_threshold_gives_empty_result() {
        let scores = Array2::from_elem((5, 3), 0.1f32);
        let masks = Array3::from_elem((5, 4, 4), 0.9f32);
        let detections = postprocess_image(
            scores.view(),
            masks.view(),
            (16, 16),
            (16, 16),
            (20, 20),
            &config(),
        );
        assert!(detections.is_empty());
        assert!(detections.pred_masks.is_none());
        assert_eq!(detections.image_size, (20, 20));
    }

    #[test]
    fn test_rectangle_round_trip() {
        // 8x8 stride-4 grid of a 32x32 canvas, the image fills 24x32 of it
        let mut mask = Array3::<f32>::from_elem((1, 8, 8), 0.05);
        mask.slice_mut(s![0, 2..4, 2..6]).fill(0.95);
        let scores = array![[1.0f32, 0.2]];

        let detections = postprocess_image(
            scores.view(),
            mask.view(),
            (32, 32),
            (24, 32),
            (24, 32),
            &config(),
        );

        assert_eq!(detections.len(), 1);
        assert_eq!(detections.pred_classes, array![0usize]);
        let pred_masks = detections.pred_masks.as_ref().unwrap();
        assert_eq!(pred_masks.shape(), &[1, 24, 32]);

        // rows 8..16, columns 8..24 on the canvas, up to one pixel of blur
        for ((_, y, x), value) in pred_masks.indexed_iter() {
            let inside = (9..15).contains(&y) && (9..23).contains(&x);
            let outside = !(7..17).contains(&y) || !(7..25).contains(&x);
            if inside {
                assert!(*value, "pixel ({y}, {x}) should be set");
            }
            if outside {
                assert!(!*value, "pixel ({y}, {x}) should be clear");
            }
        }
    }

    #[test]
    fn test_max_detections_cap() {
        let scores = array![[0.5f32], [0.9], [0.7], [0.6]];
        let masks = Array3::from_elem((4, 2, 2), 1.0f32);
        let config = ModelConfig {
            max_detections: 2,
            ..config()
        };
        let detections =
            postprocess_image(scores.view(), masks.view(), (8, 8), (8, 8), (8, 8), &config);

        assert_eq!(detections.len(), 2);
        // slots 1 and 2 survive, kept in slot order
        assert!((detections.scores[0] - 0.9).abs() < 1e-4);
        assert!((detections.scores[1] - 0.7).abs() < 1e-4);
        assert_eq!(detections.pred_masks.unwrap().shape(), &[2, 8, 8]);
    }

    #[test]
    fn test_zero_max_detections_keeps_everything() {
        let slots = 120;
        let scores = Array2::from_elem((slots, 1), 0.9f32);
        let masks = Array3::from_elem((slots, 2, 2), 1.0f32);
        let config = ModelConfig {
            max_detections: 0,
            ..config()
        };
        assert!(slots > ModelConfig::default().max_detections);

        let detections =
            postprocess_image(scores.view(), masks.view(), (8, 8), (8, 8), (8, 8), &config);
        assert_eq!(detections.len(), slots);
        assert_eq!(detections.pred_masks.unwrap().shape(), &[slots, 8, 8]);
    }

    #[test]
    fn test_raw_predictions_shapes() {
        let output = RawOutput {
            pred_logits: Array3::zeros((2, 3, 4)),
            pred_masks: Array4::zeros((2, 3, 5, 6)),
            pred_scores: Array3::zeros((2, 3, 1)),
        };
        let (scores, masks) = raw_predictions(&output);
        assert_eq!(scores.shape(), &[2, 3, 4]);
        assert_eq!(masks.shape(), &[2, 3, 20, 24]);
        assert!(masks.iter().all(|v| (*v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_inference_keeps_positional_results() {
        let mut pred_logits = Array3::<f32>::from_elem((2, 2, 2), -10.0);
        pred_logits[[1, 0, 1]] = 10.0;
        let mut pred_masks = Array4::<f32>::from_elem((2, 2, 4, 4), -5.0);
        pred_masks.slice_mut(s![1, 0, 1..3, 1..3]).fill(5.0);
        let output = RawOutput {
            pred_logits,
            pred_masks,
            pred_scores: Array3::from_elem((2, 2, 1), 10.0),
        };

        let results = inference(
            &output,
            (16, 16),
            &[(16, 16), (12, 16)],
            &[(16, 16), (24, 32)],
            &config(),
        );

        assert_eq!(results.len(), 2);
        assert!(results[0].is_empty());
        assert_eq!(results[1].len(), 1);
        assert_eq!(results[1].pred_classes, array![1usize]);
        assert_eq!(results[1].pred_masks.as_ref().unwrap().shape(), &[1, 24, 32]);
    }
}
