use std::collections::BTreeMap;

use ndarray::prelude::*;

use crate::errors::{Result, SparseInstError};

/// Named multi-scale feature maps produced by a backbone.
pub type FeatureMap = BTreeMap<String, Array4<f32>>;

/// Named scalar loss terms returned by a criterion.
pub type LossMap = BTreeMap<String, f32>;

/// Ground-truth instances of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct GtInstances {
    /// `(height, width)` of the image the boxes refer to, before padding.
    pub image_size: (usize, usize),
    pub gt_classes: Array1<i64>,
    /// `(n, 4)` boxes as `x1, y1, x2, y2` in pixels.
    pub gt_boxes: Array2<f32>,
}

impl GtInstances {
    pub fn new(
        image_size: (usize, usize),
        gt_classes: Array1<i64>,
        gt_boxes: Array2<f32>,
    ) -> Result<Self> {
        if gt_boxes.ncols() != 4 {
            return Err(SparseInstError::validation(
                "gt_boxes",
                format!("has {} columns, expected 4", gt_boxes.ncols()),
            ));
        }
        if gt_boxes.nrows() != gt_classes.len() {
            return Err(SparseInstError::validation(
                "gt_classes",
                format!(
                    "has {} entries for {} boxes",
                    gt_classes.len(),
                    gt_boxes.nrows()
                ),
            ));
        }
        Ok(Self {
            image_size,
            gt_classes,
            gt_boxes,
        })
    }

    pub fn empty(image_size: (usize, usize)) -> Self {
        Self {
            image_size,
            gt_classes: Array1::zeros(0),
            gt_boxes: Array2::zeros((0, 4)),
        }
    }

    pub fn len(&self) -> usize {
        self.gt_classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One entry of a model batch.
#[derive(Debug, Clone)]
pub struct BatchedInput {
    /// `(3, h, w)` raw pixel values in `[0, 255]`, already resized by the caller.
    pub image: Array3<f32>,
    /// Original image height, before any resizing.
    pub height: usize,
    /// Original image width, before any resizing.
    pub width: usize,
    pub instances: Option<GtInstances>,
}

impl BatchedInput {
    /// An input whose original size is the size of `image`.
    pub fn new(image: Array3<f32>) -> Self {
        let (_, height, width) = image.dim();
        Self {
            image,
            height,
            width,
            instances: None,
        }
    }

    pub fn with_original_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    pub fn with_instances(mut self, instances: GtInstances) -> Self {
        self.instances = Some(instances);
        self
    }

    pub fn image_size(&self) -> (usize, usize) {
        let (_, height, width) = self.image.dim();
        (height, width)
    }
}

/// Raw decoder output. All tensors share the leading `(batch, slots)` dims.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    /// `(batch, slots, classes)` class logits.
    pub pred_logits: Array3<f32>,
    /// `(batch, slots, h / 4, w / 4)` mask logits.
    pub pred_masks: Array4<f32>,
    /// `(batch, slots, 1)` objectness logits.
    pub pred_scores: Array3<f32>,
}

impl RawOutput {
    pub fn batch_size(&self) -> usize {
        self.pred_logits.len_of(Axis(0))
    }

    pub fn num_slots(&self) -> usize {
        self.pred_logits.len_of(Axis(1))
    }

    /// Checks that the three tensors agree on `(batch, slots)` and that the
    /// batch holds `expected_batch` images.
    pub fn validate(&self, expected_batch: usize) -> Result<()> {
        let leading = (self.batch_size(), self.num_slots());
        let masks = (
            self.pred_masks.len_of(Axis(0)),
            self.pred_masks.len_of(Axis(1)),
        );
        let scores = (
            self.pred_scores.len_of(Axis(0)),
            self.pred_scores.len_of(Axis(1)),
        );

        if masks != leading {
            return Err(SparseInstError::validation(
                "pred_masks",
                format!("leading dims {masks:?} differ from pred_logits {leading:?}"),
            ));
        }
        if scores != leading {
            return Err(SparseInstError::validation(
                "pred_scores",
                format!("leading dims {scores:?} differ from pred_logits {leading:?}"),
            ));
        }
        if self.pred_scores.len_of(Axis(2)) != 1 {
            return Err(SparseInstError::validation(
                "pred_scores",
                "must hold a single objectness logit per slot",
            ));
        }
        if leading.0 != expected_batch {
            return Err(SparseInstError::validation(
                "pred_logits",
                format!("batch of {} for {} images", leading.0, expected_batch),
            ));
        }
        Ok(())
    }
}

/// Training target of one image, in the layout the criterion consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRecord {
    pub labels: Array1<i64>,
    pub boxes: Array2<f32>,
    /// `(n, h, w)` box-shaped pseudo-masks at the unpadded image size.
    pub masks: Array3<f32>,
    /// `(k² - 1, H / 4, W / 4)` image-level color similarity.
    pub color_similarity: Array3<f32>,
}

impl TargetRecord {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The color similarity repeated once per instance, `(n, k² - 1, H / 4, W / 4)`.
    ///
    /// The signal is image-level; the copy is only made for consumers that
    /// index it per instance.
    pub fn color_similarity_per_instance(&self) -> Array4<f32> {
        let (neighbors, height, width) = self.color_similarity.dim();
        let shape = (self.len(), neighbors, height, width);
        self.color_similarity
            .broadcast(shape)
            .map(|view| view.to_owned())
            .unwrap_or_else(|| Array4::zeros(shape))
    }
}

/// Final detections of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detections {
    /// `(height, width)` of the original image.
    pub image_size: (usize, usize),
    pub scores: Array1<f32>,
    pub pred_classes: Array1<usize>,
    /// `(n, height, width)` binary masks; `None` when nothing was kept.
    pub pred_masks: Option<Array3<bool>>,
}

impl Detections {
    pub fn empty(image_size: (usize, usize)) -> Self {
        Self {
            image_size,
            scores: Array1::zeros(0),
            pred_classes: Array1::zeros(0),
            pred_masks: None,
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(batch: usize, slots: usize) -> RawOutput {
        RawOutput {
            pred_logits: Array3::zeros((batch, slots, 2)),
            pred_masks: Array4::zeros((batch, slots, 4, 4)),
            pred_scores: Array3::zeros((batch, slots, 1)),
        }
    }

    #[test]
    fn test_gt_instances_validation() {
        let boxes = array![[0.0f32, 0.0, 3.0, 3.0]];
        assert!(GtInstances::new((8, 8), array![1, 2], boxes.clone()).is_err());
        assert!(GtInstances::new((8, 8), array![1], Array2::zeros((1, 3))).is_err());

        let instances = GtInstances::new((8, 8), array![1], boxes).unwrap();
        assert_eq!(instances.len(), 1);
        assert!(GtInstances::empty((8, 8)).is_empty());
    }

    #[test]
    fn test_raw_output_validation() {
        assert!(output(2, 5).validate(2).is_ok());
        assert!(output(2, 5).validate(3).is_err());

        let mut mismatched = output(2, 5);
        mismatched.pred_masks = Array4::zeros((2, 4, 4, 4));
        assert!(matches!(
            mismatched.validate(2),
            Err(SparseInstError::Validation { .. })
        ));
    }

    #[test]
    fn test_color_similarity_replication() {
        let record = TargetRecord {
            labels: array![3, 4, 5],
            boxes: Array2::zeros((3, 4)),
            masks: Array3::zeros((3, 8, 8)),
            color_similarity: Array3::from_elem((8, 2, 2), 0.5),
        };
        let replicated = record.color_similarity_per_instance();
        assert_eq!(replicated.shape(), &[3, 8, 2, 2]);
        assert!(replicated.iter().all(|v| *v == 0.5));
    }

    #[test]
    fn test_empty_detections() {
        let detections = Detections::empty((20, 30));
        assert!(detections.is_empty());
        assert!(detections.pred_masks.is_none());
        assert_eq!(detections.image_size, (20, 30));
    }
}
