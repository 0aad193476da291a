use crate::errors::Result;
use crate::structures::{FeatureMap, LossMap, RawOutput, TargetRecord};
use ndarray::prelude::*;

/// Feature extractor: normalised image batch to named multi-scale features.
pub trait Backbone: Send + Sync {
    fn forward(&self, images: ArrayView4<f32>) -> Result<FeatureMap>;
}

/// Fuses backbone features into a single feature map.
pub trait Encoder: Send + Sync {
    fn forward(&self, features: FeatureMap) -> Result<Array4<f32>>;
}

/// Turns fused features into class, mask and objectness logits.
pub trait Decoder: Send + Sync {
    fn forward(&self, features: ArrayView4<f32>) -> Result<RawOutput>;
}

/// Everything between the normalised image batch and the raw output.
///
/// Implemented by [`crate::model::NetworkStack`] for composed collaborators and by
/// [`crate::model::OnnxNetwork`] for an exported graph.
pub trait InstanceNetwork: Send + Sync {
    fn forward(&self, images: ArrayView4<f32>) -> Result<RawOutput>;
}

/// Training criterion. `max_shape` is the `(H, W)` of the padded canvas.
pub trait Criterion: Send + Sync {
    fn losses(
        &self,
        output: &RawOutput,
        targets: &[TargetRecord],
        max_shape: (usize, usize),
    ) -> Result<LossMap>;
}
