use std::path::Path;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session, SessionOutputs},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    config::ModelConfig,
    errors::{Result, SparseInstError},
    postprocess::{inference, raw_predictions},
    preprocess::{ImageList, Normalizer},
    structures::{BatchedInput, Detections, LossMap, RawOutput},
    targets::{add_bitmasks_from_boxes, prepare_targets, MASK_STRIDE},
    traits::{Backbone, Criterion, Decoder, Encoder, InstanceNetwork},
};

/// SparseInst with box supervision: a network producing raw instance slots plus
/// the target construction and post-processing around it.
pub struct SparseInst<N: InstanceNetwork> {
    network: N,
    config: ModelConfig,
    normalizer: Normalizer,
}

impl<N: InstanceNetwork> SparseInst<N> {
    pub fn new(network: N, config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let normalizer = Normalizer::new(config.pixel_mean, config.pixel_std);
        Ok(Self {
            network,
            config,
            normalizer,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    fn preprocess_inputs(&self, batched_inputs: &[BatchedInput]) -> Result<ImageList> {
        for (i, input) in batched_inputs.iter().enumerate() {
            check_channels(
                format!("batched_inputs[{i}].image"),
                input.image.len_of(Axis(0)),
            )?;
        }
        let images: Vec<_> = batched_inputs
            .iter()
            .map(|input| self.normalizer.normalize(input.image.view()))
            .collect();
        let views: Vec<_> = images.iter().map(|image| image.view()).collect();
        ImageList::from_tensors(&views, self.config.size_divisibility)
    }

    fn run_network(&self, images: &ImageList) -> Result<RawOutput> {
        let output = self.network.forward(images.tensor.view())?;
        output.validate(images.len())?;
        debug!(
            batch = output.batch_size(),
            slots = output.num_slots(),
            canvas = ?images.max_shape(),
            "network forward"
        );
        Ok(output)
    }

    /// Training step: builds box-supervised targets and hands them to the
    /// criterion. Every input must carry ground-truth instances.
    pub fn forward_train<C: Criterion>(
        &self,
        batched_inputs: &[BatchedInput],
        criterion: &C,
    ) -> Result<LossMap> {
        let gt_instances = batched_inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                let field = format!("batched_inputs[{i}].instances");
                let instances = input.instances.as_ref().ok_or_else(|| {
                    SparseInstError::validation(&field, "is required for training")
                })?;
                if instances.image_size != input.image_size() {
                    return Err(SparseInstError::validation(
                        field,
                        format!(
                            "refer to a {:?} image but the input is {:?}",
                            instances.image_size,
                            input.image_size()
                        ),
                    ));
                }
                Ok(instances)
            })
            .collect::<Result<Vec<_>>>()?;

        let images = self.preprocess_inputs(batched_inputs)?;
        let max_shape = images.max_shape();
        let output = self.run_network(&images)?;

        // color similarity is measured on the raw pixels, padded the same way
        let raw: Vec<_> = batched_inputs.iter().map(|input| input.image.view()).collect();
        let original_images = ImageList::from_tensors(&raw, self.config.size_divisibility)?;
        let original_image_masks = original_images.valid_mask();

        let color_similarities = add_bitmasks_from_boxes(
            original_images.tensor.view(),
            original_image_masks.view(),
            self.config.pairwise_size,
            self.config.pairwise_dilation,
            self.config.input_format,
        );
        let targets = prepare_targets(&gt_instances, color_similarities);

        let losses = criterion.losses(&output, &targets, max_shape)?;
        debug!(terms = losses.len(), "computed losses");
        Ok(losses)
    }

    /// Inference on a list of images; one [`Detections`] per input, in order,
    /// with masks at each input's original `height` and `width`.
    pub fn forward_inference(&self, batched_inputs: &[BatchedInput]) -> Result<Vec<Detections>> {
        let images = self.preprocess_inputs(batched_inputs)?;
        let output = self.run_network(&images)?;
        let original_sizes: Vec<_> = batched_inputs
            .iter()
            .map(|input| (input.height, input.width))
            .collect();

        Ok(inference(
            &output,
            images.max_shape(),
            &images.image_sizes,
            &original_sizes,
            &self.config,
        ))
    }

    /// Deployment entry point on an already padded `(batch, 3, H, W)` batch of
    /// raw pixels. Returns `(batch, slots, classes)` scores and
    /// `(batch, slots, H, W)` soft masks; thresholding and cropping are left to
    /// the caller.
    pub fn forward_test(&self, images: ArrayView4<f32>) -> Result<(Array3<f32>, Array4<f32>)> {
        let (batch, channels, height, width) = images.dim();
        check_channels("images", channels)?;
        if height % MASK_STRIDE != 0 || width % MASK_STRIDE != 0 {
            return Err(SparseInstError::validation(
                "images",
                format!("canvas {height}x{width} is not a multiple of {MASK_STRIDE}"),
            ));
        }
        let normalized = self.normalizer.normalize_batch(images);
        let output = self.network.forward(normalized.view())?;
        output.validate(batch)?;
        Ok(raw_predictions(&output))
    }
}

fn check_channels(field: impl Into<String>, channels: usize) -> Result<()> {
    if channels != 3 {
        return Err(SparseInstError::validation(
            field,
            format!("has {channels} channels, expected 3"),
        ));
    }
    Ok(())
}

/// Backbone, encoder and decoder run one after another.
pub struct NetworkStack<B, E, D> {
    pub backbone: B,
    pub encoder: E,
    pub decoder: D,
}

impl<B: Backbone, E: Encoder, D: Decoder> NetworkStack<B, E, D> {
    pub const fn new(backbone: B, encoder: E, decoder: D) -> Self {
        Self {
            backbone,
            encoder,
            decoder,
        }
    }
}

impl<B: Backbone, E: Encoder, D: Decoder> InstanceNetwork for NetworkStack<B, E, D> {
    fn forward(&self, images: ArrayView4<f32>) -> Result<RawOutput> {
        let features = self.backbone.forward(images)?;
        let fused = self.encoder.forward(features)?;
        self.decoder.forward(fused.view())
    }
}

/// An exported backbone + encoder + decoder graph run with ONNX Runtime.
///
/// The graph takes one `(batch, 3, S, S)` input and returns `pred_logits`,
/// `pred_masks` and `pred_scores` logits. Smaller batches are zero-padded to the
/// square canvas `S` and the masks cropped back afterwards.
pub struct OnnxNetwork {
    pub canvas_size: usize,
    input_name: String,
    session: Mutex<Session>,
}

impl OnnxNetwork {
    pub fn new(model_path: &Path, device_id: i32, canvas_size: usize) -> Result<Self> {
        let mut session = SessionBuilder::new()
            .map_err(|e| builder_error("session builder", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| builder_error("execution providers", e))?
            .with_memory_pattern(true)
            .map_err(|e| builder_error("memory pattern", e))?
            .commit_from_file(model_path)
            .map_err(|e| {
                builder_error(format!("load model file: {}", model_path.display()), e)
            })?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| {
                SparseInstError::validation(model_path.display().to_string(), "has no inputs")
            })?;

        // warm up
        let data = Array4::<f32>::zeros((1, 3, canvas_size, canvas_size));
        session.run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data)?])?;
        info!(model = %model_path.display(), canvas_size, "loaded onnx model");

        Ok(Self {
            canvas_size,
            input_name,
            session: Mutex::new(session),
        })
    }

    fn extract<D: Dimension>(outputs: &SessionOutputs, name: &str) -> Result<Array<f32, D>> {
        Ok(outputs[name]
            .try_extract_array::<f32>()?
            .into_dimensionality::<D>()?
            .to_owned())
    }
}

fn builder_error(operation: impl Into<String>, err: impl std::fmt::Display) -> SparseInstError {
    SparseInstError::Model {
        operation: operation.into(),
        source: err.to_string().into(),
    }
}

impl InstanceNetwork for OnnxNetwork {
    fn forward(&self, images: ArrayView4<f32>) -> Result<RawOutput> {
        let (batch, channels, height, width) = images.dim();
        if height > self.canvas_size || width > self.canvas_size {
            return Err(SparseInstError::validation(
                "images",
                format!(
                    "{height}x{width} does not fit the {0}x{0} canvas",
                    self.canvas_size
                ),
            ));
        }

        let side = self.canvas_size;
        let mut canvas = Array4::<f32>::zeros((batch, channels, side, side));
        canvas.slice_mut(s![.., .., ..height, ..width]).assign(&images);

        let mut binding = self.session.lock();
        let outputs = binding.run(
            ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&canvas)?],
        )?;

        let pred_masks: Array4<f32> = Self::extract(&outputs, "pred_masks")?;
        let pred_masks = pred_masks
            .slice(s![.., .., ..height / MASK_STRIDE, ..width / MASK_STRIDE])
            .to_owned();

        Ok(RawOutput {
            pred_logits: Self::extract(&outputs, "pred_logits")?,
            pred_masks,
            pred_scores: Self::extract(&outputs, "pred_scores")?,
        })
    }
}
