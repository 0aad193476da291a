pub mod config;
pub mod errors;
pub mod model;
pub mod ops;
pub mod postprocess;
pub mod preprocess;
pub mod structures;
pub mod targets;
pub mod traits;

pub mod mocks;

use image::{GrayImage, ImageFormat};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use config::{Config, InputFormat, MaskFormat, ModelConfig};
pub use errors::{Result, SparseInstError};
pub use model::{NetworkStack, OnnxNetwork, SparseInst};
pub use structures::*;
pub use traits::*;

use preprocess::{fit_within, image_to_tensor};

/// Runs a [`SparseInst`] model over every image below `config.input_dir` and
/// writes one binary mask PNG per detection, mirroring the input tree under
/// `config.output_dir`.
pub struct ImageProcessor<N: InstanceNetwork> {
    model: SparseInst<N>,
    config: Config,
}

impl<N: InstanceNetwork> ImageProcessor<N> {
    pub const fn new(model: SparseInst<N>, config: Config) -> Self {
        Self { model, config }
    }

    pub fn process_directory(&self) -> Result<()> {
        let input_path = &self.config.input_dir;
        let output_path = &self.config.output_dir;

        if !input_path.exists() {
            return Err(SparseInstError::FileSystem {
                path: input_path.clone(),
                operation: "check input directory".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        fs::create_dir_all(output_path).map_err(|e| SparseInstError::FileSystem {
            path: output_path.clone(),
            operation: "create output directory".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files(input_path);
        if image_files.is_empty() {
            warn!(input = %input_path.display(), "no images to process");
            return Ok(());
        }

        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )
        .map_err(|e| SparseInstError::Configuration {
            message: format!("progress bar template: {e}"),
        })?
        .progress_chars("#>-");
        let progress_bar = ProgressBar::new(image_files.len() as u64).with_style(style);

        let detections: usize = image_files
            .par_iter()
            .progress_with(progress_bar.clone())
            .map(|input_file| self.process_single_image(input_file))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .sum();

        progress_bar.finish();
        info!(
            images = image_files.len(),
            detections, "finished processing directory"
        );
        Ok(())
    }

    fn collect_image_files(&self, input_path: &Path) -> Vec<PathBuf> {
        WalkDir::new(input_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file() && self.is_supported_image_format(e.path()))
            .map(|e| e.into_path())
            .collect()
    }

    pub fn is_supported_image_format(&self, path: &Path) -> bool {
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            matches!(
                extension.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp" | "gif" | "tiff"
            )
        } else {
            false
        }
    }

    /// Segments one file and writes its masks. Returns the number of detections.
    fn process_single_image(&self, input_file: &Path) -> Result<usize> {
        let image = image::open(input_file)
            .map_err(|e| SparseInstError::ImageProcessing {
                path: input_file.display().to_string(),
                operation: "open image".to_string(),
                source: Box::new(e),
            })?
            .into_rgb8();

        let (width, height) = image.dimensions();
        let resized = fit_within(&image, self.config.canvas_size as u32);
        let input = BatchedInput::new(image_to_tensor(&resized, self.config.input_format))
            .with_original_size(height as usize, width as usize);

        let detections = self
            .model
            .forward_inference(std::slice::from_ref(&input))?
            .into_iter()
            .next()
            .ok_or_else(|| SparseInstError::validation("detections", "missing for input"))?;
        debug!(file = %input_file.display(), kept = detections.len(), "segmented image");

        self.write_masks(input_file, &detections)?;
        Ok(detections.len())
    }

    /// Saves mask `i` of class `c` as `<stem>_<i>_<c>.png` next to where the
    /// input would land in the output tree.
    fn write_masks(&self, input_file: &Path, detections: &Detections) -> Result<()> {
        let Some(masks) = &detections.pred_masks else {
            return Ok(());
        };

        let output_file = self.config.output_dir.join(self.get_relative_path(input_file)?);
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent).map_err(|e| SparseInstError::FileSystem {
                path: parent.to_path_buf(),
                operation: "create output directory".to_string(),
                source: e,
            })?;
        }
        let stem = output_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image");

        for (index, (mask, class)) in masks
            .outer_iter()
            .zip(detections.pred_classes.iter())
            .enumerate()
        {
            let mask_file = output_file.with_file_name(format!("{stem}_{index}_{class}.png"));
            mask_to_image(mask)?
                .save_with_format(&mask_file, ImageFormat::Png)
                .map_err(|e| SparseInstError::ImageProcessing {
                    path: mask_file.display().to_string(),
                    operation: "save mask".to_string(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    pub fn get_relative_path(&self, input_file: &Path) -> Result<PathBuf> {
        let input_dir = &self.config.input_dir;
        input_file
            .strip_prefix(input_dir)
            .map(|p| p.to_path_buf())
            .map_err(|_| SparseInstError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "relative path".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is outside the input directory",
                ),
            })
    }
}

impl ImageProcessor<OnnxNetwork> {
    pub fn with_onnx_model(config: Config) -> Result<Self> {
        let model_config = config.model_config();
        if config.canvas_size % model_config.size_divisibility != 0 {
            return Err(SparseInstError::Configuration {
                message: format!(
                    "canvas size {} is not a multiple of {}",
                    config.canvas_size, model_config.size_divisibility
                ),
            });
        }
        let network = OnnxNetwork::new(&config.model_path, config.device_id, config.canvas_size)?;
        let model = SparseInst::new(network, model_config)?;
        Ok(Self::new(model, config))
    }
}

fn mask_to_image(mask: ArrayView2<bool>) -> Result<GrayImage> {
    let (height, width) = mask.dim();
    let pixels = mask.iter().map(|&v| if v { u8::MAX } else { 0 }).collect();
    GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| SparseInstError::validation("mask", "buffer does not match its size"))
}
