use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::errors::{Result, SparseInstError};

/// Channel order of the raw images handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputFormat {
    Rgb,
    Bgr,
}

impl InputFormat {
    /// Index of the red, green and blue planes in a CHW tensor.
    pub const fn rgb_channels(self) -> [usize; 3] {
        match self {
            Self::Rgb => [0, 1, 2],
            Self::Bgr => [2, 1, 0],
        }
    }
}

/// Annotation format of ground-truth masks. Accepted for compatibility,
/// box supervision never reads mask annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MaskFormat {
    Polygon,
    Bitmask,
}

/// Immutable model constants, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub device_id: i32,
    pub pixel_mean: [f32; 3],
    pub pixel_std: [f32; 3],
    pub input_format: InputFormat,
    pub size_divisibility: usize,
    pub cls_threshold: f32,
    pub mask_threshold: f32,
    pub max_detections: usize,
    pub mask_format: MaskFormat,
    pub pairwise_size: usize,
    pub pairwise_dilation: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            pixel_mean: [103.530, 116.280, 123.675],
            pixel_std: [57.375, 57.120, 58.395],
            input_format: InputFormat::Bgr,
            size_divisibility: 32,
            cls_threshold: 0.005,
            mask_threshold: 0.45,
            max_detections: 100,
            mask_format: MaskFormat::Polygon,
            pairwise_size: 3,
            pairwise_dilation: 2,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pixel_std.iter().any(|s| *s == 0.0) {
            return Err(SparseInstError::validation(
                "pixel_std",
                "must not contain zero",
            ));
        }
        if self.size_divisibility == 0 || self.size_divisibility % 4 != 0 {
            return Err(SparseInstError::validation(
                "size_divisibility",
                format!("{} is not a positive multiple of 4", self.size_divisibility),
            ));
        }
        if !(0.0..=1.0).contains(&self.mask_threshold) {
            return Err(SparseInstError::validation(
                "mask_threshold",
                format!("{} is outside [0, 1]", self.mask_threshold),
            ));
        }
        if self.pairwise_size % 2 == 0 {
            return Err(SparseInstError::validation(
                "pairwise_size",
                format!("{} is not odd", self.pairwise_size),
            ));
        }
        if self.pairwise_dilation == 0 {
            return Err(SparseInstError::validation(
                "pairwise_dilation",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Parser, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    pub input_dir: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(short, long)]
    pub model_path: PathBuf,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, default_value_t = 0.005)]
    pub cls_threshold: f32,

    #[arg(long, default_value_t = 0.45)]
    pub mask_threshold: f32,

    #[arg(long, default_value_t = 100)]
    pub max_detections: usize,

    #[arg(long, value_enum, default_value_t = InputFormat::Bgr)]
    pub input_format: InputFormat,

    /// Side of the square padded canvas the exported network expects.
    #[arg(long, default_value_t = 640)]
    pub canvas_size: usize,

    #[arg(
        short, long, default_value_t = std::thread::available_parallelism().map_or(1, |n| n.get())
    )]
    pub num_threads: usize,
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            device_id: self.device_id,
            cls_threshold: self.cls_threshold,
            mask_threshold: self.mask_threshold,
            max_detections: self.max_detections,
            input_format: self.input_format,
            ..ModelConfig::default()
        }
    }
}
