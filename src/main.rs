use anyhow::{ensure, Context, Result};
use rayon::ThreadPoolBuilder;
use tracing_subscriber::EnvFilter;

use sparse_inst_rs::{Config, ImageProcessor};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let config = Config::new();

    ensure!(config.model_path.exists(), "Model path does not exist");
    ensure!(config.input_dir.exists(), "Input directory does not exist");
    let size_divisibility = config.model_config().size_divisibility;
    ensure!(
        config.canvas_size % size_divisibility == 0,
        "Canvas size must be a multiple of {size_divisibility}"
    );

    ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build_global()?;

    let processor = ImageProcessor::with_onnx_model(config.clone()).with_context(|| {
        format!("Failed to load model: {}", config.model_path.display())
    })?;
    processor.process_directory()?;

    Ok(())
}
