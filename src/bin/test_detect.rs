//! Quick detection test binary
//! Run with: cargo run --release --bin test_detect -- <image_path> [options.json]

use anyhow::{Context, Result};
use manga_regions::{AnalyzerConfig, PageAnalyzer, ProcessingOptions};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AnalyzerConfig::new().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter()))
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let sample_path = if args.len() > 1 {
        args[1].clone()
    } else {
        "test_sample.png".to_string()
    };

    if !Path::new(&sample_path).exists() {
        eprintln!("Image not found: {}", sample_path);
        std::process::exit(1);
    }

    // Per-page options: a JSON file if given, environment otherwise
    let options = match args.get(2) {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
            serde_json::from_str::<ProcessingOptions>(&raw).with_context(|| format!("Invalid options in {}", path))?
        }
        None => ProcessingOptions::from_env()?,
    };

    info!("Loading image: {}", sample_path);
    let bytes = std::fs::read(&sample_path)?;
    let buffer = manga_regions::utils::load_pixel_buffer_async(&bytes).await?;
    info!("Image dimensions: {}x{}", buffer.width(), buffer.height());

    let analyzer = PageAnalyzer::from_config(config).await?;
    info!("Model backend: {}", analyzer.ml_backend());

    let result = analyzer.detect(buffer, &options).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    eprintln!("{}", serde_json::to_string_pretty(&analyzer.metrics().snapshot())?);

    Ok(())
}
