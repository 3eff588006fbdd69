//! rscanopy CLI: DSM, DTM, CHM and canopy structure rasters for a directory
//! of LAS/LAZ tiles

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::{fmt, EnvFilter};

use rscanopy::geometric::correction::GeoidGrid;
use rscanopy::geometric::engine::GridEngine;
use rscanopy::{process_directory, PipelineConfig, RunSummary};

#[derive(Parser, Debug)]
#[command(name = "rscanopy")]
#[command(author, version, about = "Per-tile terrain and canopy rasters from LiDAR catalogs", long_about = None)]
struct Cli {
    /// Directory holding the LAS/LAZ tiles
    input: PathBuf,

    /// JSON run configuration; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output root (required without --config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Acquisition year tag (required without --config)
    #[arg(short, long)]
    year: Option<String>,

    /// Replace existing outputs
    #[arg(long)]
    overwrite: bool,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// DSM/DTM/CHM cell size
    #[arg(long)]
    resolution: Option<f64>,

    /// Structural metric cell size
    #[arg(long)]
    metric_resolution: Option<f64>,

    /// Re-tile into squares of this size (0 keeps the input tiling)
    #[arg(long)]
    chunk_size: Option<f64>,

    /// Margin loaded around every tile
    #[arg(long)]
    buffer: Option<f64>,

    /// Vertical correction grid (GeoTIFF)
    #[arg(long)]
    correction: Option<PathBuf>,

    /// EPSG code written into the outputs
    #[arg(long)]
    epsg: Option<u16>,

    /// Also write shaded relief of the elevation products
    #[arg(long)]
    hillshade: bool,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Do not write summary_{year}.json
    #[arg(long)]
    no_summary: bool,
}

impl Cli {
    fn into_config(self) -> Result<(PathBuf, PipelineConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => {
                let output = self
                    .output
                    .clone()
                    .context("--output is required without --config")?;
                let year = self.year.clone().context("--year is required without --config")?;
                PipelineConfig::new(output, year)
            }
        };

        if let Some(output) = self.output {
            config.output_root = output;
        }
        if let Some(year) = self.year {
            config.year = year;
        }
        if self.overwrite {
            config.overwrite = true;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(resolution) = self.resolution {
            config.resolution = resolution;
        }
        if let Some(metric_resolution) = self.metric_resolution {
            config.metric_resolution = metric_resolution;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(buffer) = self.buffer {
            config.buffer = buffer;
        }
        if self.correction.is_some() {
            config.correction = self.correction;
        }
        if self.epsg.is_some() {
            config.epsg = self.epsg;
        }
        if self.hillshade {
            config.products.hillshade = true;
        }
        if self.no_progress {
            config.progress = false;
        }

        config.validate()?;
        Ok((self.input, config, !self.no_summary))
    }
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (input, config, write_summary) = Cli::parse().into_config()?;
    tracing::info!(input = %input.display(), config = ?config, "configuration loaded");

    let start = Instant::now();
    let engine = GridEngine::new(config.epsg);
    let results = process_directory(&input, &config, &engine, &GeoidGrid)?;
    let summary = RunSummary::from_results(&config.year, &results);

    println!("{}", summary);
    println!("Finished in {:.1}s", start.elapsed().as_secs_f64());

    if write_summary {
        let path = config
            .output_root
            .join(format!("summary_{}.json", config.year));
        summary.write_json(&path)?;
        tracing::info!(path = %path.display(), "run summary written");
    }
    Ok(())
}
