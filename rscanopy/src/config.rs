use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::collect::global_variables::{
    DEFAULT_BUFFER, DEFAULT_METRIC_RESOLUTION, DEFAULT_RESOLUTION, DEFAULT_WORKERS,
};
use crate::error::ConfigError;

/// Elevation products the pipeline can write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductFlags {
    pub dsm: bool,
    pub dtm: bool,
    pub chm: bool,
    /// Shaded relief of every enabled elevation product
    pub hillshade: bool,
}

impl Default for ProductFlags {
    fn default() -> Self {
        ProductFlags {
            dsm: true,
            dtm: true,
            chm: true,
            hillshade: false,
        }
    }
}

/// Structural metrics, each toggled independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricFlags {
    pub roughness: bool,
    pub canopy_cover: bool,
    pub density: bool,
}

impl Default for MetricFlags {
    fn default() -> Self {
        MetricFlags {
            roughness: true,
            canopy_cover: true,
            density: true,
        }
    }
}

/// Run configuration.
///
/// Built once per run, validated, then shared read-only by the scheduler and
/// every tile pipeline. Nothing in the crate mutates it after `validate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root under which one subfolder per product is created
    pub output_root: PathBuf,
    /// Acquisition year tag embedded in every output file name
    pub year: String,
    #[serde(default)]
    pub products: ProductFlags,
    #[serde(default)]
    pub metrics: MetricFlags,
    /// Replace existing outputs instead of skipping them
    #[serde(default)]
    pub overwrite: bool,
    /// Cell size of DSM, DTM and CHM
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// Cell size of the structural metrics
    #[serde(default = "default_metric_resolution")]
    pub metric_resolution: f64,
    /// Chunk edge length; 0 keeps the file-native tiling
    #[serde(default)]
    pub chunk_size: f64,
    /// Margin loaded around every tile to avoid edge artifacts
    #[serde(default = "default_buffer")]
    pub buffer: f64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Optional vertical correction grid (ellipsoidal to orthometric)
    #[serde(default)]
    pub correction: Option<PathBuf>,
    /// Projected CRS written into the GeoTIFF key directory
    #[serde(default)]
    pub epsg: Option<u16>,
    #[serde(default = "default_progress")]
    pub progress: bool,
}

fn default_resolution() -> f64 {
    DEFAULT_RESOLUTION
}

fn default_metric_resolution() -> f64 {
    DEFAULT_METRIC_RESOLUTION
}

fn default_buffer() -> f64 {
    DEFAULT_BUFFER
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_progress() -> bool {
    true
}

impl PipelineConfig {
    /// Configuration with every default and the two mandatory values
    pub fn new(output_root: impl Into<PathBuf>, year: impl Into<String>) -> Self {
        PipelineConfig {
            output_root: output_root.into(),
            year: year.into(),
            products: ProductFlags::default(),
            metrics: MetricFlags::default(),
            overwrite: false,
            resolution: DEFAULT_RESOLUTION,
            metric_resolution: DEFAULT_METRIC_RESOLUTION,
            chunk_size: 0.0,
            buffer: DEFAULT_BUFFER,
            workers: DEFAULT_WORKERS,
            correction: None,
            epsg: None,
            progress: default_progress(),
        }
    }

    /// Load a JSON configuration file and validate it
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("resolution", self.resolution)?;
        positive("metric_resolution", self.metric_resolution)?;
        non_negative("chunk_size", self.chunk_size)?;
        non_negative("buffer", self.buffer)?;
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let year = self.year.trim();
        if year.is_empty()
            || year.len() != self.year.len()
            || self
                .year
                .chars()
                .any(|c| c == '/' || c == '\\' || c == '.' || c.is_control())
        {
            return Err(ConfigError::InvalidYear(self.year.clone()));
        }
        Ok(())
    }

    /// Whether the elevation products must be read back for shading
    pub fn hillshade_enabled(&self) -> bool {
        self.products.hillshade && (self.products.dsm || self.products.dtm || self.products.chm)
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            reason: "must be a positive number",
        })
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            reason: "must be zero or positive",
        })
    }
}
