use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::PipelineConfig;
use crate::geometric::engine::RasterEngine;
use crate::geometric::raster::Raster;
use crate::pipeline::result::{Elevation, StageOutcome};

/// Every raster the pipeline can write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Product {
    Elevation(Elevation),
    Roughness,
    CanopyCover,
    Density,
    Hillshade(Elevation),
}

impl Product {
    pub fn subfolder(&self) -> &'static str {
        match self {
            Product::Elevation(elevation) => elevation.as_str(),
            Product::Roughness => "rumple",
            Product::CanopyCover => "canopy_cover",
            Product::Density => "density",
            Product::Hillshade(_) => "hillshade",
        }
    }

    pub fn suffix(&self) -> String {
        match self {
            Product::Elevation(elevation) => elevation.as_str().to_string(),
            Product::Roughness => "rumple".to_string(),
            Product::CanopyCover => "cover".to_string(),
            Product::Density => "density".to_string(),
            Product::Hillshade(elevation) => format!("{}_hillshade", elevation.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    SkippedExists,
}

impl From<WriteOutcome> for StageOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Written => StageOutcome::Written,
            WriteOutcome::SkippedExists => StageOutcome::SkippedExists,
        }
    }
}

/// Destination naming and the overwrite policy
#[derive(Debug, Clone, Copy)]
pub struct OutputWriter<'a> {
    config: &'a PipelineConfig,
}

impl<'a> OutputWriter<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        OutputWriter { config }
    }

    /// `{output_root}/{subfolder}/{tile}_{year}_{suffix}.tif`
    pub fn destination(&self, tile: &str, product: Product) -> PathBuf {
        self.config.output_root.join(product.subfolder()).join(format!(
            "{}_{}_{}.tif",
            tile,
            self.config.year,
            product.suffix()
        ))
    }

    /// True when the product must not be (re)computed for `tile`
    pub fn skips(&self, tile: &str, product: Product) -> bool {
        !self.config.overwrite && self.destination(tile, product).is_file()
    }

    /// Write `raster` unless skip-existing applies. The file goes to a
    /// hidden sibling first and is renamed into place, so a crash never
    /// leaves a partial file at the destination.
    pub fn write(
        &self,
        engine: &dyn RasterEngine,
        raster: &Raster,
        tile: &str,
        product: Product,
    ) -> Result<WriteOutcome> {
        if self.skips(tile, product) {
            return Ok(WriteOutcome::SkippedExists);
        }

        let destination = self.destination(tile, product);
        let dir = destination
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.output_root.clone());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;

        let file_name = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = dir.join(format!(".{}.partial", file_name));

        let written = engine
            .write_raster(raster, &staging)
            .and_then(|_| {
                std::fs::rename(&staging, &destination)
                    .with_context(|| format!("Failed to move {:?} into place", destination))
            });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&staging);
            return Err(e.context(format!("Failed to write {:?}", destination)));
        }

        tracing::debug!(
            tile = tile,
            path = %destination.display(),
            cells = raster.valid_count(),
            "raster written"
        );
        Ok(WriteOutcome::Written)
    }
}
