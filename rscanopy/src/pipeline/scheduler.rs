use anyhow::{Context, Result};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::collect::catalog::TileDescriptor;
use crate::config::PipelineConfig;
use crate::geometric::correction::{CorrectionProvider, CorrectionRaster, VerticalCorrection};
use crate::geometric::engine::RasterEngine;
use crate::pipeline::result::{PipelineResult, Stage, StageOutcome};
use crate::pipeline::tile::{TilePipeline, TileTask};

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

#[cfg(feature = "indicatif")]
fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {percent} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("##-")
}

/// Runs tile pipelines on a fixed-size worker pool
pub struct Scheduler<'a> {
    config: &'a PipelineConfig,
    engine: &'a dyn RasterEngine,
    corrections: &'a dyn CorrectionProvider,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        engine: &'a dyn RasterEngine,
        corrections: &'a dyn CorrectionProvider,
    ) -> Self {
        Scheduler {
            config,
            engine,
            corrections,
        }
    }

    /// Process every tile and return one result per tile, in input order.
    ///
    /// Tile failures, including panics, are reported in the results. Only
    /// configuration problems (invalid settings, an unreadable correction
    /// grid, a pool that cannot start) fail the call, and they do so before
    /// any tile runs.
    pub fn run(&self, tiles: &[TileDescriptor]) -> Result<Vec<PipelineResult>> {
        self.config.validate()?;

        let correction = self.load_correction()?;
        let correction = correction
            .as_ref()
            .map(|raster| VerticalCorrection::new(self.corrections, raster));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|idx| format!("tile-worker-{}", idx))
            .build()
            .context("Failed to start the worker pool")?;

        tracing::info!(
            tiles = tiles.len(),
            workers = self.config.workers,
            year = %self.config.year,
            overwrite = self.config.overwrite,
            corrected = correction.is_some(),
            "run started"
        );

        #[cfg(feature = "indicatif")]
        let progress = (self.config.progress && tiles.len() > 1).then(|| {
            let pb = ProgressBar::new(tiles.len() as u64);
            pb.set_style(progress_style());
            pb.set_message("Tiles");
            pb
        });

        let results: Vec<PipelineResult> = pool.install(|| {
            tiles
                .par_iter()
                .map(|tile| {
                    let task = TileTask {
                        tile,
                        config: self.config,
                        correction,
                    };
                    let result = self.run_guarded(task);
                    #[cfg(feature = "indicatif")]
                    if let Some(pb) = &progress {
                        pb.inc(1);
                    }
                    result
                })
                .collect()
        });

        #[cfg(feature = "indicatif")]
        if let Some(pb) = &progress {
            pb.finish_with_message("All tiles processed");
        }

        tracing::info!(
            tiles = results.len(),
            failed = results.iter().filter(|r| r.is_failed()).count(),
            "run finished"
        );
        Ok(results)
    }

    fn load_correction(&self) -> Result<Option<CorrectionRaster>> {
        match &self.config.correction {
            Some(path) => {
                let raster = self
                    .corrections
                    .load(path)
                    .with_context(|| format!("Vertical correction {:?} is unusable", path))?;
                Ok(Some(raster))
            }
            None => Ok(None),
        }
    }

    fn run_guarded(&self, task: TileTask<'_>) -> PipelineResult {
        let engine = self.engine;
        match catch_unwind(AssertUnwindSafe(|| TilePipeline::new(task, engine).run())) {
            Ok(result) => result,
            Err(payload) => {
                let mut result = PipelineResult::new(&task.tile.name, &task.config.year);
                result.record(
                    Stage::Worker,
                    StageOutcome::Failed(format!("panic: {}", panic_message(payload.as_ref()))),
                );
                result
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
