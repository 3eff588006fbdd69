//! Tile processing: per-tile state machine, output policy, worker pool and
//! run accounting.

pub mod output;
pub mod result;
pub mod scheduler;
pub mod tile;

pub use output::{OutputWriter, Product, WriteOutcome};
pub use result::{Elevation, PipelineResult, RunSummary, Stage, StageOutcome};
pub use scheduler::Scheduler;
pub use tile::{TilePipeline, TileTask};

use anyhow::Result;
use std::path::Path;

use crate::collect::catalog::Catalog;
use crate::config::PipelineConfig;
use crate::geometric::correction::CorrectionProvider;
use crate::geometric::engine::RasterEngine;

/// Enumerate the point clouds under `input_root` and process every tile
pub fn process_directory(
    input_root: &Path,
    config: &PipelineConfig,
    engine: &dyn RasterEngine,
    corrections: &dyn CorrectionProvider,
) -> Result<Vec<PipelineResult>> {
    let tiles = Catalog::from_config(config)?.enumerate(input_root)?;
    Scheduler::new(config, engine, corrections).run(&tiles)
}

/// Result of one pipeline stage
#[derive(Debug)]
pub enum Step<T> {
    /// The stage produced a value and the next stage runs
    Proceed(T),
    /// Nothing left to work on; the tile stops without error
    Empty(String),
    Failed(anyhow::Error),
}

impl<T> Step<T> {
    /// Value to carry on with, or the outcome to record for a stage that
    /// ends the tile
    pub fn into_outcome(self) -> Result<T, StageOutcome> {
        match self {
            Step::Proceed(value) => Ok(value),
            Step::Empty(reason) => {
                tracing::debug!(reason = %reason, "stage produced nothing");
                Err(StageOutcome::SkippedEmpty)
            }
            Step::Failed(e) => Err(StageOutcome::Failed(format!("{:#}", e))),
        }
    }
}

impl<T> From<anyhow::Result<Step<T>>> for Step<T> {
    fn from(result: anyhow::Result<Step<T>>) -> Self {
        result.unwrap_or_else(Step::Failed)
    }
}
