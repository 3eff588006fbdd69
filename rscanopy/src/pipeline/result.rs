use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Elevation products, in the order they are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Elevation {
    Dsm,
    Dtm,
    Chm,
}

impl Elevation {
    pub const ALL: [Elevation; 3] = [Elevation::Dsm, Elevation::Dtm, Elevation::Chm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Elevation::Dsm => "dsm",
            Elevation::Dtm => "dtm",
            Elevation::Chm => "chm",
        }
    }
}

/// Pipeline stages. The derived order is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Load,
    SurfaceModel,
    TerrainModel,
    Normalization,
    CanopyHeightModel,
    CorrectedTerrainModel,
    Roughness,
    CanopyCover,
    Density,
    Hillshade(Elevation),
    /// The tile task itself, reported when it panicked
    Worker,
}

impl Stage {
    /// Whether a failure at this stage ends the tile. Metric and hillshade
    /// failures only cost their own output.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Stage::Roughness | Stage::CanopyCover | Stage::Density | Stage::Hillshade(_)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Load => write!(f, "load"),
            Stage::SurfaceModel => write!(f, "surface_model"),
            Stage::TerrainModel => write!(f, "terrain_model"),
            Stage::Normalization => write!(f, "normalization"),
            Stage::CanopyHeightModel => write!(f, "canopy_height_model"),
            Stage::CorrectedTerrainModel => write!(f, "corrected_terrain_model"),
            Stage::Roughness => write!(f, "roughness"),
            Stage::CanopyCover => write!(f, "canopy_cover"),
            Stage::Density => write!(f, "density"),
            Stage::Hillshade(elevation) => write!(f, "hillshade_{}", elevation.as_str()),
            Stage::Worker => write!(f, "worker"),
        }
    }
}

// Stages key JSON maps, so they serialize as their display name
impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StageOutcome {
    Written,
    SkippedEmpty,
    SkippedExists,
    Failed(String),
}

/// Outcome of one tile. Intermediate stages that succeed are not recorded;
/// only writes, skips and failures are.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub tile_name: String,
    pub year: String,
    pub stage_outcomes: BTreeMap<Stage, StageOutcome>,
}

impl PipelineResult {
    pub fn new(tile_name: impl Into<String>, year: impl Into<String>) -> Self {
        PipelineResult {
            tile_name: tile_name.into(),
            year: year.into(),
            stage_outcomes: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, stage: Stage, outcome: StageOutcome) {
        match &outcome {
            StageOutcome::Failed(reason) => {
                tracing::error!(tile = %self.tile_name, stage = %stage, reason = %reason, "stage failed")
            }
            StageOutcome::SkippedEmpty => {
                tracing::warn!(tile = %self.tile_name, stage = %stage, "stage produced nothing")
            }
            StageOutcome::SkippedExists => {
                tracing::debug!(tile = %self.tile_name, stage = %stage, "output exists, skipped")
            }
            StageOutcome::Written => {
                tracing::debug!(tile = %self.tile_name, stage = %stage, "output written")
            }
        }
        self.stage_outcomes.insert(stage, outcome);
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stage_outcomes.get(&stage)
    }

    /// True when a failure ended the tile
    pub fn is_failed(&self) -> bool {
        self.stage_outcomes
            .iter()
            .any(|(stage, outcome)| stage.is_terminal() && matches!(outcome, StageOutcome::Failed(_)))
    }

    pub fn written(&self) -> usize {
        self.stage_outcomes
            .values()
            .filter(|o| **o == StageOutcome::Written)
            .count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub written: usize,
    pub skipped_empty: usize,
    pub skipped_exists: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileFailure {
    pub tile: String,
    pub stage: Stage,
    pub reason: String,
}

/// Run-level aggregate of every tile result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub year: String,
    pub tiles: usize,
    pub tiles_failed: usize,
    pub stages: BTreeMap<Stage, StageCounts>,
    pub failures: Vec<TileFailure>,
}

impl RunSummary {
    pub fn from_results(year: impl Into<String>, results: &[PipelineResult]) -> Self {
        let mut stages: BTreeMap<Stage, StageCounts> = BTreeMap::new();
        let mut failures = Vec::new();

        for result in results {
            for (stage, outcome) in &result.stage_outcomes {
                let counts = stages.entry(*stage).or_default();
                match outcome {
                    StageOutcome::Written => counts.written += 1,
                    StageOutcome::SkippedEmpty => counts.skipped_empty += 1,
                    StageOutcome::SkippedExists => counts.skipped_exists += 1,
                    StageOutcome::Failed(reason) => {
                        counts.failed += 1;
                        failures.push(TileFailure {
                            tile: result.tile_name.clone(),
                            stage: *stage,
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }

        RunSummary {
            year: year.into(),
            tiles: results.len(),
            tiles_failed: results.iter().filter(|r| r.is_failed()).count(),
            stages,
            failures,
        }
    }

    pub fn counts(&self, stage: Stage) -> StageCounts {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run summary")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write run summary {:?}", path))
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} tiles for {}, {} failed",
            self.tiles, self.year, self.tiles_failed
        )?;
        writeln!(
            f,
            "{:<26} {:>8} {:>8} {:>8} {:>8}",
            "stage", "written", "empty", "exists", "failed"
        )?;
        for (stage, counts) in &self.stages {
            writeln!(
                f,
                "{:<26} {:>8} {:>8} {:>8} {:>8}",
                stage.to_string(),
                counts.written,
                counts.skipped_empty,
                counts.skipped_exists,
                counts.failed
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_results() -> Vec<PipelineResult> {
        let mut ok = PipelineResult::new("a", "2021");
        ok.record(Stage::SurfaceModel, StageOutcome::Written);
        ok.record(Stage::CanopyHeightModel, StageOutcome::Written);
        ok.record(Stage::Density, StageOutcome::Failed("no cells".into()));

        let mut empty = PipelineResult::new("b", "2021");
        empty.record(Stage::Load, StageOutcome::SkippedEmpty);

        let mut broken = PipelineResult::new("c", "2021");
        broken.record(Stage::Load, StageOutcome::Failed("bad header".into()));
        vec![ok, empty, broken]
    }

    #[test]
    fn test_metric_failure_does_not_fail_tile() {
        let results = sample_results();
        assert!(!results[0].is_failed());
        assert!(!results[1].is_failed());
        assert!(results[2].is_failed());
        assert_eq!(results[0].written(), 2);
    }

    #[test]
    fn test_summary_counts() {
        let summary = RunSummary::from_results("2021", &sample_results());
        assert_eq!(summary.tiles, 3);
        assert_eq!(summary.tiles_failed, 1);
        assert_eq!(
            summary.counts(Stage::Load),
            StageCounts {
                skipped_empty: 1,
                failed: 1,
                ..Default::default()
            }
        );
        assert_eq!(summary.counts(Stage::SurfaceModel).written, 1);
        assert_eq!(summary.failures.len(), 2);
        assert!(summary.to_string().contains("canopy_height_model"));
    }

    #[test]
    fn test_result_json_uses_stage_names() {
        let mut result = PipelineResult::new("t1", "2019");
        result.record(Stage::Hillshade(Elevation::Dsm), StageOutcome::SkippedExists);
        result.record(Stage::Worker, StageOutcome::Failed("boom".into()));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json["stage_outcomes"]["hillshade_dsm"]["status"],
            "skipped_exists"
        );
        assert_eq!(json["stage_outcomes"]["worker"]["reason"], "boom");
    }
}
