//! Per-tile state machine.
//!
//! Stages run in a fixed order and every stage can end the tile:
//!
//! ```text
//! Load -> SurfaceModel -> TerrainModel -> Normalization -> CanopyHeightModel
//!      -> CorrectedTerrainModel -> metrics -> hillshades
//! ```
//!
//! Heights are normalized against the uncorrected terrain. The vertical
//! correction is applied to the surface model before it is written, and to
//! the terrain only once normalization is done; [`EllipsoidalTerrain`] is
//! consumed by that conversion so the corrected terrain can never reach
//! normalization.

use anyhow::{Context, Result};
use std::path::Path;

use crate::collect::catalog::TileDescriptor;
use crate::collect::global_variables::{
    CANOPY_COVER_THRESHOLD, DENSITY_THRESHOLD, SURFACE_TOP_TOLERANCE,
};
use crate::config::PipelineConfig;
use crate::geo_core::{BoundingBox, GridSpec};
use crate::geometric::correction::VerticalCorrection;
use crate::geometric::engine::{RasterEngine, SurfaceKind, SurfaceParams};
use crate::geometric::hillshade::{hillshade, HillshadeParams};
use crate::geometric::lidar::{LidarPoint, PointCloudChunk};
use crate::geometric::metrics::{fraction_above, rumple_index, CellMetric};
use crate::geometric::raster::Raster;
use crate::pipeline::output::{OutputWriter, Product};
use crate::pipeline::result::{Elevation, PipelineResult, Stage, StageOutcome};
use crate::pipeline::Step;

/// Everything one worker needs to process one tile
#[derive(Clone, Copy)]
pub struct TileTask<'a> {
    pub tile: &'a TileDescriptor,
    pub config: &'a PipelineConfig,
    pub correction: Option<VerticalCorrection<'a>>,
}

/// DSM before and after the vertical correction
#[derive(Debug, Clone)]
pub struct SurfaceModel {
    raw: Raster,
    output: Raster,
}

impl SurfaceModel {
    /// Surface in the point cloud's own height reference
    pub fn raw(&self) -> &Raster {
        &self.raw
    }

    /// Surface as written, defining the product footprint
    pub fn output(&self) -> &Raster {
        &self.output
    }
}

/// Terrain in the point cloud's height reference
#[derive(Debug, Clone)]
pub struct EllipsoidalTerrain(Raster);

impl EllipsoidalTerrain {
    pub fn raster(&self) -> &Raster {
        &self.0
    }

    pub fn into_orthometric(self, correction: Option<&VerticalCorrection<'_>>) -> OrthometricTerrain {
        match correction {
            Some(correction) => OrthometricTerrain(correction.apply(&self.0)),
            None => OrthometricTerrain(self.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrthometricTerrain(Raster);

impl OrthometricTerrain {
    pub fn raster(&self) -> &Raster {
        &self.0
    }
}

/// Points with heights above ground
#[derive(Debug, Clone)]
pub struct NormalizedCloud(Vec<LidarPoint>);

impl NormalizedCloud {
    pub fn points(&self) -> &[LidarPoint] {
        &self.0
    }
}

macro_rules! proceed {
    ($pipeline:ident, $stage:expr, $step:expr) => {
        match Step::from($step).into_outcome() {
            Ok(value) => value,
            Err(outcome) => return $pipeline.terminate($stage, outcome),
        }
    };
}

pub struct TilePipeline<'a> {
    task: TileTask<'a>,
    engine: &'a dyn RasterEngine,
    writer: OutputWriter<'a>,
    result: PipelineResult,
}

impl<'a> TilePipeline<'a> {
    pub fn new(task: TileTask<'a>, engine: &'a dyn RasterEngine) -> Self {
        TilePipeline {
            writer: OutputWriter::new(task.config),
            result: PipelineResult::new(&task.tile.name, &task.config.year),
            task,
            engine,
        }
    }

    pub fn run(mut self) -> PipelineResult {
        let _span = tracing::info_span!("tile", tile = %self.task.tile.name).entered();

        if self.outputs_complete() {
            for (stage, _) in self.enabled_outputs() {
                self.result.record(stage, StageOutcome::SkippedExists);
            }
            tracing::info!("every output present, tile not loaded");
            return self.result;
        }

        let chunk = proceed!(self, Stage::Load, self.load());
        let surface = proceed!(self, Stage::SurfaceModel, self.surface_model(&chunk));
        let terrain = proceed!(self, Stage::TerrainModel, self.terrain_model(&chunk));
        let cloud = proceed!(self, Stage::Normalization, self.normalization(&chunk, &terrain));
        proceed!(
            self,
            Stage::CanopyHeightModel,
            self.canopy_height_model(&chunk, &cloud, &surface)
        );
        proceed!(
            self,
            Stage::CorrectedTerrainModel,
            self.corrected_terrain_model(&chunk, terrain, &surface)
        );

        self.metrics(&chunk, &surface, &cloud);
        self.hillshades();

        tracing::info!(written = self.result.written(), "tile done");
        self.result
    }

    fn terminate(mut self, stage: Stage, outcome: StageOutcome) -> PipelineResult {
        self.result.record(stage, outcome);
        self.result
    }

    fn elevation_enabled(&self, elevation: Elevation) -> bool {
        let products = &self.task.config.products;
        match elevation {
            Elevation::Dsm => products.dsm,
            Elevation::Dtm => products.dtm,
            Elevation::Chm => products.chm,
        }
    }

    /// Stage and product of every output this configuration asks for
    fn enabled_outputs(&self) -> Vec<(Stage, Product)> {
        let mut outputs = Vec::new();
        let elevation_stages = [
            (Elevation::Dsm, Stage::SurfaceModel),
            (Elevation::Chm, Stage::CanopyHeightModel),
            (Elevation::Dtm, Stage::CorrectedTerrainModel),
        ];
        for (elevation, stage) in elevation_stages {
            if self.elevation_enabled(elevation) {
                outputs.push((stage, Product::Elevation(elevation)));
            }
        }

        let metrics = &self.task.config.metrics;
        if metrics.roughness {
            outputs.push((Stage::Roughness, Product::Roughness));
        }
        if metrics.canopy_cover {
            outputs.push((Stage::CanopyCover, Product::CanopyCover));
        }
        if metrics.density {
            outputs.push((Stage::Density, Product::Density));
        }

        if self.task.config.hillshade_enabled() {
            for elevation in Elevation::ALL {
                if self.elevation_enabled(elevation) {
                    outputs.push((Stage::Hillshade(elevation), Product::Hillshade(elevation)));
                }
            }
        }
        outputs
    }

    fn outputs_complete(&self) -> bool {
        let outputs = self.enabled_outputs();
        !outputs.is_empty()
            && outputs
                .iter()
                .all(|(_, product)| self.writer.skips(&self.task.tile.name, *product))
    }

    fn surface_params(&self, kind: SurfaceKind, chunk: &PointCloudChunk) -> SurfaceParams {
        SurfaceParams {
            kind,
            resolution: self.task.config.resolution,
            extent: *chunk.buffered(),
        }
    }

    fn write(&mut self, stage: Stage, product: Product, raster: &Raster) -> Result<()> {
        let outcome = self
            .writer
            .write(self.engine, raster, &self.task.tile.name, product)?;
        self.result.record(stage, outcome.into());
        Ok(())
    }

    fn load(&self) -> Result<Step<PointCloudChunk>> {
        let tile = self.task.tile;
        let points = self
            .engine
            .load(tile)
            .with_context(|| format!("Failed to load tile {}", tile.name))?;
        let Some(chunk) = PointCloudChunk::new(&tile.name, points, tile.extent, tile.buffer) else {
            return Ok(Step::Empty("no point in the buffered extent".to_string()));
        };
        tracing::info!(
            tile = chunk.tile_name(),
            points = chunk.len(),
            sources = tile.sources.len(),
            "tile loaded"
        );
        Ok(Step::Proceed(chunk))
    }

    fn surface_model(&mut self, chunk: &PointCloudChunk) -> Result<Step<SurfaceModel>> {
        let params = self.surface_params(SurfaceKind::Highest, chunk);
        let raw = self
            .engine
            .interpolate_surface(chunk.points(), &params)
            .context("Surface interpolation failed")?;

        let output = match &self.task.correction {
            Some(correction) => correction.apply(&raw),
            None => raw.clone(),
        };
        // Points of the buffer alone do not make a tile
        let nominal = output.crop(chunk.nominal());
        if nominal.is_undefined() {
            return Ok(Step::Empty("surface model has no defined cell".to_string()));
        }
        if self.task.config.products.dsm {
            self.write(Stage::SurfaceModel, Product::Elevation(Elevation::Dsm), &nominal)?;
        }
        Ok(Step::Proceed(SurfaceModel { raw, output }))
    }

    fn terrain_model(&self, chunk: &PointCloudChunk) -> Result<Step<EllipsoidalTerrain>> {
        let ground = self
            .engine
            .classify_ground(chunk.points())
            .context("Ground classification failed")?;
        if ground.is_empty() {
            return Ok(Step::Empty("no ground point".to_string()));
        }

        let params = self.surface_params(SurfaceKind::Terrain, chunk);
        let terrain = self
            .engine
            .interpolate_surface(&ground, &params)
            .context("Terrain interpolation failed")?;
        if terrain.is_undefined() {
            return Ok(Step::Empty("terrain model has no defined cell".to_string()));
        }
        Ok(Step::Proceed(EllipsoidalTerrain(terrain)))
    }

    fn normalization(
        &self,
        chunk: &PointCloudChunk,
        terrain: &EllipsoidalTerrain,
    ) -> Result<Step<NormalizedCloud>> {
        let points = self
            .engine
            .normalize(chunk.points(), terrain.raster())
            .context("Height normalization failed")?;
        let dropped = chunk.len() - points.len();
        if dropped > 0 {
            tracing::debug!(
                tile = chunk.tile_name(),
                dropped,
                "points over undefined terrain left out of normalization"
            );
        }
        if points.is_empty() {
            return Ok(Step::Empty("no point over defined terrain".to_string()));
        }
        Ok(Step::Proceed(NormalizedCloud(points)))
    }

    fn canopy_height_model(
        &mut self,
        chunk: &PointCloudChunk,
        cloud: &NormalizedCloud,
        surface: &SurfaceModel,
    ) -> Result<Step<()>> {
        let params = self.surface_params(SurfaceKind::Highest, chunk);
        let chm = self
            .engine
            .interpolate_surface(cloud.points(), &params)
            .context("Canopy height interpolation failed")?
            .map_defined(|height| height.max(0.0))
            .mask_to(surface.output())
            .crop(chunk.nominal());
        if chm.is_undefined() {
            return Ok(Step::Empty("canopy height model has no defined cell".to_string()));
        }

        if self.task.config.products.chm {
            self.write(Stage::CanopyHeightModel, Product::Elevation(Elevation::Chm), &chm)?;
        }
        Ok(Step::Proceed(()))
    }

    fn corrected_terrain_model(
        &mut self,
        chunk: &PointCloudChunk,
        terrain: EllipsoidalTerrain,
        surface: &SurfaceModel,
    ) -> Result<Step<()>> {
        let terrain = terrain.into_orthometric(self.task.correction.as_ref());
        let dtm = terrain
            .raster()
            .mask_to(surface.output())
            .crop(chunk.nominal());
        if dtm.is_undefined() {
            return Ok(Step::Empty("corrected terrain model has no defined cell".to_string()));
        }
        if self.task.config.products.dtm {
            self.write(Stage::CorrectedTerrainModel, Product::Elevation(Elevation::Dtm), &dtm)?;
        }
        Ok(Step::Proceed(()))
    }

    fn metrics(&mut self, chunk: &PointCloudChunk, surface: &SurfaceModel, cloud: &NormalizedCloud) {
        let enabled = self.task.config.metrics;
        let grid = GridSpec::aligned(chunk.nominal(), self.task.config.metric_resolution);

        if enabled.roughness {
            // Returns near the top of the raw surface model
            let top_points = || -> Vec<LidarPoint> {
                chunk
                    .points()
                    .iter()
                    .filter(|p| {
                        surface
                            .raw()
                            .value_at(p.x, p.y)
                            .map_or(false, |top| top - p.z <= SURFACE_TOP_TOLERANCE)
                    })
                    .copied()
                    .collect()
            };
            self.metric(Stage::Roughness, Product::Roughness, &grid, top_points, &rumple_index);
        }

        if enabled.canopy_cover {
            let first_returns = || -> Vec<LidarPoint> {
                cloud
                    .points()
                    .iter()
                    .filter(|p| p.is_first_return())
                    .copied()
                    .collect()
            };
            let cover = |points: &[LidarPoint], _: &BoundingBox| {
                fraction_above(points, CANOPY_COVER_THRESHOLD)
            };
            self.metric(Stage::CanopyCover, Product::CanopyCover, &grid, first_returns, &cover);
        }

        if enabled.density {
            let density = |points: &[LidarPoint], _: &BoundingBox| {
                fraction_above(points, DENSITY_THRESHOLD)
            };
            self.metric(
                Stage::Density,
                Product::Density,
                &grid,
                || cloud.points().to_vec(),
                &density,
            );
        }
    }

    /// One structural metric. Skip-existing is checked before any work and
    /// a failure only costs this output.
    fn metric(
        &mut self,
        stage: Stage,
        product: Product,
        grid: &GridSpec,
        points: impl FnOnce() -> Vec<LidarPoint>,
        metric: &CellMetric,
    ) {
        if self.writer.skips(&self.task.tile.name, product) {
            self.result.record(stage, StageOutcome::SkippedExists);
            return;
        }

        let points = points();
        let step = if points.is_empty() {
            Step::Empty("point filter left nothing".to_string())
        } else {
            Step::from(self.aggregate_and_write(stage, product, grid, &points, metric))
        };
        if let Err(outcome) = step.into_outcome() {
            self.result.record(stage, outcome);
        }
    }

    fn aggregate_and_write(
        &mut self,
        stage: Stage,
        product: Product,
        grid: &GridSpec,
        points: &[LidarPoint],
        metric: &CellMetric,
    ) -> Result<Step<()>> {
        let raster = self
            .engine
            .aggregate_grid(points, grid, metric)
            .with_context(|| format!("Failed to aggregate {}", stage))?;
        if raster.is_undefined() {
            return Ok(Step::Empty(format!("{} has no defined cell", stage)));
        }
        self.write(stage, product, &raster)?;
        Ok(Step::Proceed(()))
    }

    /// Shaded relief of every enabled elevation product, read back from disk
    fn hillshades(&mut self) {
        if !self.task.config.hillshade_enabled() {
            return;
        }
        for elevation in Elevation::ALL {
            if !self.elevation_enabled(elevation) {
                continue;
            }
            let stage = Stage::Hillshade(elevation);
            let product = Product::Hillshade(elevation);
            if self.writer.skips(&self.task.tile.name, product) {
                self.result.record(stage, StageOutcome::SkippedExists);
                continue;
            }

            let source = self
                .writer
                .destination(&self.task.tile.name, Product::Elevation(elevation));
            let step = Step::from(self.shade(elevation, &source));
            if let Err(outcome) = step.into_outcome() {
                self.result.record(stage, outcome);
            }
        }
    }

    fn shade(&mut self, elevation: Elevation, source: &Path) -> Result<Step<()>> {
        if !source.is_file() {
            return Ok(Step::Empty(format!("no {} raster to shade", elevation.as_str())));
        }
        let dem = self
            .engine
            .read_raster(source)
            .with_context(|| format!("Failed to read {:?}", source))?;
        let shaded = hillshade(&dem, &HillshadeParams::default());
        if shaded.is_undefined() {
            return Ok(Step::Empty(format!("{} too small to shade", elevation.as_str())));
        }
        self.write(Stage::Hillshade(elevation), Product::Hillshade(elevation), &shaded)?;
        Ok(Step::Proceed(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometric::correction::{CorrectionRaster, GeoidGrid};
    use crate::geometric::engine::GridEngine;
    use anyhow::bail;
    use tempfile::TempDir;

    /// Serves fixed points instead of reading files
    struct MemoryEngine {
        points: Option<Vec<LidarPoint>>,
        rasters_readable: bool,
        inner: GridEngine,
    }

    impl MemoryEngine {
        fn new(points: Vec<LidarPoint>) -> Self {
            MemoryEngine {
                points: Some(points),
                rasters_readable: true,
                inner: GridEngine::default(),
            }
        }

        fn unreadable() -> Self {
            MemoryEngine {
                points: None,
                ..MemoryEngine::new(Vec::new())
            }
        }

        /// Writes rasters but cannot read them back
        fn write_only(points: Vec<LidarPoint>) -> Self {
            MemoryEngine {
                rasters_readable: false,
                ..MemoryEngine::new(points)
            }
        }
    }

    impl RasterEngine for MemoryEngine {
        fn load(&self, _tile: &TileDescriptor) -> Result<Vec<LidarPoint>> {
            match &self.points {
                Some(points) => Ok(points.clone()),
                None => bail!("corrupt header"),
            }
        }

        fn interpolate_surface(&self, points: &[LidarPoint], params: &SurfaceParams) -> Result<Raster> {
            self.inner.interpolate_surface(points, params)
        }

        fn classify_ground(&self, points: &[LidarPoint]) -> Result<Vec<LidarPoint>> {
            self.inner.classify_ground(points)
        }

        fn normalize(&self, points: &[LidarPoint], terrain: &Raster) -> Result<Vec<LidarPoint>> {
            self.inner.normalize(points, terrain)
        }

        fn aggregate_grid(
            &self,
            points: &[LidarPoint],
            grid: &GridSpec,
            metric: &CellMetric,
        ) -> Result<Raster> {
            self.inner.aggregate_grid(points, grid, metric)
        }

        fn write_raster(&self, raster: &Raster, path: &Path) -> Result<()> {
            self.inner.write_raster(raster, path)
        }

        fn read_raster(&self, path: &Path) -> Result<Raster> {
            if !self.rasters_readable {
                bail!("raster store offline");
            }
            self.inner.read_raster(path)
        }
    }

    fn descriptor() -> TileDescriptor {
        TileDescriptor {
            name: "t".to_string(),
            sources: vec!["t.las".into()],
            core_sources: 1,
            extent: Some(BoundingBox::new(0.0, 0.0, 20.0, 20.0)),
            buffer: 0.0,
        }
    }

    /// Ground at 100 everywhere, a 10-unit canopy over the western half
    fn forest() -> Vec<LidarPoint> {
        let mut points = Vec::new();
        for i in 0..40 {
            for j in 0..40 {
                let x = 0.25 + i as f64 * 0.5;
                let y = 0.25 + j as f64 * 0.5;
                if x < 10.0 && (i + j) % 2 == 0 {
                    points.push(LidarPoint::new(x, y, 110.0, 5).with_returns(1, 2));
                } else {
                    points.push(LidarPoint::new(x, y, 100.0, 2));
                }
            }
        }
        points
    }

    fn run(
        engine: &dyn RasterEngine,
        config: &PipelineConfig,
        correction: Option<VerticalCorrection<'_>>,
    ) -> PipelineResult {
        let tile = descriptor();
        let task = TileTask {
            tile: &tile,
            config,
            correction,
        };
        TilePipeline::new(task, engine).run()
    }

    #[test]
    fn test_full_run_writes_every_product() {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::new(dir.path(), "2021");
        config.products.hillshade = true;
        let engine = MemoryEngine::new(forest());

        let result = run(&engine, &config, None);
        assert!(!result.is_failed(), "{:?}", result);
        for stage in [
            Stage::SurfaceModel,
            Stage::CanopyHeightModel,
            Stage::CorrectedTerrainModel,
            Stage::CanopyCover,
            Stage::Density,
            Stage::Hillshade(Elevation::Dsm),
        ] {
            assert_eq!(result.outcome(stage), Some(&StageOutcome::Written), "{}", stage);
        }

        let writer = OutputWriter::new(&config);
        let chm = engine
            .read_raster(&writer.destination("t", Product::Elevation(Elevation::Chm)))
            .unwrap();
        assert_eq!((chm.grid().cols, chm.grid().rows), (20, 20));
        assert!((chm.get(10, 2) - 10.0).abs() < 1e-6);
        assert_eq!(chm.get(10, 15), 0.0);

        let cover = engine
            .read_raster(&writer.destination("t", Product::CanopyCover))
            .unwrap();
        assert!((cover.get(0, 0) - 0.5).abs() < 1e-6);
        assert_eq!(cover.get(0, 1), 0.0);
    }

    #[test]
    fn test_load_outcomes_are_terminal() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path(), "2021");

        let empty = run(&MemoryEngine::new(Vec::new()), &config, None);
        assert_eq!(empty.stage_outcomes.len(), 1);
        assert_eq!(empty.outcome(Stage::Load), Some(&StageOutcome::SkippedEmpty));

        let failed = run(&MemoryEngine::unreadable(), &config, None);
        assert!(failed.is_failed());
        assert!(matches!(
            failed.outcome(Stage::Load),
            Some(StageOutcome::Failed(reason)) if reason.contains("corrupt header")
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_ground_stops_after_surface_model() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path(), "2021");
        // Seeding always finds ground in a non-empty cloud
        struct NoGround(MemoryEngine);
        impl RasterEngine for NoGround {
            fn load(&self, tile: &TileDescriptor) -> Result<Vec<LidarPoint>> {
                self.0.load(tile)
            }
            fn interpolate_surface(&self, p: &[LidarPoint], s: &SurfaceParams) -> Result<Raster> {
                self.0.interpolate_surface(p, s)
            }
            fn classify_ground(&self, _: &[LidarPoint]) -> Result<Vec<LidarPoint>> {
                Ok(Vec::new())
            }
            fn normalize(&self, p: &[LidarPoint], t: &Raster) -> Result<Vec<LidarPoint>> {
                self.0.normalize(p, t)
            }
            fn aggregate_grid(&self, p: &[LidarPoint], g: &GridSpec, m: &CellMetric) -> Result<Raster> {
                self.0.aggregate_grid(p, g, m)
            }
            fn write_raster(&self, r: &Raster, p: &Path) -> Result<()> {
                self.0.write_raster(r, p)
            }
            fn read_raster(&self, p: &Path) -> Result<Raster> {
                self.0.read_raster(p)
            }
        }

        let result = run(&NoGround(MemoryEngine::new(forest())), &config, None);
        assert_eq!(result.outcome(Stage::SurfaceModel), Some(&StageOutcome::Written));
        assert_eq!(result.outcome(Stage::TerrainModel), Some(&StageOutcome::SkippedEmpty));
        assert!(result.outcome(Stage::CanopyHeightModel).is_none());
        assert!(!result.is_failed());
    }

    #[test]
    fn test_correction_moves_dsm_and_dtm_but_not_chm() {
        let engine = MemoryEngine::new(forest());
        let plain_dir = TempDir::new().unwrap();
        let plain_config = PipelineConfig::new(plain_dir.path(), "2021");
        run(&engine, &plain_config, None);

        let corrected_dir = TempDir::new().unwrap();
        let corrected_config = PipelineConfig::new(corrected_dir.path(), "2021");
        let geoid = CorrectionRaster::new(Raster::filled(
            GridSpec::new(-100.0, 100.0, 25.0, 8, 8),
            45.0,
        ));
        let correction = VerticalCorrection::new(&GeoidGrid, &geoid);
        run(&engine, &corrected_config, Some(correction));

        let read = |config: &PipelineConfig, elevation| {
            engine
                .read_raster(&OutputWriter::new(config).destination("t", Product::Elevation(elevation)))
                .unwrap()
        };
        let dsm_shift = read(&corrected_config, Elevation::Dsm).get(5, 5)
            - read(&plain_config, Elevation::Dsm).get(5, 5);
        assert!((dsm_shift - 45.0).abs() < 1e-4);
        let dtm_shift = read(&corrected_config, Elevation::Dtm).get(5, 5)
            - read(&plain_config, Elevation::Dtm).get(5, 5);
        assert!((dtm_shift - 45.0).abs() < 1e-4);
        assert_eq!(
            read(&corrected_config, Elevation::Chm),
            read(&plain_config, Elevation::Chm)
        );
    }

    #[test]
    fn test_disabled_outputs_are_not_written() {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::new(dir.path(), "2021");
        config.products.dsm = false;
        config.metrics.roughness = false;
        config.metrics.density = false;

        let result = run(&MemoryEngine::new(forest()), &config, None);
        assert!(result.outcome(Stage::SurfaceModel).is_none());
        assert!(result.outcome(Stage::Density).is_none());
        assert_eq!(result.outcome(Stage::CanopyHeightModel), Some(&StageOutcome::Written));
        assert!(!dir.path().join("dsm").exists());
    }

    #[test]
    fn test_empty_metric_filter_only_skips_that_metric() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path(), "2021");
        // Every return is a second return: the canopy cover filter keeps nothing
        let points = forest().into_iter().map(|p| p.with_returns(2, 2)).collect();

        let result = run(&MemoryEngine::new(points), &config, None);
        assert_eq!(result.outcome(Stage::CanopyCover), Some(&StageOutcome::SkippedEmpty));
        assert_eq!(result.outcome(Stage::Density), Some(&StageOutcome::Written));
        assert_eq!(result.outcome(Stage::CanopyHeightModel), Some(&StageOutcome::Written));
        assert!(!result.is_failed());
        assert!(!OutputWriter::new(&config)
            .destination("t", Product::CanopyCover)
            .exists());
    }

    #[test]
    fn test_hillshade_failure_keeps_tile_successful() {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::new(dir.path(), "2021");
        config.products.hillshade = true;

        let result = run(&MemoryEngine::write_only(forest()), &config, None);
        assert!(matches!(
            result.outcome(Stage::Hillshade(Elevation::Dsm)),
            Some(StageOutcome::Failed(reason)) if reason.contains("raster store offline")
        ));
        assert_eq!(result.outcome(Stage::SurfaceModel), Some(&StageOutcome::Written));
        assert_eq!(result.outcome(Stage::Density), Some(&StageOutcome::Written));
        assert!(!result.is_failed());
    }

    #[test]
    fn test_points_in_buffer_only_make_an_empty_tile() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path(), "2021");
        let tile = TileDescriptor {
            name: "edge".to_string(),
            sources: vec!["edge.las".into()],
            core_sources: 1,
            extent: Some(BoundingBox::new(0.0, 0.0, 20.0, 20.0)),
            buffer: 10.0,
        };
        // The forest shifted east of the tile, inside its buffer
        let points = forest()
            .into_iter()
            .filter(|p| p.x < 5.0)
            .map(|p| LidarPoint { x: p.x + 22.0, ..p })
            .collect();
        let engine = MemoryEngine::new(points);
        let task = TileTask {
            tile: &tile,
            config: &config,
            correction: None,
        };

        let result = TilePipeline::new(task, &engine).run();
        assert_eq!(result.outcome(Stage::SurfaceModel), Some(&StageOutcome::SkippedEmpty));
        assert_eq!(result.stage_outcomes.len(), 1);
        assert!(!dir.path().join("dsm").exists());
    }
}
