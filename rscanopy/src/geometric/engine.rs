use anyhow::{bail, Result};
use rayon::prelude::*;
use std::path::Path;

use crate::collect::catalog::TileDescriptor;
use crate::collect::global_variables::{GROUND_CLASS, GROUND_SEED_WINDOW};
use crate::geo_core::{BoundingBox, GridSpec};
use crate::geometric::geotiff::{read_geotiff, write_geotiff};
use crate::geometric::lidar::{read_las_points, LidarPoint};
use crate::geometric::metrics::CellMetric;
use crate::geometric::raster::Raster;

/// Which surface a call to [`RasterEngine::interpolate_surface`] builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Uppermost return per cell (DSM, CHM)
    Highest,
    /// Bare-ground surface from ground-classified points, gaps filled
    Terrain,
}

#[derive(Debug, Clone, Copy)]
pub struct SurfaceParams {
    pub kind: SurfaceKind,
    pub resolution: f64,
    /// Area the output grid must cover
    pub extent: BoundingBox,
}

/// Point-cloud and raster capabilities the tile pipeline drives.
///
/// Implementations must be shareable across worker threads; every call works
/// on data owned by the calling tile.
pub trait RasterEngine: Send + Sync {
    fn load(&self, tile: &TileDescriptor) -> Result<Vec<LidarPoint>>;

    fn interpolate_surface(&self, points: &[LidarPoint], params: &SurfaceParams) -> Result<Raster>;

    /// Ground returns of `points`
    fn classify_ground(&self, points: &[LidarPoint]) -> Result<Vec<LidarPoint>>;

    /// Heights relative to `terrain`. Points over undefined terrain are dropped.
    fn normalize(&self, points: &[LidarPoint], terrain: &Raster) -> Result<Vec<LidarPoint>>;

    fn aggregate_grid(
        &self,
        points: &[LidarPoint],
        grid: &GridSpec,
        metric: &CellMetric,
    ) -> Result<Raster>;

    fn write_raster(&self, raster: &Raster, path: &Path) -> Result<()>;

    fn read_raster(&self, path: &Path) -> Result<Raster>;
}

/// Native engine: LAS/LAZ loading, per-cell binning with neighbour gap
/// filling, Float32 GeoTIFF output
#[derive(Debug, Clone, Default)]
pub struct GridEngine {
    epsg: Option<u16>,
}

impl GridEngine {
    pub fn new(epsg: Option<u16>) -> Self {
        GridEngine { epsg }
    }

    fn bin_extremes(points: &[LidarPoint], grid: &GridSpec, keep_highest: bool) -> Raster {
        let mut raster = Raster::empty(*grid);
        for point in points {
            if let Some((row, col)) = grid.cell_of(point.x, point.y) {
                let current = raster.get(row, col);
                let replace = current.is_nan()
                    || (keep_highest && point.z > current)
                    || (!keep_highest && point.z < current);
                if replace {
                    raster.set(row, col, point.z);
                }
            }
        }
        raster
    }

    /// Fill holes from their defined edge neighbours, falling back to the
    /// diagonals, until every cell is defined. Each pass reads the previous
    /// one, so the result does not depend on scan order. A raster with no
    /// defined cell is returned as is.
    fn fill_gaps(mut raster: Raster) -> Raster {
        let grid = *raster.grid();
        while raster.valid_count() < grid.len() {
            let previous = raster.clone();
            let mut changed = false;
            for row in 0..grid.rows {
                for col in 0..grid.cols {
                    if previous.is_defined(row, col) {
                        continue;
                    }
                    let mean = |offsets: &[(i64, i64)]| {
                        let values: Vec<f64> = offsets
                            .iter()
                            .filter_map(|&(dr, dc)| {
                                let r = row as i64 + dr;
                                let c = col as i64 + dc;
                                if r < 0 || c < 0 || r >= grid.rows as i64 || c >= grid.cols as i64 {
                                    return None;
                                }
                                let v = previous.get(r as usize, c as usize);
                                (!v.is_nan()).then_some(v)
                            })
                            .collect();
                        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
                    };
                    let fill = mean(&[(-1, 0), (1, 0), (0, -1), (0, 1)])
                        .or_else(|| mean(&[(-1, -1), (-1, 1), (1, -1), (1, 1)]));
                    if let Some(value) = fill {
                        raster.set(row, col, value);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        raster
    }
}

impl RasterEngine for GridEngine {
    fn load(&self, tile: &TileDescriptor) -> Result<Vec<LidarPoint>> {
        let filter = tile.buffered_extent();
        let mut points = Vec::new();
        for source in tile.core() {
            points.extend(read_las_points(source, filter.as_ref())?);
        }
        for source in tile.neighbours() {
            match read_las_points(source, filter.as_ref()) {
                Ok(buffer_points) => points.extend(buffer_points),
                Err(e) => tracing::warn!(
                    tile = %tile.name,
                    neighbour = %source.display(),
                    reason = %e,
                    "buffer points unavailable"
                ),
            }
        }
        Ok(points)
    }

    fn interpolate_surface(&self, points: &[LidarPoint], params: &SurfaceParams) -> Result<Raster> {
        if !(params.resolution > 0.0) {
            bail!("Surface resolution must be positive, got {}", params.resolution);
        }
        let grid = GridSpec::aligned(&params.extent, params.resolution);
        Ok(match params.kind {
            SurfaceKind::Highest => Self::bin_extremes(points, &grid, true),
            SurfaceKind::Terrain => Self::fill_gaps(Self::bin_extremes(points, &grid, false)),
        })
    }

    fn classify_ground(&self, points: &[LidarPoint]) -> Result<Vec<LidarPoint>> {
        let ground: Vec<LidarPoint> = points.iter().filter(|p| p.is_ground()).copied().collect();
        if !ground.is_empty() {
            return Ok(ground);
        }

        // Unclassified tile: the lowest return of every seed window
        let Some(extent) = BoundingBox::enclosing(points.iter().map(|p| (p.x, p.y))) else {
            return Ok(Vec::new());
        };
        let grid = GridSpec::aligned(&extent, GROUND_SEED_WINDOW);
        let mut lowest: Vec<Option<LidarPoint>> = vec![None; grid.len()];
        for point in points {
            if let Some((row, col)) = grid.cell_of(point.x, point.y) {
                let slot = &mut lowest[row * grid.cols + col];
                if slot.map_or(true, |current| point.z < current.z) {
                    *slot = Some(*point);
                }
            }
        }
        Ok(lowest
            .into_iter()
            .flatten()
            .map(|p| LidarPoint {
                classification: GROUND_CLASS,
                ..p
            })
            .collect())
    }

    fn normalize(&self, points: &[LidarPoint], terrain: &Raster) -> Result<Vec<LidarPoint>> {
        Ok(points
            .par_iter()
            .filter_map(|p| {
                terrain
                    .sample_bilinear(p.x, p.y)
                    .map(|ground| LidarPoint { z: p.z - ground, ..*p })
            })
            .collect())
    }

    fn aggregate_grid(
        &self,
        points: &[LidarPoint],
        grid: &GridSpec,
        metric: &CellMetric,
    ) -> Result<Raster> {
        let mut bins: Vec<Vec<LidarPoint>> = vec![Vec::new(); grid.len()];
        for point in points {
            if let Some((row, col)) = grid.cell_of(point.x, point.y) {
                bins[row * grid.cols + col].push(*point);
            }
        }

        let values: Vec<f64> = bins
            .par_iter()
            .enumerate()
            .map(|(idx, bin)| {
                if bin.is_empty() {
                    return f64::NAN;
                }
                let cell = grid.cell_bounds(idx / grid.cols, idx % grid.cols);
                metric(bin, &cell).unwrap_or(f64::NAN)
            })
            .collect();

        match Raster::from_vec(*grid, values) {
            Some(raster) => Ok(raster),
            None => bail!("Aggregated values do not match the grid size"),
        }
    }

    fn write_raster(&self, raster: &Raster, path: &Path) -> Result<()> {
        write_geotiff(raster, path, self.epsg)
    }

    fn read_raster(&self, path: &Path) -> Result<Raster> {
        read_geotiff(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometric::metrics::fraction_above;
    use approx::assert_relative_eq;

    fn params(kind: SurfaceKind) -> SurfaceParams {
        SurfaceParams {
            kind,
            resolution: 1.0,
            extent: BoundingBox::new(0.0, 0.0, 4.0, 4.0),
        }
    }

    #[test]
    fn test_highest_surface_keeps_max() {
        let points = vec![
            LidarPoint::new(0.5, 3.5, 10.0, 2),
            LidarPoint::new(0.6, 3.4, 18.0, 5),
            LidarPoint::new(3.5, 0.5, 11.0, 2),
        ];
        let dsm = GridEngine::default()
            .interpolate_surface(&points, &params(SurfaceKind::Highest))
            .unwrap();
        assert_eq!(dsm.get(0, 0), 18.0);
        assert_eq!(dsm.get(3, 3), 11.0);
        assert_eq!(dsm.valid_count(), 2);
    }

    #[test]
    fn test_terrain_fills_holes() {
        // Ground on every other cell of a tilted plane
        let mut points = Vec::new();
        for row in 0..4 {
            for col in 0..4 {
                if (row + col) % 2 == 0 {
                    let x = col as f64 + 0.5;
                    points.push(LidarPoint::new(x, 3.5 - row as f64, 100.0 + x, 2));
                }
            }
        }
        let dtm = GridEngine::default()
            .interpolate_surface(&points, &params(SurfaceKind::Terrain))
            .unwrap();
        assert_eq!(dtm.valid_count(), 16);
        // Interior hole: mean of left/right/up/down neighbours stays on the plane
        assert_relative_eq!(dtm.get(1, 2), 102.5);
    }

    #[test]
    fn test_terrain_covers_wide_canopy_gaps() {
        // Ground only in a 5-unit ring around a 30 x 30 patch of canopy
        let mut points = Vec::new();
        for row in 0..40 {
            for col in 0..40 {
                let ring = row < 5 || col < 5 || row >= 35 || col >= 35;
                let (x, y) = (col as f64 + 0.5, 39.5 - row as f64);
                if ring {
                    points.push(LidarPoint::new(x, y, 100.0, 2));
                } else {
                    points.push(LidarPoint::new(x, y, 120.0, 5));
                }
            }
        }
        let ground = GridEngine::default().classify_ground(&points).unwrap();
        let params = SurfaceParams {
            kind: SurfaceKind::Terrain,
            resolution: 1.0,
            extent: BoundingBox::new(0.0, 0.0, 40.0, 40.0),
        };
        let dtm = GridEngine::default().interpolate_surface(&ground, &params).unwrap();
        assert_eq!(dtm.valid_count(), 1600);
        assert_relative_eq!(dtm.get(20, 20), 100.0);

        let normalized = GridEngine::default().normalize(&points, &dtm).unwrap();
        assert_eq!(normalized.len(), points.len());
        assert!(normalized
            .iter()
            .filter(|p| !p.is_ground())
            .all(|p| (p.z - 20.0).abs() < 1e-9));
    }

    #[test]
    fn test_terrain_without_ground_stays_undefined() {
        let dtm = GridEngine::default()
            .interpolate_surface(&[], &params(SurfaceKind::Terrain))
            .unwrap();
        assert!(dtm.is_undefined());
    }

    #[test]
    fn test_classify_ground_prefers_existing_classes() {
        let engine = GridEngine::default();
        let points = vec![
            LidarPoint::new(0.5, 0.5, 100.0, 2),
            LidarPoint::new(0.7, 0.5, 120.0, 5),
        ];
        assert_eq!(engine.classify_ground(&points).unwrap().len(), 1);

        let unclassified = vec![
            LidarPoint::new(0.5, 0.5, 104.0, 1),
            LidarPoint::new(1.0, 1.0, 101.0, 1),
            LidarPoint::new(7.0, 7.0, 99.0, 1),
        ];
        let ground = engine.classify_ground(&unclassified).unwrap();
        assert_eq!(ground.len(), 2);
        assert!(ground.iter().all(|p| p.is_ground()));
        assert!(ground.iter().any(|p| p.z == 101.0));
    }

    #[test]
    fn test_normalize_drops_points_without_terrain() {
        let mut terrain = Raster::filled(GridSpec::new(0.0, 2.0, 1.0, 2, 2), 100.0);
        terrain.set(1, 1, f64::NAN);
        let points = vec![
            LidarPoint::new(0.5, 1.5, 112.0, 5),
            LidarPoint::new(1.5, 0.5, 112.0, 5),
            LidarPoint::new(9.0, 9.0, 112.0, 5),
        ];
        let normalized = GridEngine::default().normalize(&points, &terrain).unwrap();
        assert_eq!(normalized.len(), 1);
        assert_relative_eq!(normalized[0].z, 12.0);
    }

    #[test]
    fn test_aggregate_grid_leaves_empty_cells_undefined() {
        let grid = GridSpec::new(0.0, 20.0, 10.0, 2, 2);
        let points = vec![
            LidarPoint::new(1.0, 19.0, 0.5, 5),
            LidarPoint::new(2.0, 18.0, 3.0, 5),
            LidarPoint::new(15.0, 5.0, 4.0, 5),
        ];
        let metric = |pts: &[LidarPoint], _: &BoundingBox| fraction_above(pts, 2.0);
        let raster = GridEngine::default()
            .aggregate_grid(&points, &grid, &metric)
            .unwrap();
        assert_eq!(raster.get(0, 0), 0.5);
        assert!(raster.get(0, 1).is_nan());
        assert_eq!(raster.get(1, 1), 1.0);
    }
}
