use anyhow::{Context, Result};
use std::path::Path;

use crate::geo_core::GridSpec;
use crate::geometric::geotiff::read_geotiff;
use crate::geometric::raster::Raster;

/// Vertical offset grid converting ellipsoidal to orthometric heights.
/// Loaded once per run and only ever read.
#[derive(Debug, Clone)]
pub struct CorrectionRaster {
    offsets: Raster,
}

impl CorrectionRaster {
    pub fn new(offsets: Raster) -> Self {
        CorrectionRaster { offsets }
    }

    pub fn offsets(&self) -> &Raster {
        &self.offsets
    }
}

/// Source of vertical corrections
pub trait CorrectionProvider: Send + Sync {
    fn load(&self, path: &Path) -> Result<CorrectionRaster>;

    /// Correction aligned on `target`. Cells the correction does not cover
    /// are undefined.
    fn resample(&self, correction: &CorrectionRaster, target: &GridSpec) -> Raster;
}

/// Geoid grid stored as a GeoTIFF, resampled bilinearly
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoidGrid;

impl CorrectionProvider for GeoidGrid {
    fn load(&self, path: &Path) -> Result<CorrectionRaster> {
        let offsets = read_geotiff(path)
            .with_context(|| format!("Failed to load vertical correction grid {:?}", path))?;
        tracing::info!(
            path = %path.display(),
            cols = offsets.grid().cols,
            rows = offsets.grid().rows,
            resolution = offsets.grid().resolution,
            "vertical correction grid loaded"
        );
        Ok(CorrectionRaster::new(offsets))
    }

    fn resample(&self, correction: &CorrectionRaster, target: &GridSpec) -> Raster {
        let mut aligned = Raster::empty(*target);
        for row in 0..target.rows {
            for col in 0..target.cols {
                let (x, y) = target.cell_center(row, col);
                if let Some(offset) = correction.offsets().sample_bilinear(x, y) {
                    aligned.set(row, col, offset);
                }
            }
        }
        aligned
    }
}

/// A loaded correction together with the provider that resamples it
#[derive(Clone, Copy)]
pub struct VerticalCorrection<'a> {
    provider: &'a dyn CorrectionProvider,
    raster: &'a CorrectionRaster,
}

impl<'a> VerticalCorrection<'a> {
    pub fn new(provider: &'a dyn CorrectionProvider, raster: &'a CorrectionRaster) -> Self {
        VerticalCorrection { provider, raster }
    }

    /// Resample onto the grid of `heights` and add
    pub fn apply(&self, heights: &Raster) -> Raster {
        let offsets = self.provider.resample(self.raster, heights.grid());
        heights.add(&offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometric::geotiff::write_geotiff;
    use approx::assert_relative_eq;

    #[test]
    fn test_resample_linear_field() {
        // Offset grows 1 unit per 10 units of x, sampled on a 10-unit grid
        let coarse = GridSpec::new(0.0, 100.0, 10.0, 10, 10);
        let data = (0..100).map(|i| (i % 10) as f64).collect();
        let correction = CorrectionRaster::new(Raster::from_vec(coarse, data).unwrap());

        let target = GridSpec::new(20.0, 80.0, 1.0, 20, 20);
        let aligned = GeoidGrid.resample(&correction, &target);
        assert_eq!(aligned.valid_count(), 400);
        // Cell center x = 20.5 lies 0.05 coarse cells past the center of column 1
        assert_relative_eq!(aligned.get(0, 0), 1.55, epsilon = 1e-12);
    }

    #[test]
    fn test_uncovered_cells_are_undefined() {
        let correction =
            CorrectionRaster::new(Raster::filled(GridSpec::new(0.0, 10.0, 5.0, 2, 2), 40.0));
        let target = GridSpec::new(5.0, 10.0, 5.0, 2, 1);
        let aligned = GeoidGrid.resample(&correction, &target);
        assert_eq!(aligned.get(0, 0), 40.0);
        assert!(aligned.get(0, 1).is_nan());
    }

    #[test]
    fn test_apply_adds_offsets() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("geoid.tif");
        write_geotiff(
            &Raster::filled(GridSpec::new(-100.0, 100.0, 50.0, 4, 4), 43.5),
            &path,
            None,
        )
        .unwrap();

        let provider = GeoidGrid;
        let loaded = provider.load(&path).unwrap();
        let correction = VerticalCorrection::new(&provider, &loaded);
        let heights = Raster::filled(GridSpec::new(0.0, 10.0, 1.0, 10, 10), 100.0);
        let corrected = correction.apply(&heights);
        assert_relative_eq!(corrected.get(5, 5), 143.5);
        assert_eq!(corrected.valid_count(), 100);
    }
}
