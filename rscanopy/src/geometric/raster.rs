use crate::geo_core::{BoundingBox, GridSpec};

/// Single-band floating point raster, row-major, `NaN` for undefined cells
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    grid: GridSpec,
    data: Vec<f64>,
}

impl Raster {
    /// Raster with every cell undefined
    pub fn empty(grid: GridSpec) -> Self {
        Raster {
            grid,
            data: vec![f64::NAN; grid.len()],
        }
    }

    pub fn filled(grid: GridSpec, value: f64) -> Self {
        Raster {
            grid,
            data: vec![value; grid.len()],
        }
    }

    /// Returns `None` when `data` does not match the grid size
    pub fn from_vec(grid: GridSpec, data: Vec<f64>) -> Option<Self> {
        (data.len() == grid.len()).then_some(Raster { grid, data })
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.grid.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        let cols = self.grid.cols;
        self.data[row * cols + col] = value;
    }

    pub fn is_defined(&self, row: usize, col: usize) -> bool {
        !self.get(row, col).is_nan()
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// True when no cell carries a value
    pub fn is_undefined(&self) -> bool {
        self.data.iter().all(|v| v.is_nan())
    }

    /// Value of the cell holding (x, y), `None` outside the grid or on an
    /// undefined cell
    pub fn value_at(&self, x: f64, y: f64) -> Option<f64> {
        let (row, col) = self.grid.cell_of(x, y)?;
        let value = self.get(row, col);
        (!value.is_nan()).then_some(value)
    }

    /// Bilinear interpolation between the four surrounding cell centers.
    /// Positions within half a cell of the border are clamped to the edge
    /// cells. Falls back to the holding cell when a neighbour is undefined.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> Option<f64> {
        if !self.grid.extent().contains(x, y) {
            return None;
        }
        let (fr, fc) = self.grid.fractional_index(x, y);
        let max_row = (self.grid.rows - 1) as f64;
        let max_col = (self.grid.cols - 1) as f64;
        let fr = fr.clamp(0.0, max_row);
        let fc = fc.clamp(0.0, max_col);

        let r0 = fr.floor() as usize;
        let c0 = fc.floor() as usize;
        let r1 = (r0 + 1).min(self.grid.rows - 1);
        let c1 = (c0 + 1).min(self.grid.cols - 1);
        let dr = fr - r0 as f64;
        let dc = fc - c0 as f64;

        let v00 = self.get(r0, c0);
        let v01 = self.get(r0, c1);
        let v10 = self.get(r1, c0);
        let v11 = self.get(r1, c1);

        if [v00, v01, v10, v11].iter().any(|v| v.is_nan()) {
            return self.value_at(x, y);
        }

        Some(
            v00 * (1.0 - dr) * (1.0 - dc)
                + v01 * (1.0 - dr) * dc
                + v10 * dr * (1.0 - dc)
                + v11 * dr * dc,
        )
    }

    /// Cell-wise sum with a raster on the same grid. Undefined in either
    /// operand gives undefined.
    pub fn add(&self, other: &Raster) -> Raster {
        debug_assert_eq!(self.grid, other.grid);
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Raster {
            grid: self.grid,
            data,
        }
    }

    /// Undefine every cell that is undefined in `footprint`. Cells are
    /// matched by position, so grids of different shape are matched through
    /// cell centers.
    pub fn mask_to(&self, footprint: &Raster) -> Raster {
        let mut masked = self.clone();
        if self.grid == footprint.grid {
            for (value, mask) in masked.data.iter_mut().zip(&footprint.data) {
                if mask.is_nan() {
                    *value = f64::NAN;
                }
            }
            return masked;
        }
        for row in 0..self.grid.rows {
            for col in 0..self.grid.cols {
                let (x, y) = self.grid.cell_center(row, col);
                if footprint.value_at(x, y).is_none() {
                    masked.set(row, col, f64::NAN);
                }
            }
        }
        masked
    }

    /// Sub-raster covering `bbox`, snapped outwards to whole cells
    pub fn crop(&self, bbox: &BoundingBox) -> Raster {
        let res = self.grid.resolution;
        let col_start = ((bbox.min_x - self.grid.origin_x) / res).floor().max(0.0) as usize;
        let col_end = (((bbox.max_x - self.grid.origin_x) / res).ceil() as usize).min(self.grid.cols);
        let row_start = ((self.grid.origin_y - bbox.max_y) / res).floor().max(0.0) as usize;
        let row_end = (((self.grid.origin_y - bbox.min_y) / res).ceil() as usize).min(self.grid.rows);

        let col_start = col_start.min(col_end.saturating_sub(1));
        let row_start = row_start.min(row_end.saturating_sub(1));
        let cols = (col_end - col_start).max(1);
        let rows = (row_end - row_start).max(1);

        let grid = GridSpec::new(
            self.grid.origin_x + col_start as f64 * res,
            self.grid.origin_y - row_start as f64 * res,
            res,
            cols,
            rows,
        );
        let mut data = Vec::with_capacity(grid.len());
        for row in row_start..row_start + rows {
            for col in col_start..col_start + cols {
                data.push(self.get(row, col));
            }
        }
        Raster { grid, data }
    }

    /// Apply `f` to every defined cell
    pub fn map_defined(&self, f: impl Fn(f64) -> f64) -> Raster {
        Raster {
            grid: self.grid,
            data: self
                .data
                .iter()
                .map(|&v| if v.is_nan() { v } else { f(v) })
                .collect(),
        }
    }
}
