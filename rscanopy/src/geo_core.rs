use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in the projected CRS of the catalog
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Build a box from header bounds, rejecting the inverted or infinite
    /// bounds written by LAS files without points
    pub fn checked(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Option<Self> {
        let finite = [min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite());
        if finite && min_x <= max_x && min_y <= max_y {
            Some(BoundingBox::new(min_x, min_y, max_x, max_y))
        } else {
            None
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Grow the box by `margin` on every side
    pub fn buffered(&self, margin: f64) -> Self {
        BoundingBox::new(
            self.min_x - margin,
            self.min_y - margin,
            self.max_x + margin,
            self.max_y + margin,
        )
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn union(&self, other: &BoundingBox) -> Self {
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Smallest box holding every coordinate, `None` for an empty iterator
    pub fn enclosing<I>(coords: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        coords.into_iter().fold(None, |acc, (x, y)| {
            let point = BoundingBox::new(x, y, x, y);
            Some(match acc {
                Some(bbox) => bbox.union(&point),
                None => point,
            })
        })
    }
}

/// Regular north-up grid: origin is the upper-left corner, rows go south
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub origin_x: f64,
    pub origin_y: f64,
    pub resolution: f64,
    pub cols: usize,
    pub rows: usize,
}

impl GridSpec {
    pub fn new(origin_x: f64, origin_y: f64, resolution: f64, cols: usize, rows: usize) -> Self {
        GridSpec {
            origin_x,
            origin_y,
            resolution,
            cols,
            rows,
        }
    }

    /// Grid snapped to multiples of `resolution` that covers `bbox`.
    /// Degenerate boxes still get one cell in each direction.
    pub fn aligned(bbox: &BoundingBox, resolution: f64) -> Self {
        let min_x = (bbox.min_x / resolution).floor() * resolution;
        let max_y = (bbox.max_y / resolution).ceil() * resolution;
        let max_x = (bbox.max_x / resolution).ceil() * resolution;
        let min_y = (bbox.min_y / resolution).floor() * resolution;
        let cols = (((max_x - min_x) / resolution).round() as usize).max(1);
        let rows = (((max_y - min_y) / resolution).round() as usize).max(1);
        GridSpec::new(min_x, max_y, resolution, cols, rows)
    }

    pub fn len(&self) -> usize {
        self.cols * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extent(&self) -> BoundingBox {
        BoundingBox::new(
            self.origin_x,
            self.origin_y - self.rows as f64 * self.resolution,
            self.origin_x + self.cols as f64 * self.resolution,
            self.origin_y,
        )
    }

    /// Row and column of the cell holding (x, y). Points on the east or
    /// south edge belong to the last column or row.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !self.extent().contains(x, y) {
            return None;
        }
        let col = ((x - self.origin_x) / self.resolution).floor() as usize;
        let row = ((self.origin_y - y) / self.resolution).floor() as usize;
        Some((row.min(self.rows - 1), col.min(self.cols - 1)))
    }

    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.resolution,
            self.origin_y - (row as f64 + 0.5) * self.resolution,
        )
    }

    pub fn cell_bounds(&self, row: usize, col: usize) -> BoundingBox {
        let min_x = self.origin_x + col as f64 * self.resolution;
        let max_y = self.origin_y - row as f64 * self.resolution;
        BoundingBox::new(min_x, max_y - self.resolution, min_x + self.resolution, max_y)
    }

    /// Fractional (row, col) position of (x, y) measured from cell centers
    pub fn fractional_index(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (self.origin_y - y) / self.resolution - 0.5,
            (x - self.origin_x) / self.resolution - 0.5,
        )
    }
}
