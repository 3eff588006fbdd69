//! Per-cell structural metrics aggregated by [`super::engine::RasterEngine::aggregate_grid`].

use crate::collect::global_variables::RUMPLE_SUBDIVISIONS;
use crate::geo_core::BoundingBox;
use crate::geometric::lidar::LidarPoint;

/// Function reducing the points of one grid cell to a value.
/// `None` leaves the cell undefined.
pub type CellMetric = dyn Fn(&[LidarPoint], &BoundingBox) -> Option<f64> + Send + Sync;

/// Share of `points` strictly above `threshold`
pub fn fraction_above(points: &[LidarPoint], threshold: f64) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    let above = points.iter().filter(|p| p.z > threshold).count();
    Some(above as f64 / points.len() as f64)
}

/// Rumple index of a cell: area of the triangulated top surface divided by
/// its planar footprint.
///
/// The cell is split into `RUMPLE_SUBDIVISIONS`² sub-cells holding the
/// highest point; every square of four defined sub-cell centers contributes
/// two triangles. Cells without such a square are undefined. A flat surface
/// yields exactly 1.
pub fn rumple_index(points: &[LidarPoint], cell: &BoundingBox) -> Option<f64> {
    let n = RUMPLE_SUBDIVISIONS;
    let step = cell.width() / n as f64;
    if points.is_empty() || !(step > 0.0) {
        return None;
    }

    let mut top = vec![f64::NAN; n * n];
    for p in points {
        let col = (((p.x - cell.min_x) / step).floor().max(0.0) as usize).min(n - 1);
        let row = (((cell.max_y - p.y) / step).floor().max(0.0) as usize).min(n - 1);
        let slot = &mut top[row * n + col];
        if slot.is_nan() || p.z > *slot {
            *slot = p.z;
        }
    }

    let mut surface = 0.0;
    let mut planar = 0.0;
    for row in 0..n - 1 {
        for col in 0..n - 1 {
            let z00 = top[row * n + col];
            let z01 = top[row * n + col + 1];
            let z10 = top[(row + 1) * n + col];
            let z11 = top[(row + 1) * n + col + 1];
            if [z00, z01, z10, z11].iter().any(|z| z.is_nan()) {
                continue;
            }
            let a = [0.0, 0.0, z00];
            let b = [step, 0.0, z01];
            let c = [0.0, step, z10];
            let d = [step, step, z11];
            surface += triangle_area(a, b, d) + triangle_area(a, d, c);
            planar += step * step;
        }
    }

    (planar > 0.0).then(|| surface / planar)
}

fn triangle_area(a: [f64; 3], b: [f64; 3], c: [f64; 3]) -> f64 {
    let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let cross = [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ];
    0.5 * (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt()
}
