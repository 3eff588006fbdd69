use std::f64::consts::{FRAC_PI_2, PI};

use crate::geometric::raster::Raster;

/// Illumination of the shaded relief
#[derive(Debug, Clone, Copy)]
pub struct HillshadeParams {
    /// Sun azimuth in degrees clockwise from north
    pub azimuth: f64,
    /// Sun altitude in degrees above the horizon
    pub altitude: f64,
    pub z_factor: f64,
}

impl Default for HillshadeParams {
    fn default() -> Self {
        HillshadeParams {
            azimuth: 315.0,
            altitude: 45.0,
            z_factor: 1.0,
        }
    }
}

/// Slope and aspect in radians, aspect measured the ESRI way
#[derive(Debug, Clone)]
pub struct TerrainDerivatives {
    pub slope: Raster,
    pub aspect: Raster,
}

/// Horn's 3x3 gradient. Border cells and cells next to a hole are undefined.
pub fn slope_aspect(dem: &Raster, z_factor: f64) -> TerrainDerivatives {
    let grid = *dem.grid();
    let mut slope = Raster::empty(grid);
    let mut aspect = Raster::empty(grid);
    if grid.rows < 3 || grid.cols < 3 {
        return TerrainDerivatives { slope, aspect };
    }

    let res = grid.resolution;
    for row in 1..grid.rows - 1 {
        for col in 1..grid.cols - 1 {
            let w = |dr: usize, dc: usize| dem.get(row + dr - 1, col + dc - 1);
            let (a, b, c) = (w(0, 0), w(0, 1), w(0, 2));
            let (d, f) = (w(1, 0), w(1, 2));
            let (g, h, i) = (w(2, 0), w(2, 1), w(2, 2));
            if [a, b, c, d, dem.get(row, col), f, g, h, i]
                .iter()
                .any(|v| v.is_nan())
            {
                continue;
            }

            let dzdx = ((c + 2.0 * f + i) - (a + 2.0 * d + g)) / (8.0 * res);
            let dzdy = ((g + 2.0 * h + i) - (a + 2.0 * b + c)) / (8.0 * res);

            let s = (z_factor * (dzdx * dzdx + dzdy * dzdy).sqrt()).atan();
            let asp = if dzdx != 0.0 {
                let raw = dzdy.atan2(-dzdx);
                if raw < 0.0 {
                    raw + 2.0 * PI
                } else {
                    raw
                }
            } else if dzdy > 0.0 {
                FRAC_PI_2
            } else if dzdy < 0.0 {
                2.0 * PI - FRAC_PI_2
            } else {
                0.0
            };

            slope.set(row, col, s);
            aspect.set(row, col, asp);
        }
    }

    TerrainDerivatives { slope, aspect }
}

/// Shaded relief in [0, 255]
pub fn hillshade(dem: &Raster, params: &HillshadeParams) -> Raster {
    let TerrainDerivatives { slope, aspect } = slope_aspect(dem, params.z_factor);

    let zenith = (90.0 - params.altitude).to_radians();
    let azimuth_math = ((360.0 - params.azimuth + 90.0) % 360.0).to_radians();

    let mut shade = Raster::empty(*dem.grid());
    for (idx, (&s, &asp)) in slope.data().iter().zip(aspect.data()).enumerate() {
        if s.is_nan() || asp.is_nan() {
            continue;
        }
        let value = 255.0
            * (zenith.cos() * s.cos() + zenith.sin() * s.sin() * (azimuth_math - asp).cos());
        let row = idx / dem.grid().cols;
        let col = idx % dem.grid().cols;
        shade.set(row, col, value.max(0.0));
    }
    shade
}
