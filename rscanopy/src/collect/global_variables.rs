/// Cell size of DSM, DTM and CHM when the configuration omits it
pub const DEFAULT_RESOLUTION: f64 = 1.0;

/// Cell size of the structural metrics when the configuration omits it
pub const DEFAULT_METRIC_RESOLUTION: f64 = 10.0;

/// Margin loaded around each tile
pub const DEFAULT_BUFFER: f64 = 10.0;

pub const DEFAULT_WORKERS: usize = 4;

/// Extensions recognised as point-cloud tiles (compared case-insensitively)
pub const POINT_CLOUD_EXTENSIONS: [&str; 2] = ["las", "laz"];

/// ASPRS class code of ground returns
pub const GROUND_CLASS: u8 = 2;

/// Window used to pick ground seeds when a tile carries no ground class
pub const GROUND_SEED_WINDOW: f64 = 5.0;

/// Vertical tolerance below the local surface top kept for the roughness index
pub const SURFACE_TOP_TOLERANCE: f64 = 0.5;

/// Normalized height above which a first return counts as canopy
pub const CANOPY_COVER_THRESHOLD: f64 = 1.0;

/// Normalized height above which a return counts for the density metric
pub const DENSITY_THRESHOLD: f64 = 2.0;

/// Sub-cells per metric cell edge used to build the rumple surface
pub const RUMPLE_SUBDIVISIONS: usize = 4;
