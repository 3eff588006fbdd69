pub mod correction;
pub mod engine;
pub mod geotiff;
pub mod hillshade;
pub mod lidar;
pub mod metrics;
pub mod raster;
