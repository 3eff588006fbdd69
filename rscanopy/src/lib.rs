pub mod collect;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod geometric;
pub mod pipeline;

pub use config::PipelineConfig;
pub use pipeline::{process_directory, PipelineResult, RunSummary};
