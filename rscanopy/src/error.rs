//! Typed errors surfaced by the public API.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while validating or loading a [`crate::config::PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("Failed to read configuration {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected schema.
    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A numeric option is out of range.
    #[error("Invalid value for `{field}`: {value} ({reason})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// The acquisition year tag cannot be embedded in a file name.
    #[error("Invalid acquisition year tag {0:?}")]
    InvalidYear(String),

    /// The worker pool needs at least one thread.
    #[error("Worker count must be at least 1")]
    NoWorkers,
}

/// Errors raised while scanning the input catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The input root is missing or is not a directory.
    #[error("Input root {0:?} is not a readable directory")]
    NotADirectory(PathBuf),

    /// I/O error listing the input root.
    #[error("Failed to list {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Chunk size or buffer is negative or not finite.
    #[error("Invalid tiling parameters: chunk_size={chunk_size}, buffer={buffer}")]
    InvalidTiling { chunk_size: f64, buffer: f64 },

    /// Two tiles would write to the same output files.
    #[error("Tile name {name:?} is shared by {first:?} and {second:?}")]
    DuplicateTile {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}
