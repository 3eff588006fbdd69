//! Tile catalog: turns a directory of LAS/LAZ files into work units.
//!
//! With `chunk_size == 0` every file is one tile, which is the right mode for
//! data that is already tiled. A non-zero chunk size re-partitions the
//! catalog into aligned squares; applying it to already-tiled input only
//! produces chunks that straddle file boundaries and is a caller error. The
//! catalog does not try to detect or correct it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::collect::global_variables::POINT_CLOUD_EXTENSIONS;
use crate::config::PipelineConfig;
use crate::error::CatalogError;
use crate::geo_core::BoundingBox;
use crate::geometric::lidar::read_header_extent;

/// One unit of work for the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileDescriptor {
    /// File stem, or `{xmin}_{ymin}` of the chunk
    pub name: String,
    /// Files to read. The first `core_sources` overlap the nominal extent;
    /// the rest only contribute buffer points.
    pub sources: Vec<PathBuf>,
    pub core_sources: usize,
    /// Nominal extent, `None` when the header had no usable bounds
    pub extent: Option<BoundingBox>,
    /// Margin loaded around the nominal extent
    pub buffer: f64,
}

impl TileDescriptor {
    pub fn core(&self) -> &[PathBuf] {
        &self.sources[..self.core_sources]
    }

    pub fn neighbours(&self) -> &[PathBuf] {
        &self.sources[self.core_sources..]
    }

    pub fn buffered_extent(&self) -> Option<BoundingBox> {
        self.extent.map(|bbox| bbox.buffered(self.buffer))
    }
}

/// Tiling parameters and directory scanning
#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    chunk_size: f64,
    buffer: f64,
}

struct SourceFile {
    path: PathBuf,
    extent: Option<BoundingBox>,
}

impl Catalog {
    pub fn new(chunk_size: f64, buffer: f64) -> Result<Self, CatalogError> {
        let valid = |v: f64| v.is_finite() && v >= 0.0;
        if !valid(chunk_size) || !valid(buffer) {
            return Err(CatalogError::InvalidTiling { chunk_size, buffer });
        }
        Ok(Catalog { chunk_size, buffer })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, CatalogError> {
        Catalog::new(config.chunk_size, config.buffer)
    }

    pub fn is_file_native(&self) -> bool {
        self.chunk_size == 0.0
    }

    /// List the tiles under `root`. The result is sorted by source path (file
    /// mode) or by chunk position (chunk mode), so a fixed directory listing
    /// always gives the same sequence.
    pub fn enumerate(&self, root: &Path) -> Result<Vec<TileDescriptor>, CatalogError> {
        let files = scan_directory(root)?;
        tracing::info!(
            root = %root.display(),
            files = files.len(),
            chunk_size = self.chunk_size,
            buffer = self.buffer,
            "catalog scanned"
        );

        let tiles = if self.is_file_native() {
            self.file_tiles(&files)
        } else {
            self.chunk_tiles(&files)
        };
        check_unique_names(&tiles)?;
        Ok(tiles)
    }

    fn file_tiles(&self, files: &[SourceFile]) -> Vec<TileDescriptor> {
        files
            .iter()
            .enumerate()
            .map(|(idx, file)| {
                let mut sources = vec![file.path.clone()];
                if let (Some(extent), true) = (file.extent, self.buffer > 0.0) {
                    let buffered = extent.buffered(self.buffer);
                    sources.extend(
                        files
                            .iter()
                            .enumerate()
                            .filter(|(other, _)| *other != idx)
                            .filter(|(_, f)| f.extent.map_or(false, |e| e.intersects(&buffered)))
                            .map(|(_, f)| f.path.clone()),
                    );
                }
                TileDescriptor {
                    name: file_stem(&file.path),
                    sources,
                    core_sources: 1,
                    extent: file.extent,
                    buffer: self.buffer,
                }
            })
            .collect()
    }

    fn chunk_tiles(&self, files: &[SourceFile]) -> Vec<TileDescriptor> {
        let size = self.chunk_size;
        let mut tiles = Vec::new();

        let union = files
            .iter()
            .filter_map(|f| f.extent)
            .reduce(|acc, e| acc.union(&e));

        if let Some(union) = union {
            let x0 = (union.min_x / size).floor() * size;
            let y0 = (union.min_y / size).floor() * size;
            let nx = (((union.max_x - x0) / size).ceil() as usize).max(1);
            let ny = (((union.max_y - y0) / size).ceil() as usize).max(1);

            for iy in 0..ny {
                for ix in 0..nx {
                    let min_x = x0 + ix as f64 * size;
                    let min_y = y0 + iy as f64 * size;
                    let chunk = BoundingBox::new(min_x, min_y, min_x + size, min_y + size);
                    let buffered = chunk.buffered(self.buffer);

                    let (core, neighbours): (Vec<&SourceFile>, Vec<&SourceFile>) = files
                        .iter()
                        .filter(|f| f.extent.map_or(false, |e| e.intersects(&buffered)))
                        .partition(|f| f.extent.map_or(false, |e| e.intersects(&chunk)));
                    if core.is_empty() {
                        continue;
                    }

                    tiles.push(TileDescriptor {
                        name: format!("{}_{}", min_x, min_y),
                        core_sources: core.len(),
                        sources: core
                            .iter()
                            .chain(neighbours.iter())
                            .map(|f| f.path.clone())
                            .collect(),
                        extent: Some(chunk),
                        buffer: self.buffer,
                    });
                }
            }
        }

        // Files that cannot be placed on the chunk grid still get a tile, so
        // their load outcome is reported instead of silently dropped
        for file in files.iter().filter(|f| f.extent.is_none()) {
            tiles.push(TileDescriptor {
                name: file_stem(&file.path),
                sources: vec![file.path.clone()],
                core_sources: 1,
                extent: None,
                buffer: self.buffer,
            });
        }

        tiles
    }
}

/// Output file names derive from the tile name, so two tiles sharing one
/// (`a.las` next to `a.laz`) would overwrite each other.
fn check_unique_names(tiles: &[TileDescriptor]) -> Result<(), CatalogError> {
    let mut seen: BTreeMap<&str, &TileDescriptor> = BTreeMap::new();
    for tile in tiles {
        if let Some(previous) = seen.insert(&tile.name, tile) {
            return Err(CatalogError::DuplicateTile {
                name: tile.name.clone(),
                first: previous.sources.first().cloned().unwrap_or_default(),
                second: tile.sources.first().cloned().unwrap_or_default(),
            });
        }
    }
    Ok(())
}

fn is_point_cloud(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            POINT_CLOUD_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn scan_directory(root: &Path) -> Result<Vec<SourceFile>, CatalogError> {
    if !root.is_dir() {
        return Err(CatalogError::NotADirectory(root.to_path_buf()));
    }
    let entries = std::fs::read_dir(root).map_err(|source| CatalogError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CatalogError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && is_point_cloud(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    Ok(paths
        .into_iter()
        .map(|path| {
            let extent = match read_header_extent(&path) {
                Ok(extent) => extent,
                Err(e) => {
                    tracing::warn!(file = %path.display(), reason = %e, "unreadable LAS header");
                    None
                }
            };
            SourceFile { path, extent }
        })
        .collect())
}
