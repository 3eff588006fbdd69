use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::Path;

use crate::collect::global_variables::GROUND_CLASS;
use crate::geo_core::BoundingBox;

/// Point structure for LiDAR data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LidarPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub classification: u8,
    pub return_number: u8,
    pub number_of_returns: u8,
}

impl LidarPoint {
    pub fn new(x: f64, y: f64, z: f64, classification: u8) -> Self {
        LidarPoint {
            x,
            y,
            z,
            classification,
            return_number: 1,
            number_of_returns: 1,
        }
    }

    pub fn with_returns(mut self, return_number: u8, number_of_returns: u8) -> Self {
        self.return_number = return_number;
        self.number_of_returns = number_of_returns;
        self
    }

    pub fn is_ground(&self) -> bool {
        self.classification == GROUND_CLASS
    }

    pub fn is_first_return(&self) -> bool {
        self.return_number == 1
    }
}

/// Map las classification enum to u8 (for parallel conversion).
#[inline]
fn classification_to_u8(c: &las::point::Classification) -> u8 {
    match c {
        las::point::Classification::CreatedNeverClassified => 0,
        las::point::Classification::Unclassified => 1,
        las::point::Classification::Ground => 2,
        las::point::Classification::LowVegetation => 3,
        las::point::Classification::MediumVegetation => 4,
        las::point::Classification::HighVegetation => 5,
        las::point::Classification::Building => 6,
        las::point::Classification::LowPoint => 7,
        las::point::Classification::ModelKeyPoint => 8,
        las::point::Classification::Water => 9,
        _ => 1,
    }
}

/// Read the header extent of a LAS/LAZ file without decoding its points.
/// Files without points report `None`.
pub fn read_header_extent(path: &Path) -> Result<Option<BoundingBox>> {
    let reader = las::Reader::from_path(path)
        .with_context(|| format!("Failed to open LAS header of {:?}", path))?;
    let header = reader.header();
    if header.number_of_points() == 0 {
        return Ok(None);
    }
    let bounds = header.bounds();
    Ok(BoundingBox::checked(
        bounds.min.x,
        bounds.min.y,
        bounds.max.x,
        bounds.max.y,
    ))
}

/// Decode every point of a LAS/LAZ file, keeping those inside `filter_bbox`.
/// A single undecodable point fails the whole file.
pub fn read_las_points(path: &Path, filter_bbox: Option<&BoundingBox>) -> Result<Vec<LidarPoint>> {
    let mut reader = las::Reader::from_path(path)
        .with_context(|| format!("Failed to create LAS reader for {:?}", path))?;

    let point_count = reader.header().number_of_points() as usize;
    let mut raw_points: Vec<las::Point> = Vec::with_capacity(point_count);
    for point_result in reader.points() {
        let point = point_result.with_context(|| format!("Corrupt point record in {:?}", path))?;
        raw_points.push(point);
    }

    let in_bbox = |point: &las::Point| filter_bbox.map_or(true, |bbox| bbox.contains(point.x, point.y));

    let file_points: Vec<LidarPoint> = raw_points
        .par_iter()
        .filter(|point| in_bbox(point))
        .map(|point| LidarPoint {
            x: point.x,
            y: point.y,
            z: point.z,
            classification: classification_to_u8(&point.classification),
            return_number: point.return_number,
            number_of_returns: point.number_of_returns,
        })
        .collect();

    tracing::debug!(
        file = %path.display(),
        decoded = raw_points.len(),
        kept = file_points.len(),
        "points loaded"
    );

    Ok(file_points)
}

/// Buffered point set of one tile.
///
/// Owned by the pipeline run of that tile and dropped with it. Never empty:
/// [`PointCloudChunk::new`] refuses a zero-point set.
#[derive(Debug, Clone)]
pub struct PointCloudChunk {
    tile_name: String,
    points: Vec<LidarPoint>,
    nominal: BoundingBox,
    buffered: BoundingBox,
}

impl PointCloudChunk {
    /// Wrap the loaded points. When the descriptor had no usable extent the
    /// nominal extent is the envelope of the points themselves.
    pub fn new(
        tile_name: impl Into<String>,
        points: Vec<LidarPoint>,
        nominal: Option<BoundingBox>,
        buffer: f64,
    ) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let nominal = match nominal {
            Some(bbox) => bbox,
            None => BoundingBox::enclosing(points.iter().map(|p| (p.x, p.y)))?,
        };
        Some(PointCloudChunk {
            tile_name: tile_name.into(),
            points,
            nominal,
            buffered: nominal.buffered(buffer),
        })
    }

    pub fn tile_name(&self) -> &str {
        &self.tile_name
    }

    pub fn points(&self) -> &[LidarPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn nominal(&self) -> &BoundingBox {
        &self.nominal
    }

    pub fn buffered(&self) -> &BoundingBox {
        &self.buffered
    }
}
