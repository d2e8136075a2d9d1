//! Image records as they appear in a corpus or query manifest.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::ImageId;

/// Axis-aligned crop region in pixel coordinates, `[x1, y1, x2, y2]`.
///
/// Query images of the Revisited Oxford/Paris benchmarks carry one of these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Creates a bounding box from corner coordinates.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Creates a bounding box from the `[x1, y1, x2, y2]` layout used in dataset files.
    pub fn from_corners(corners: [f32; 4]) -> Self {
        Self::new(corners[0], corners[1], corners[2], corners[3])
    }

    /// Rounds the box to whole pixels and clamps it to an image of the given size.
    ///
    /// Returns `(x, y, width, height)`, or `None` when nothing of the box
    /// remains inside the image.
    pub fn to_pixel_region(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp_x = |v: f32| v.round().clamp(0.0, image_width as f32) as u32;
        let clamp_y = |v: f32| v.round().clamp(0.0, image_height as f32) as u32;

        let (x1, x2) = (clamp_x(self.x1), clamp_x(self.x2));
        let (y1, y2) = (clamp_y(self.y1), clamp_y(self.y2));

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// An image to embed: identifier, location on disk and optional crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Identifier from the manifest.
    pub id: ImageId,
    /// Path of the encoded image file.
    pub path: PathBuf,
    /// Region to crop before embedding.
    pub bbox: Option<BoundingBox>,
}

impl ImageRecord {
    /// Creates a record without a crop region.
    pub fn new(id: impl Into<ImageId>, path: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            path: path.as_ref().to_path_buf(),
            bbox: None,
        }
    }

    /// Attaches a crop region.
    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}
