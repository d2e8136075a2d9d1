//! Domain types shared by the embedding, retrieval and evaluation layers.
//!
//! This module contains image identifiers and records, and the rankings
//! produced for each query.

mod image;
mod ranking;
mod types;

pub use image::{BoundingBox, ImageRecord};
pub use ranking::{compare_scored, Ranking, ScoredImage};
pub use types::ImageId;
