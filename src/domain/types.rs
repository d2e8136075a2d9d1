//! Core identifier types.
//!
//! Image identifiers come from the dataset manifest (landmark or photo IDs)
//! or from file stems when a directory is scanned.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a corpus or query image.
///
/// Ordering is lexicographic and is used to break score ties, so rankings
/// are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
