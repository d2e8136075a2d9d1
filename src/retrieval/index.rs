//! Immutable corpus index.
//!
//! Vectors are collected in an [`IndexBuilder`] and frozen into an
//! [`Index`]. There is no way to modify an index after it is built;
//! changing the corpus means building a new one.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::domain::ImageId;
use crate::embedding::FeatureVector;

/// Errors raised while building an index.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("index dimension must be positive")]
    ZeroDimension,

    #[error("image {0} is already indexed")]
    DuplicateId(ImageId),

    #[error("vector for {id} has dimension {actual}, index expects {expected}")]
    DimensionMismatch {
        id: ImageId,
        expected: usize,
        actual: usize,
    },

    #[error("vector for {0} contains non-finite values")]
    NonFinite(ImageId),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// A corpus image and its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: ImageId,
    pub vector: FeatureVector,
    /// Free-form annotations (source path, landmark name).
    pub metadata: BTreeMap<String, String>,
}

impl IndexEntry {
    pub fn new(id: ImageId, vector: FeatureVector) -> Self {
        Self {
            id,
            vector,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Collects entries for an [`Index`].
#[derive(Debug)]
pub struct IndexBuilder {
    dimension: usize,
    entries: Vec<IndexEntry>,
    positions: HashMap<ImageId, usize>,
}

impl IndexBuilder {
    /// Creates a builder for vectors of `dimension` values.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(IndexError::ZeroDimension);
        }
        Ok(Self {
            dimension,
            entries: Vec::new(),
            positions: HashMap::new(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a vector without metadata.
    pub fn insert(&mut self, id: ImageId, vector: FeatureVector) -> Result<()> {
        self.insert_entry(IndexEntry::new(id, vector))
    }

    /// Adds an entry. Duplicate ids and wrong dimensions are rejected.
    pub fn insert_entry(&mut self, entry: IndexEntry) -> Result<()> {
        if self.positions.contains_key(&entry.id) {
            return Err(IndexError::DuplicateId(entry.id));
        }
        if entry.vector.dimension() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                id: entry.id,
                expected: self.dimension,
                actual: entry.vector.dimension(),
            });
        }
        if !entry.vector.is_finite() {
            return Err(IndexError::NonFinite(entry.id));
        }

        self.positions.insert(entry.id.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Freezes the collected entries.
    pub fn build(self) -> Index {
        Index {
            dimension: self.dimension,
            entries: self.entries,
            positions: self.positions,
        }
    }
}

/// Read-only collection of corpus vectors.
///
/// Safe to share between threads; ranking never mutates it.
#[derive(Debug)]
pub struct Index {
    dimension: usize,
    entries: Vec<IndexEntry>,
    positions: HashMap<ImageId, usize>,
}

impl Index {
    /// All entries in insertion order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Looks up an entry by id.
    pub fn get(&self, id: &ImageId) -> Option<&IndexEntry> {
        self.positions.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ImageId> {
        self.entries.iter().map(|e| &e.id)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    #[test]
    fn build_and_lookup() {
        let mut builder = IndexBuilder::new(2).unwrap();
        builder.insert(ImageId::from("a"), vector(&[1.0, 0.0])).unwrap();
        builder
            .insert_entry(
                IndexEntry::new(ImageId::from("b"), vector(&[0.0, 1.0]))
                    .with_metadata("path", "/data/b.jpg"),
            )
            .unwrap();
        assert_eq!(builder.len(), 2);

        let index = builder.build();
        assert_eq!(index.len(), 2);
        assert_eq!(index.dimension(), 2);
        assert!(index.contains(&ImageId::from("a")));

        let b = index.get(&ImageId::from("b")).unwrap();
        assert_eq!(b.vector.values(), &[0.0, 1.0]);
        assert_eq!(b.metadata["path"], "/data/b.jpg");
        assert!(index.get(&ImageId::from("z")).is_none());

        let ids: Vec<&str> = index.ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn rejects_duplicate_id() {
        let mut builder = IndexBuilder::new(1).unwrap();
        builder.insert(ImageId::from("a"), vector(&[1.0])).unwrap();
        let err = builder.insert(ImageId::from("a"), vector(&[2.0])).unwrap_err();
        assert_eq!(err, IndexError::DuplicateId(ImageId::from("a")));
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let mut builder = IndexBuilder::new(3).unwrap();
        let err = builder.insert(ImageId::from("a"), vector(&[1.0])).unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                id: ImageId::from("a"),
                expected: 3,
                actual: 1,
            }
        );
        assert!(builder.is_empty());
    }

    #[test]
    fn rejects_non_finite_vector() {
        let mut builder = IndexBuilder::new(2).unwrap();
        let err = builder
            .insert(ImageId::from("a"), vector(&[f32::INFINITY, 0.0]))
            .unwrap_err();
        assert_eq!(err, IndexError::NonFinite(ImageId::from("a")));
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert_eq!(IndexBuilder::new(0).unwrap_err(), IndexError::ZeroDimension);
    }

    #[test]
    fn empty_index() {
        let index = IndexBuilder::new(4).unwrap().build();
        assert!(index.is_empty());
        assert_eq!(index.entries().len(), 0);
    }
}
