//! Fixed-length feature vectors produced by an embedder.

use std::sync::Arc;

/// An immutable image embedding.
///
/// The dimensionality depends on the embedder that produced it (2048 for the
/// squeeze-and-excitation and CBAM heads on ResNet-101, 1792 for the
/// multi-scale channel and spatial variants). Values are shared, so clones
/// are cheap when the same vector sits in an index and a concatenation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Arc<[f32]>,
}

impl FeatureVector {
    /// Creates a feature vector from raw values.
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: values.into(),
        }
    }

    /// The raw values.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Returns the dimensionality of this vector.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Returns true when every value is finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt()
    }

    /// Computes cosine similarity with another vector.
    ///
    /// Returns a value between -1.0 and 1.0, where 1.0 means identical
    /// direction. Zero vectors and mismatched dimensions yield 0.0.
    pub fn cosine_similarity(&self, other: &FeatureVector) -> f64 {
        if self.dimension() != other.dimension() {
            return 0.0;
        }

        let dot: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| f64::from(a) * f64::from(b))
            .sum();

        let norm_a = self.norm();
        let norm_b = other.norm();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a * norm_b)
    }

    /// Euclidean distance to another vector of the same dimension.
    pub fn l2_distance(&self, other: &FeatureVector) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| {
                let d = f64::from(a) - f64::from(b);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Returns a copy with every value multiplied by `factor`.
    pub fn scaled(&self, factor: f32) -> FeatureVector {
        FeatureVector::new(self.values.iter().map(|v| v * factor).collect())
    }

    /// Joins several vectors end to end.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a FeatureVector>) -> FeatureVector {
        let values: Vec<f32> = parts
            .into_iter()
            .flat_map(|p| p.values.iter().copied())
            .collect();
        FeatureVector::new(values)
    }

    /// Encodes the vector as little-endian `f32` bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decodes little-endian `f32` bytes. Returns `None` if the length is not a
    /// multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<FeatureVector> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(FeatureVector::new(values))
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}
