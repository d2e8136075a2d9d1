//! Exhaustive nearest-neighbour ranking against an [`Index`].

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::index::Index;
use crate::domain::{ImageId, Ranking, ScoredImage};
use crate::embedding::FeatureVector;

/// Similarity used to score corpus entries against a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Cosine of the angle between the vectors.
    Cosine,
    /// Negated Euclidean distance, so closer images score higher.
    #[default]
    #[serde(alias = "l2")]
    Euclidean,
}

impl SimilarityMetric {
    pub fn similarity(&self, query: &FeatureVector, candidate: &FeatureVector) -> f64 {
        match self {
            Self::Cosine => query.cosine_similarity(candidate),
            Self::Euclidean => -query.l2_distance(candidate),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            other => Err(format!("unknown similarity metric: {other}")),
        }
    }
}

/// Errors raised while ranking.
#[derive(Debug, Error, PartialEq)]
pub enum RetrievalError {
    #[error("query {query} has dimension {actual}, index expects {expected}")]
    DimensionMismatch {
        query: ImageId,
        expected: usize,
        actual: usize,
    },
}

/// A query image and its vector.
#[derive(Debug, Clone)]
pub struct QueryVector {
    pub id: ImageId,
    pub vector: FeatureVector,
}

impl QueryVector {
    pub fn new(id: ImageId, vector: FeatureVector) -> Self {
        Self { id, vector }
    }
}

/// Ranks every index entry for a query.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retriever {
    metric: SimilarityMetric,
}

impl Retriever {
    pub fn new(metric: SimilarityMetric) -> Self {
        Self { metric }
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    /// Scores all entries and sorts them best first, ties by ascending id.
    ///
    /// The ranking contains every corpus id exactly once.
    pub fn rank(
        &self,
        query: &ImageId,
        vector: &FeatureVector,
        index: &Index,
    ) -> Result<Ranking, RetrievalError> {
        if vector.dimension() != index.dimension() {
            return Err(RetrievalError::DimensionMismatch {
                query: query.clone(),
                expected: index.dimension(),
                actual: vector.dimension(),
            });
        }

        let scores = index
            .entries()
            .iter()
            .map(|entry| {
                let score = self.metric.similarity(vector, &entry.vector);
                ScoredImage::new(entry.id.clone(), score)
            })
            .collect();
        Ok(Ranking::from_scores(query.clone(), scores))
    }

    /// Ranks many queries concurrently against one shared index.
    ///
    /// Results keep the order of `queries`.
    pub fn rank_all(
        &self,
        queries: &[QueryVector],
        index: &Index,
    ) -> Result<Vec<Ranking>, RetrievalError> {
        queries
            .par_iter()
            .map(|q| self.rank(&q.id, &q.vector, index))
            .collect()
    }
}
