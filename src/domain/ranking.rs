//! Rankings produced by retrieval and ensembling.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::ImageId;

/// A corpus image paired with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredImage {
    pub id: ImageId,
    pub score: f64,
}

impl ScoredImage {
    pub fn new(id: impl Into<ImageId>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// Orders by descending score, then ascending identifier.
///
/// Negative zero is treated as zero so `-0.0` distances tie with `0.0`.
pub fn compare_scored(a: &ScoredImage, b: &ScoredImage) -> Ordering {
    canonical(b.score)
        .total_cmp(&canonical(a.score))
        .then_with(|| a.id.cmp(&b.id))
}

fn canonical(score: f64) -> f64 {
    if score == 0.0 {
        0.0
    } else {
        score
    }
}

/// Ordered result list for one query.
///
/// Entries are sorted by descending score with ties broken by ascending
/// image identifier. A ranking is only ever built through [`Ranking::from_scores`],
/// which establishes that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    query: ImageId,
    entries: Vec<ScoredImage>,
}

impl Ranking {
    /// Sorts the scores into a ranking for `query`.
    pub fn from_scores(query: ImageId, mut scores: Vec<ScoredImage>) -> Self {
        scores.sort_by(compare_scored);
        Self {
            query,
            entries: scores,
        }
    }

    /// The query this ranking answers.
    pub fn query(&self) -> &ImageId {
        &self.query
    }

    /// All ranked entries, best first.
    pub fn entries(&self) -> &[ScoredImage] {
        &self.entries
    }

    /// Ranked identifiers, best first.
    pub fn ids(&self) -> impl Iterator<Item = &ImageId> {
        self.entries.iter().map(|e| &e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best match, if any.
    pub fn top(&self) -> Option<&ScoredImage> {
        self.entries.first()
    }

    /// Zero-based rank of `id`, if it was ranked.
    pub fn position_of(&self, id: &ImageId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    /// Keeps only the first `k` entries.
    pub fn truncated(&self, k: usize) -> Ranking {
        Ranking {
            query: self.query.clone(),
            entries: self.entries.iter().take(k).cloned().collect(),
        }
    }

    /// Consumes the ranking and returns its entries.
    pub fn into_entries(self) -> Vec<ScoredImage> {
        self.entries
    }
}
