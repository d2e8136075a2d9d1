//! Average precision and precision/recall at fixed ranks.
//!
//! Ranks are 0-based positions in a ranking unless stated otherwise.

use std::collections::BTreeSet;

use super::ground_truth::ProtocolGroundTruth;
use super::{EvaluationError, Result};

/// Removes junk images from the positive ranks.
///
/// Each positive rank is shifted up by the number of junk images ranked
/// before it. Both inputs must be sorted ascending.
pub fn adjust_positive_ranks(positive_ranks: &[usize], junk_ranks: &[usize]) -> Vec<usize> {
    positive_ranks
        .iter()
        .map(|&rank| {
            let junk_before = junk_ranks.partition_point(|&j| j < rank);
            rank - junk_before
        })
        .collect()
}

/// Area under the precision-recall curve, trapezoidal between adjacent points.
///
/// A positive at rank 0 contributes precision 1 on its left edge. Returns 0
/// for an empty list.
pub fn average_precision(positive_ranks: &[usize]) -> f64 {
    if positive_ranks.is_empty() {
        return 0.0;
    }
    let recall_step = 1.0 / positive_ranks.len() as f64;

    positive_ranks
        .iter()
        .enumerate()
        .map(|(i, &rank)| {
            let left = if rank == 0 {
                1.0
            } else {
                i as f64 / rank as f64
            };
            let right = (i + 1) as f64 / (rank + 1) as f64;
            (left + right) * recall_step / 2.0
        })
        .sum()
}

/// Precision and recall at each of `pr_ranks` (1-based cut-offs).
///
/// Precision at `k` is measured at `min(k, rank of the last positive)`, so
/// a query whose positives all appear early is not penalised for short lists.
pub fn precision_recall_at(positive_ranks: &[usize], pr_ranks: &[usize]) -> (Vec<f64>, Vec<f64>) {
    if positive_ranks.is_empty() {
        return (vec![0.0; pr_ranks.len()], vec![0.0; pr_ranks.len()]);
    }
    let one_indexed: Vec<usize> = positive_ranks.iter().map(|r| r + 1).collect();
    let total = one_indexed.len() as f64;
    let last = one_indexed.iter().copied().max().unwrap_or(0);
    let within = |k: usize| one_indexed.iter().filter(|&&r| r <= k).count() as f64;

    pr_ranks
        .iter()
        .map(|&k| {
            let precision_rank = last.min(k);
            let precision = if precision_rank == 0 {
                0.0
            } else {
                within(precision_rank) / precision_rank as f64
            };
            (precision, within(k) / total)
        })
        .unzip()
}

/// Metrics of one query. All values are NaN when the query has no positives.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMetrics {
    pub average_precision: f64,
    pub precisions: Vec<f64>,
    pub recalls: Vec<f64>,
}

impl QueryMetrics {
    fn undefined(num_ranks: usize) -> Self {
        Self {
            average_precision: f64::NAN,
            precisions: vec![f64::NAN; num_ranks],
            recalls: vec![f64::NAN; num_ranks],
        }
    }

    pub fn is_defined(&self) -> bool {
        !self.average_precision.is_nan()
    }
}

/// Aggregated metrics of one protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMetrics {
    pub mean_average_precision: f64,
    pub mean_precisions: Vec<f64>,
    pub mean_recalls: Vec<f64>,
    /// Per query, in ground-truth order.
    pub queries: Vec<QueryMetrics>,
    /// Queries that had at least one positive.
    pub valid_queries: usize,
}

/// Scores every query's ranking against its ground truth.
///
/// `sorted_index_ids[q]` lists corpus indices for query `q`, most relevant
/// first, and must contain all `num_index_images` images. Queries without
/// positives are excluded from the means.
pub fn compute_metrics(
    sorted_index_ids: &[Vec<usize>],
    ground_truth: &[ProtocolGroundTruth],
    pr_ranks: &[usize],
    num_index_images: usize,
) -> Result<ProtocolMetrics> {
    let largest = pr_ranks.iter().copied().max().ok_or(EvaluationError::NoPrRanks)?;
    if largest > num_index_images {
        return Err(EvaluationError::PrRankTooLarge {
            rank: largest,
            images: num_index_images,
        });
    }
    if sorted_index_ids.len() != ground_truth.len() {
        return Err(EvaluationError::QueryCountMismatch {
            rankings: sorted_index_ids.len(),
            queries: ground_truth.len(),
        });
    }

    let mut queries = Vec::with_capacity(ground_truth.len());
    let mut sum_ap = 0.0;
    let mut sum_precisions = vec![0.0; pr_ranks.len()];
    let mut sum_recalls = vec![0.0; pr_ranks.len()];
    let mut valid_queries = 0;

    for (query, (ranking, gt)) in sorted_index_ids.iter().zip(ground_truth).enumerate() {
        if ranking.len() != num_index_images {
            return Err(EvaluationError::IncompleteRanking {
                query,
                ranked: ranking.len(),
                images: num_index_images,
            });
        }
        if gt.ok.is_empty() {
            queries.push(QueryMetrics::undefined(pr_ranks.len()));
            continue;
        }

        let positive_ranks = ranks_of(ranking, &gt.ok);
        let junk_ranks = ranks_of(ranking, &gt.junk);
        let adjusted = adjust_positive_ranks(&positive_ranks, &junk_ranks);

        let average_precision = average_precision(&adjusted);
        let (precisions, recalls) = precision_recall_at(&adjusted, pr_ranks);

        sum_ap += average_precision;
        for (sum, value) in sum_precisions.iter_mut().zip(&precisions) {
            *sum += value;
        }
        for (sum, value) in sum_recalls.iter_mut().zip(&recalls) {
            *sum += value;
        }
        valid_queries += 1;

        queries.push(QueryMetrics {
            average_precision,
            precisions,
            recalls,
        });
    }

    if valid_queries == 0 {
        return Err(EvaluationError::NoValidQueries);
    }
    let n = valid_queries as f64;

    Ok(ProtocolMetrics {
        mean_average_precision: sum_ap / n,
        mean_precisions: sum_precisions.into_iter().map(|s| s / n).collect(),
        mean_recalls: sum_recalls.into_iter().map(|s| s / n).collect(),
        queries,
        valid_queries,
    })
}

fn ranks_of(ranking: &[usize], members: &BTreeSet<usize>) -> Vec<usize> {
    ranking
        .iter()
        .enumerate()
        .filter(|(_, image)| members.contains(image))
        .map(|(rank, _)| rank)
        .collect()
}
