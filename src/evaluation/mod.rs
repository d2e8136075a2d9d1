//! Revisited Oxford/Paris evaluation.
//!
//! Rankings produced by the pipeline are scored under the easy, medium and
//! hard protocols: mean average precision plus mean precision and recall at
//! a few fixed ranks.
//!
//! # Example
//!
//! ```ignore
//! let dataset = DatasetFile::load("data/gnd_roxford5k.json")?;
//! let evaluation = evaluate_rankings(&dataset, &rankings, &[1, 5, 10])?;
//! save_metrics_file(&evaluation.summary, "eval/metrics.txt")?;
//! ```

mod ground_truth;
mod metrics;
mod report;

pub use ground_truth::{
    DatasetFile, DatasetName, Protocol, ProtocolGroundTruth, QueryGroundTruth, IMAGE_EXTENSION,
};
pub use metrics::{
    adjust_positive_ranks, average_precision, compute_metrics, precision_recall_at,
    ProtocolMetrics, QueryMetrics,
};
pub use report::{
    format_metrics, parse_metrics, read_metrics_file, save_metrics_file, MetricsSummary,
    ProtocolSummary,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::{ImageId, Ranking};

/// Default precision/recall cut-offs.
pub const DEFAULT_PR_RANKS: [usize; 3] = [1, 5, 10];

/// Errors raised while loading ground truth or computing metrics.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("failed to access {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("invalid ground truth {path}: {reason}")]
    GroundTruth { path: PathBuf, reason: String },

    #[error("malformed metrics file {path}: {reason}")]
    MalformedMetrics { path: PathBuf, reason: String },

    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("no precision/recall ranks requested")]
    NoPrRanks,

    #[error("requested PR ranks up to {rank}, however there are only {images} images")]
    PrRankTooLarge { rank: usize, images: usize },

    #[error("{rankings} rankings for {queries} queries")]
    QueryCountMismatch { rankings: usize, queries: usize },

    #[error("ranking of query {query} has {ranked} images, corpus has {images}")]
    IncompleteRanking {
        query: usize,
        ranked: usize,
        images: usize,
    },

    #[error("ranking of {query} contains {image}, which is not in the corpus")]
    UnknownImage { query: ImageId, image: ImageId },

    #[error("no query has positive images")]
    NoValidQueries,
}

pub type Result<T> = std::result::Result<T, EvaluationError>;

/// Metrics of every protocol, plus the summary written to disk.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub protocols: BTreeMap<Protocol, ProtocolMetrics>,
    pub summary: MetricsSummary,
}

/// Scores the rankings of every dataset query.
///
/// Protocols under which no query has positives are left out; if that
/// leaves nothing, the evaluation fails.
///
/// Rankings are looked up by query id. Corpus images absent from a ranking
/// (for example because they failed to embed) are appended after the ranked
/// ones in dataset order; a query with no ranking at all is scored as if
/// the corpus were returned in dataset order.
pub fn evaluate_rankings(
    dataset: &DatasetFile,
    rankings: &HashMap<ImageId, Ranking>,
    pr_ranks: &[usize],
) -> Result<Evaluation> {
    let positions: HashMap<ImageId, usize> = dataset
        .corpus_ids()
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();

    let sorted_index_ids = dataset
        .query_ids()
        .iter()
        .map(|query| match rankings.get(query) {
            Some(ranking) => to_index_order(query, ranking, &positions),
            None => {
                tracing::warn!(query = %query, "no ranking for query, scoring dataset order");
                Ok((0..positions.len()).collect())
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let mut protocols = BTreeMap::new();
    let mut summary = MetricsSummary::new(pr_ranks.to_vec());
    for protocol in Protocol::ALL {
        let ground_truth = dataset.protocol_ground_truth(protocol);
        let metrics =
            match compute_metrics(&sorted_index_ids, &ground_truth, pr_ranks, positions.len()) {
                Ok(metrics) => metrics,
                Err(EvaluationError::NoValidQueries) => {
                    tracing::warn!(protocol = %protocol, "No query has positives, skipping protocol");
                    continue;
                }
                Err(e) => return Err(e),
            };
        tracing::info!(
            protocol = %protocol,
            map = metrics.mean_average_precision,
            valid_queries = metrics.valid_queries,
            "Evaluated rankings"
        );
        summary.insert(protocol.id(), ProtocolSummary::from(&metrics));
        protocols.insert(protocol, metrics);
    }

    if protocols.is_empty() {
        return Err(EvaluationError::NoValidQueries);
    }
    Ok(Evaluation { protocols, summary })
}

fn to_index_order(
    query: &ImageId,
    ranking: &Ranking,
    positions: &HashMap<ImageId, usize>,
) -> Result<Vec<usize>> {
    let mut seen = HashSet::with_capacity(positions.len());
    let mut order = Vec::with_capacity(positions.len());

    for id in ranking.ids() {
        let index = *positions
            .get(id)
            .ok_or_else(|| EvaluationError::UnknownImage {
                query: query.clone(),
                image: id.clone(),
            })?;
        if seen.insert(index) {
            order.push(index);
        }
    }
    order.extend((0..positions.len()).filter(|i| !seen.contains(i)));
    Ok(order)
}
