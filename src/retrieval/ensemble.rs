//! Fusion of per-embedder rankings into one ranking per query.
//!
//! # Policies
//!
//! - [`FusionPolicy::MinMaxScore`] (default): each embedder's scores for the
//!   query are min-max normalised to `[0, 1]`, then summed with weights
//!   divided by their total. A constant score list normalises to zero.
//! - [`FusionPolicy::RawScore`]: weighted sum of the unnormalised scores.
//!   Embedders with a wide score range dominate.
//! - [`FusionPolicy::ReciprocalRank`]: `sum(w / (k + rank))` with 1-based ranks.
//! - [`FusionPolicy::Concatenate`]: fuses vectors instead of rankings; each
//!   embedder's vector is scaled by the square root of its normalised weight
//!   and the parts are concatenated into one vector per image.
//!
//! Every policy returns the single embedder's order when only one weight is
//! positive, is unchanged when all weights are multiplied by the same
//! positive factor, and keeps the shared order of embedders that agree.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::retriever::SimilarityMetric;
use crate::domain::{ImageId, Ranking, ScoredImage};
use crate::embedding::{AttentionKind, FeatureVector};

/// Default `k` for reciprocal rank fusion.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// How per-embedder results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPolicy {
    #[default]
    #[serde(alias = "minmax")]
    MinMaxScore,
    #[serde(alias = "raw")]
    RawScore,
    #[serde(alias = "rrf")]
    ReciprocalRank,
    #[serde(alias = "concat")]
    Concatenate,
}

impl FusionPolicy {
    pub fn id(&self) -> &'static str {
        match self {
            Self::MinMaxScore => "min_max_score",
            Self::RawScore => "raw_score",
            Self::ReciprocalRank => "reciprocal_rank",
            Self::Concatenate => "concatenate",
        }
    }

    /// Returns whether the policy combines vectors rather than rankings.
    pub fn fuses_vectors(&self) -> bool {
        matches!(self, Self::Concatenate)
    }
}

impl fmt::Display for FusionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for FusionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min_max_score" | "minmax" => Ok(Self::MinMaxScore),
            "raw_score" | "raw" => Ok(Self::RawScore),
            "reciprocal_rank" | "rrf" => Ok(Self::ReciprocalRank),
            "concatenate" | "concat" => Ok(Self::Concatenate),
            other => Err(format!("unknown fusion policy: {other}")),
        }
    }
}

/// Errors raised while fusing.
#[derive(Debug, Error, PartialEq)]
pub enum EnsembleError {
    #[error("weight for {kind} must be finite and non-negative, got {weight}")]
    InvalidWeight { kind: AttentionKind, weight: f32 },

    #[error("at least one ensemble weight must be positive")]
    NoPositiveWeight,

    #[error("nothing to fuse")]
    NoRankings,

    #[error("reciprocal rank constant must be finite and non-negative, got {0}")]
    InvalidRrfK(f64),

    #[error("no {kind} result for query {query}, but its weight is positive")]
    MissingInput { kind: AttentionKind, query: ImageId },

    #[error("rankings answer different queries: {expected} and {found}")]
    QueryMismatch { expected: ImageId, found: ImageId },

    #[error("{kind} ranking for query {query} has a different candidate set")]
    CandidateMismatch { kind: AttentionKind, query: ImageId },

    #[error("{policy} fuses vectors; use Ensembler::concatenate")]
    RequiresVectors { policy: FusionPolicy },
}

pub type Result<T> = std::result::Result<T, EnsembleError>;

/// Per-embedder weights, fixed for a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleWeights {
    weights: BTreeMap<AttentionKind, f32>,
}

impl EnsembleWeights {
    /// Validates and wraps the weights.
    pub fn new(weights: BTreeMap<AttentionKind, f32>) -> Result<Self> {
        for (&kind, &weight) in &weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(EnsembleError::InvalidWeight { kind, weight });
            }
        }
        if !weights.values().any(|&w| w > 0.0) {
            return Err(EnsembleError::NoPositiveWeight);
        }
        Ok(Self { weights })
    }

    /// Weight 1 for every kind.
    pub fn uniform(kinds: impl IntoIterator<Item = AttentionKind>) -> Result<Self> {
        Self::new(kinds.into_iter().map(|k| (k, 1.0)).collect())
    }

    /// Weight of `kind`; zero when absent.
    pub fn get(&self, kind: AttentionKind) -> f32 {
        self.weights.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn kinds(&self) -> impl Iterator<Item = AttentionKind> + '_ {
        self.weights.keys().copied()
    }

    /// Kinds with a positive weight.
    pub fn active_kinds(&self) -> Vec<AttentionKind> {
        self.weights
            .iter()
            .filter(|(_, &w)| w > 0.0)
            .map(|(&k, _)| k)
            .collect()
    }

    /// Weights divided by their sum.
    pub fn normalized(&self) -> BTreeMap<AttentionKind, f64> {
        let total: f64 = self.weights.values().map(|&w| f64::from(w)).sum();
        self.weights
            .iter()
            .map(|(&k, &w)| (k, f64::from(w) / total))
            .collect()
    }

    pub fn as_map(&self) -> &BTreeMap<AttentionKind, f32> {
        &self.weights
    }
}

/// Combines per-embedder results for one query.
#[derive(Debug, Clone)]
pub struct Ensembler {
    policy: FusionPolicy,
    weights: EnsembleWeights,
    rrf_k: f64,
}

impl Ensembler {
    pub fn new(policy: FusionPolicy, weights: EnsembleWeights) -> Self {
        Self {
            policy,
            weights,
            rrf_k: DEFAULT_RRF_K,
        }
    }

    /// Sets `k` for reciprocal rank fusion.
    pub fn with_rrf_k(mut self, rrf_k: f64) -> Result<Self> {
        if !rrf_k.is_finite() || rrf_k < 0.0 {
            return Err(EnsembleError::InvalidRrfK(rrf_k));
        }
        self.rrf_k = rrf_k;
        Ok(self)
    }

    pub fn policy(&self) -> FusionPolicy {
        self.policy
    }

    pub fn weights(&self) -> &EnsembleWeights {
        &self.weights
    }

    /// Fuses the rankings of one query.
    ///
    /// Every ranking must answer the same query over the same candidates.
    /// Rankings of zero-weight embedders are checked but do not contribute.
    pub fn fuse(&self, rankings: &BTreeMap<AttentionKind, Ranking>) -> Result<Ranking> {
        if self.policy.fuses_vectors() {
            return Err(EnsembleError::RequiresVectors {
                policy: self.policy,
            });
        }

        let reference = self.reference_ranking(rankings)?;
        let query = reference.query().clone();
        check_candidates(reference, rankings)?;

        let weights = self.weights.normalized();
        let mut fused: HashMap<&ImageId, f64> = reference.ids().map(|id| (id, 0.0)).collect();

        for (kind, ranking) in rankings {
            let weight = weights.get(kind).copied().unwrap_or(0.0);
            if weight == 0.0 {
                continue;
            }
            let contributions = self.contributions(ranking);
            for (entry, value) in ranking.entries().iter().zip(contributions) {
                if let Some(score) = fused.get_mut(&entry.id) {
                    *score += weight * value;
                }
            }
        }

        let scores = fused
            .into_iter()
            .map(|(id, score)| ScoredImage::new(id.clone(), score))
            .collect();
        Ok(Ranking::from_scores(query, scores))
    }

    /// Concatenates one image's vectors, each scaled by the square root of
    /// its normalised weight.
    ///
    /// Under the cosine metric each part is first scaled to unit length, so
    /// the fused cosine is the weighted mean of the per-embedder cosines.
    /// Zero-weight parts are kept as zeros so every fused vector has the same
    /// length.
    pub fn concatenate(
        &self,
        image: &ImageId,
        vectors: &BTreeMap<AttentionKind, FeatureVector>,
        metric: SimilarityMetric,
    ) -> Result<FeatureVector> {
        for kind in self.weights.active_kinds() {
            if !vectors.contains_key(&kind) {
                return Err(EnsembleError::MissingInput {
                    kind,
                    query: image.clone(),
                });
            }
        }

        let weights = self.weights.normalized();
        let parts: Vec<FeatureVector> = vectors
            .iter()
            .map(|(kind, vector)| {
                let weight = weights.get(kind).copied().unwrap_or(0.0);
                let mut factor = weight.sqrt();
                if metric == SimilarityMetric::Cosine {
                    let norm = vector.norm();
                    factor = if norm > 0.0 { factor / norm } else { 0.0 };
                }
                vector.scaled(factor as f32)
            })
            .collect();
        Ok(FeatureVector::concat(&parts))
    }

    fn reference_ranking<'a>(
        &self,
        rankings: &'a BTreeMap<AttentionKind, Ranking>,
    ) -> Result<&'a Ranking> {
        let Some(reference) = rankings.values().next() else {
            return Err(EnsembleError::NoRankings);
        };
        for kind in self.weights.active_kinds() {
            if !rankings.contains_key(&kind) {
                return Err(EnsembleError::MissingInput {
                    kind,
                    query: reference.query().clone(),
                });
            }
        }
        for ranking in rankings.values() {
            if ranking.query() != reference.query() {
                return Err(EnsembleError::QueryMismatch {
                    expected: reference.query().clone(),
                    found: ranking.query().clone(),
                });
            }
        }
        Ok(reference)
    }

    /// Per-entry contribution of one ranking, in ranking order.
    fn contributions(&self, ranking: &Ranking) -> Vec<f64> {
        let entries = ranking.entries();
        match self.policy {
            FusionPolicy::MinMaxScore => {
                let (min, max) = entries
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), e| {
                        (lo.min(e.score), hi.max(e.score))
                    });
                let range = max - min;
                entries
                    .iter()
                    .map(|e| if range > 0.0 { (e.score - min) / range } else { 0.0 })
                    .collect()
            }
            FusionPolicy::RawScore => entries.iter().map(|e| e.score).collect(),
            FusionPolicy::ReciprocalRank => (1..=entries.len())
                .map(|rank| 1.0 / (self.rrf_k + rank as f64))
                .collect(),
            FusionPolicy::Concatenate => vec![0.0; entries.len()],
        }
    }
}

fn check_candidates(
    reference: &Ranking,
    rankings: &BTreeMap<AttentionKind, Ranking>,
) -> Result<()> {
    let mut expected: Vec<&ImageId> = reference.ids().collect();
    expected.sort();

    for (&kind, ranking) in rankings {
        let mut ids: Vec<&ImageId> = ranking.ids().collect();
        ids.sort();
        if ids != expected {
            return Err(EnsembleError::CandidateMismatch {
                kind,
                query: reference.query().clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALL_POLICIES: [FusionPolicy; 3] = [
        FusionPolicy::MinMaxScore,
        FusionPolicy::RawScore,
        FusionPolicy::ReciprocalRank,
    ];

    fn ranking(scores: &[(&str, f64)]) -> Ranking {
        Ranking::from_scores(
            ImageId::from("q"),
            scores.iter().map(|&(id, s)| ScoredImage::new(id, s)).collect(),
        )
    }

    fn ids(ranking: &Ranking) -> Vec<String> {
        ranking.ids().map(|id| id.to_string()).collect()
    }

    fn weights(pairs: &[(AttentionKind, f32)]) -> EnsembleWeights {
        EnsembleWeights::new(pairs.iter().copied().collect()).unwrap()
    }

    fn two_rankings() -> BTreeMap<AttentionKind, Ranking> {
        BTreeMap::from([
            (
                AttentionKind::SqueezeExcitation,
                ranking(&[("a", 0.9), ("b", 0.4), ("c", 0.1), ("d", 0.0)]),
            ),
            (
                AttentionKind::Cbam,
                ranking(&[("a", -7.0), ("b", -1.0), ("c", -3.0), ("d", -2.0)]),
            ),
        ])
    }

    #[test]
    fn single_positive_weight_reproduces_that_ranking() {
        let rankings = two_rankings();
        for policy in ALL_POLICIES {
            let ensembler = Ensembler::new(
                policy,
                weights(&[(AttentionKind::SqueezeExcitation, 0.0), (AttentionKind::Cbam, 3.0)]),
            );
            let fused = ensembler.fuse(&rankings).unwrap();
            assert_eq!(ids(&fused), ids(&rankings[&AttentionKind::Cbam]), "{policy}");
        }
    }

    #[test]
    fn uniform_rescaling_of_weights_is_invariant() {
        let rankings = two_rankings();
        for policy in ALL_POLICIES {
            let base = Ensembler::new(
                policy,
                weights(&[(AttentionKind::SqueezeExcitation, 1.0), (AttentionKind::Cbam, 2.0)]),
            );
            let scaled = Ensembler::new(
                policy,
                weights(&[(AttentionKind::SqueezeExcitation, 4.0), (AttentionKind::Cbam, 8.0)]),
            );
            assert_eq!(
                ids(&base.fuse(&rankings).unwrap()),
                ids(&scaled.fuse(&rankings).unwrap()),
                "{policy}"
            );
        }
    }

    #[test]
    fn agreeing_embedders_keep_their_order() {
        let rankings = BTreeMap::from([
            (AttentionKind::Channel, ranking(&[("x", 10.0), ("y", 5.0), ("z", 1.0)])),
            (AttentionKind::Spatial, ranking(&[("x", 0.3), ("y", 0.2), ("z", 0.1)])),
        ]);
        for policy in ALL_POLICIES {
            for (w1, w2) in [(1.0, 1.0), (0.1, 5.0), (7.0, 0.5)] {
                let ensembler = Ensembler::new(
                    policy,
                    weights(&[(AttentionKind::Channel, w1), (AttentionKind::Spatial, w2)]),
                );
                let fused = ensembler.fuse(&rankings).unwrap();
                assert_eq!(ids(&fused), vec!["x", "y", "z"], "{policy}");
            }
        }
    }

    #[test]
    fn min_max_normalisation_balances_score_ranges() {
        // The wide-range embedder prefers b, the narrow one prefers a.
        let rankings = BTreeMap::from([
            (AttentionKind::Cbam, ranking(&[("a", 0.0), ("b", 100.0), ("c", 50.0)])),
            (AttentionKind::Channel, ranking(&[("a", 0.75), ("b", 0.25), ("c", 0.5)])),
        ]);
        let w = weights(&[(AttentionKind::Cbam, 1.0), (AttentionKind::Channel, 1.0)]);

        let raw = Ensembler::new(FusionPolicy::RawScore, w.clone()).fuse(&rankings).unwrap();
        assert_eq!(ids(&raw)[0], "b");

        let fused = Ensembler::new(FusionPolicy::MinMaxScore, w).fuse(&rankings).unwrap();
        // Normalised: a = 0 + 1, b = 1 + 0, c = 0.5 + 0.5; all tie, ids decide.
        assert_eq!(ids(&fused), vec!["a", "b", "c"]);
        assert!(fused.entries().iter().all(|e| (e.score - 0.5).abs() < 1e-12));
    }

    #[test]
    fn constant_scores_normalise_to_zero() {
        let rankings = BTreeMap::from([(
            AttentionKind::Cbam,
            ranking(&[("b", 2.0), ("a", 2.0)]),
        )]);
        let ensembler =
            Ensembler::new(FusionPolicy::MinMaxScore, weights(&[(AttentionKind::Cbam, 1.0)]));
        let fused = ensembler.fuse(&rankings).unwrap();
        assert_eq!(ids(&fused), vec!["a", "b"]);
        assert!(fused.entries().iter().all(|e| e.score == 0.0));
    }

    #[test]
    fn reciprocal_rank_scores() {
        let rankings = BTreeMap::from([(AttentionKind::Cbam, ranking(&[("a", 2.0), ("b", 1.0)]))]);
        let ensembler =
            Ensembler::new(FusionPolicy::ReciprocalRank, weights(&[(AttentionKind::Cbam, 1.0)]));
        let fused = ensembler
            .with_rrf_k(10.0)
            .unwrap()
            .fuse(&rankings)
            .unwrap();
        assert!((fused.entries()[0].score - 1.0 / 11.0).abs() < 1e-12);
        assert!((fused.entries()[1].score - 1.0 / 12.0).abs() < 1e-12);
    }

    #[test]
    fn different_candidate_sets_cannot_be_fused() {
        let rankings = BTreeMap::from([
            (AttentionKind::Cbam, ranking(&[("a", 1.0), ("b", 0.5)])),
            (AttentionKind::Channel, ranking(&[("a", 1.0), ("c", 0.5)])),
        ]);
        let uniform = EnsembleWeights::uniform(rankings.keys().copied()).unwrap();
        let err = Ensembler::new(FusionPolicy::MinMaxScore, uniform)
            .fuse(&rankings)
            .unwrap_err();
        assert!(matches!(err, EnsembleError::CandidateMismatch { .. }));
    }

    #[test]
    fn different_queries_cannot_be_fused() {
        let other = Ranking::from_scores(ImageId::from("other"), vec![ScoredImage::new("a", 1.0)]);
        let rankings = BTreeMap::from([
            (AttentionKind::Cbam, ranking(&[("a", 1.0)])),
            (AttentionKind::Channel, other),
        ]);
        let uniform = EnsembleWeights::uniform(rankings.keys().copied()).unwrap();
        let err = Ensembler::new(FusionPolicy::MinMaxScore, uniform)
            .fuse(&rankings)
            .unwrap_err();
        assert!(matches!(err, EnsembleError::QueryMismatch { .. }));
    }

    #[test]
    fn missing_weighted_ranking_is_an_error() {
        let rankings = BTreeMap::from([(AttentionKind::Cbam, ranking(&[("a", 1.0)]))]);
        let ensembler = Ensembler::new(
            FusionPolicy::MinMaxScore,
            weights(&[(AttentionKind::Cbam, 1.0), (AttentionKind::Spatial, 1.0)]),
        );
        assert!(matches!(
            ensembler.fuse(&rankings),
            Err(EnsembleError::MissingInput { kind: AttentionKind::Spatial, .. })
        ));
    }

    #[test]
    fn weight_validation() {
        assert_eq!(
            EnsembleWeights::new(BTreeMap::from([(AttentionKind::Cbam, -1.0)])).unwrap_err(),
            EnsembleError::InvalidWeight {
                kind: AttentionKind::Cbam,
                weight: -1.0
            }
        );
        assert!(EnsembleWeights::new(BTreeMap::from([(AttentionKind::Cbam, f32::NAN)])).is_err());
        assert_eq!(
            EnsembleWeights::new(BTreeMap::from([(AttentionKind::Cbam, 0.0)])).unwrap_err(),
            EnsembleError::NoPositiveWeight
        );
        let ensembler =
            Ensembler::new(FusionPolicy::ReciprocalRank, weights(&[(AttentionKind::Cbam, 1.0)]));
        assert!(ensembler.with_rrf_k(f64::NAN).is_err());
    }

    #[test]
    fn normalized_weights_sum_to_one() {
        let w = weights(&[(AttentionKind::Cbam, 1.0), (AttentionKind::Channel, 3.0)]);
        let n = w.normalized();
        assert!((n[&AttentionKind::Cbam] - 0.25).abs() < 1e-12);
        assert!((n[&AttentionKind::Channel] - 0.75).abs() < 1e-12);
        assert_eq!(w.get(AttentionKind::Spatial), 0.0);
    }

    #[test]
    fn concatenation_scales_parts() {
        let ensembler = Ensembler::new(
            FusionPolicy::Concatenate,
            weights(&[(AttentionKind::Cbam, 1.0), (AttentionKind::Channel, 3.0)]),
        );
        let vectors = BTreeMap::from([
            (AttentionKind::Channel, FeatureVector::new(vec![2.0, 2.0])),
            (AttentionKind::Cbam, FeatureVector::new(vec![4.0])),
        ]);
        let fused = ensembler
            .concatenate(&ImageId::from("a"), &vectors, SimilarityMetric::Euclidean)
            .unwrap();
        // Channel sorts before Cbam in canonical order.
        let expected = [2.0 * 0.75f32.sqrt(), 2.0 * 0.75f32.sqrt(), 4.0 * 0.5];
        for (got, want) in fused.values().iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn concatenation_identity_law() {
        use crate::retrieval::{IndexBuilder, Retriever};

        let corpus = [
            ("a", vec![1.0, 0.0], vec![0.0, 9.0, 1.0]),
            ("b", vec![0.0, 1.0], vec![5.0, 0.0, 0.0]),
            ("c", vec![0.6, 0.8], vec![1.0, 1.0, 1.0]),
        ];
        let query = (vec![0.9f32, 0.1], vec![0.0f32, 1.0, 9.0]);

        for metric in [SimilarityMetric::Euclidean, SimilarityMetric::Cosine] {
            let only_cbam = Ensembler::new(
                FusionPolicy::Concatenate,
                weights(&[(AttentionKind::Cbam, 2.0), (AttentionKind::Channel, 0.0)]),
            );
            let fuse = |cbam: &[f32], channel: &[f32], id: &str| {
                let parts = BTreeMap::from([
                    (AttentionKind::Cbam, FeatureVector::new(cbam.to_vec())),
                    (AttentionKind::Channel, FeatureVector::new(channel.to_vec())),
                ]);
                only_cbam.concatenate(&ImageId::from(id), &parts, metric).unwrap()
            };

            let mut fused_index = IndexBuilder::new(5).unwrap();
            let mut cbam_index = IndexBuilder::new(2).unwrap();
            for (id, cbam, channel) in &corpus {
                fused_index.insert(ImageId::from(*id), fuse(cbam, channel, id)).unwrap();
                cbam_index
                    .insert(ImageId::from(*id), FeatureVector::new(cbam.clone()))
                    .unwrap();
            }

            let retriever = Retriever::new(metric);
            let q = ImageId::from("q");
            let fused = retriever
                .rank(&q, &fuse(&query.0, &query.1, "q"), &fused_index.build())
                .unwrap();
            let single = retriever
                .rank(&q, &FeatureVector::new(query.0.clone()), &cbam_index.build())
                .unwrap();
            assert_eq!(ids(&fused), ids(&single), "{metric}");
        }
    }

    #[test]
    fn concatenation_requires_weighted_vectors() {
        let ensembler = Ensembler::new(
            FusionPolicy::Concatenate,
            weights(&[(AttentionKind::Cbam, 1.0), (AttentionKind::Channel, 1.0)]),
        );
        let vectors = BTreeMap::from([(AttentionKind::Cbam, FeatureVector::new(vec![1.0]))]);
        assert!(ensembler
            .concatenate(&ImageId::from("a"), &vectors, SimilarityMetric::Euclidean)
            .is_err());
    }

    #[test]
    fn fuse_rejects_vector_policy() {
        let ensembler =
            Ensembler::new(FusionPolicy::Concatenate, weights(&[(AttentionKind::Cbam, 1.0)]));
        let rankings = BTreeMap::from([(AttentionKind::Cbam, ranking(&[("a", 1.0)]))]);
        assert_eq!(
            ensembler.fuse(&rankings).unwrap_err(),
            EnsembleError::RequiresVectors {
                policy: FusionPolicy::Concatenate
            }
        );
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("rrf".parse::<FusionPolicy>(), Ok(FusionPolicy::ReciprocalRank));
        assert_eq!("min_max_score".parse::<FusionPolicy>(), Ok(FusionPolicy::MinMaxScore));
        assert!("borda".parse::<FusionPolicy>().is_err());
    }
}
