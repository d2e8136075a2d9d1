//! The set of embedders used by one run.
//!
//! An [`EmbedderSet`] is built once from configuration, passed by
//! reference into the pipeline and used read-only. Each image is decoded
//! and resized once, then handed to every requested embedder.

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::embedder::{build_embedder, Embedder, EmbedderSpec, EmbeddingError, Result};
use super::models::AttentionKind;
use super::preprocess::ImagePreprocessor;
use super::vector::FeatureVector;
use crate::domain::{ImageId, ImageRecord};

/// Result of embedding one image with one embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingOutcome {
    Embedded(FeatureVector),
    /// The image could not be embedded; it is excluded from indexing and ranking.
    Failed { reason: String },
}

impl EmbeddingOutcome {
    pub fn vector(&self) -> Option<&FeatureVector> {
        match self {
            Self::Embedded(vector) => Some(vector),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn failed(error: &EmbeddingError) -> Self {
        Self::Failed {
            reason: error.to_string(),
        }
    }
}

/// An image together with the embedders that still have to process it.
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub record: ImageRecord,
    pub kinds: Vec<AttentionKind>,
}

impl EmbeddingJob {
    pub fn new(record: ImageRecord, kinds: Vec<AttentionKind>) -> Self {
        Self { record, kinds }
    }
}

/// Outcomes for one image, keyed by embedder.
#[derive(Debug, Clone)]
pub struct ImageEmbeddings {
    pub id: ImageId,
    pub outcomes: BTreeMap<AttentionKind, EmbeddingOutcome>,
}

/// Explicit embedder instances sharing one preprocessor.
pub struct EmbedderSet {
    embedders: BTreeMap<AttentionKind, Arc<dyn Embedder>>,
    preprocessor: ImagePreprocessor,
}

impl EmbedderSet {
    /// Creates an empty set.
    pub fn new(preprocessor: ImagePreprocessor) -> Self {
        Self {
            embedders: BTreeMap::new(),
            preprocessor,
        }
    }

    /// Builds one embedder per spec on the preprocessor's device.
    pub fn from_specs(specs: &[EmbedderSpec], preprocessor: ImagePreprocessor) -> Result<Self> {
        let mut set = Self::new(preprocessor);
        for spec in specs {
            let embedder = build_embedder(spec, set.preprocessor.device())?;
            tracing::info!(
                embedder = %spec.kind,
                dimension = embedder.dimension(),
                weights = %spec.weights.describe(),
                "Embedder ready"
            );
            set.insert(embedder);
        }
        Ok(set)
    }

    /// Adds an embedder, replacing any existing one of the same kind.
    pub fn insert(&mut self, embedder: Arc<dyn Embedder>) {
        self.embedders.insert(embedder.kind(), embedder);
    }

    pub fn get(&self, kind: AttentionKind) -> Option<&Arc<dyn Embedder>> {
        self.embedders.get(&kind)
    }

    /// Kinds in the set, in canonical order.
    pub fn kinds(&self) -> Vec<AttentionKind> {
        self.embedders.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.embedders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embedders.is_empty()
    }

    pub fn preprocessor(&self) -> &ImagePreprocessor {
        &self.preprocessor
    }

    /// Embeds one image with the requested embedders.
    ///
    /// A decoding failure fails every requested embedder; an inference
    /// failure only fails the embedder that raised it.
    pub fn embed_image(&self, job: &EmbeddingJob) -> ImageEmbeddings {
        let record = &job.record;
        let mut outcomes = BTreeMap::new();

        let pixels = match self.preprocessor.load(record) {
            Ok(pixels) => pixels,
            Err(e) => {
                tracing::warn!(image = %record.id, error = %e, "Image preprocessing failed");
                for &kind in &job.kinds {
                    outcomes.insert(kind, EmbeddingOutcome::failed(&e));
                }
                return ImageEmbeddings {
                    id: record.id.clone(),
                    outcomes,
                };
            }
        };

        for &kind in &job.kinds {
            let outcome = match self.embedders.get(&kind) {
                Some(embedder) => match embed_checked(embedder.as_ref(), &pixels) {
                    Ok(vector) => EmbeddingOutcome::Embedded(vector),
                    Err(e) => {
                        tracing::warn!(
                            image = %record.id,
                            embedder = %kind,
                            error = %e,
                            "Embedding failed"
                        );
                        EmbeddingOutcome::failed(&e)
                    }
                },
                None => EmbeddingOutcome::Failed {
                    reason: format!("no {kind} embedder configured"),
                },
            };
            outcomes.insert(kind, outcome);
        }

        ImageEmbeddings {
            id: record.id.clone(),
            outcomes,
        }
    }

    /// Embeds many images in parallel. Output order matches `jobs`.
    pub fn embed_batch(&self, jobs: &[EmbeddingJob]) -> Vec<ImageEmbeddings> {
        jobs.par_iter().map(|job| self.embed_image(job)).collect()
    }
}

fn embed_checked(embedder: &dyn Embedder, pixels: &candle_core::Tensor) -> Result<FeatureVector> {
    let vector = embedder.embed(pixels)?;
    if vector.dimension() != embedder.dimension() {
        return Err(EmbeddingError::DimensionMismatch {
            kind: embedder.kind(),
            expected: embedder.dimension(),
            actual: vector.dimension(),
        });
    }
    Ok(vector)
}

impl std::fmt::Debug for EmbedderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedderSet")
            .field("kinds", &self.kinds())
            .field("preprocessor", &self.preprocessor)
            .finish()
    }
}
