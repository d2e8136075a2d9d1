//! End-to-end retrieval runs.
//!
//! The [`RetrievalPipeline`] turns settings into rankings:
//!
//! ```text
//! validate -> load images -> build embedders -> embed corpus (cache)
//!   -> build indexes -> embed queries (cache) -> rank -> fuse
//!   -> write outputs -> evaluate -> record run
//! ```
//!
//! Compute-heavy stages run on the blocking pool, fanned out with rayon.
//! Indexes are complete before the first query is ranked.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::corpus_service::{CorpusError, CorpusService};
use super::output::{self, FailureRecord, ImageRole};
use crate::config::{ConfigError, PipelineSettings};
use crate::domain::{ImageId, ImageRecord, Ranking};
use crate::embedding::{
    AttentionKind, EmbedderSet, EmbeddingError, EmbeddingJob, EmbeddingOutcome, FeatureVector,
    ImagePreprocessor,
};
use crate::evaluation::{
    evaluate_rankings, save_metrics_file, DatasetFile, EvaluationError, MetricsSummary,
};
use crate::retrieval::{
    EnsembleError, Ensembler, Index, IndexBuilder, IndexEntry, IndexError, QueryVector,
    RetrievalError, Retriever,
};
use crate::storage::{EmbeddingStore, SqliteEmbeddingStore, StorageError};

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("input error: {0}")]
    Corpus(#[from] CorpusError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("ensemble error: {0}")]
    Ensemble(#[from] EnsembleError),

    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{kind} is configured for dimension {configured}, but its embedder produces {actual}")]
    DimensionMismatch {
        kind: AttentionKind,
        configured: usize,
        actual: usize,
    },

    #[error("cached {kind} vector for {image} has dimension {actual}, expected {expected}")]
    CachedDimension {
        kind: AttentionKind,
        image: ImageId,
        expected: usize,
        actual: usize,
    },

    #[error(
        "saved ranking of {query} lists {ranked} of {expected} indexed images; rerun without top_k to evaluate it"
    )]
    TruncatedRanking {
        query: ImageId,
        ranked: usize,
        expected: usize,
    },

    #[error("every corpus image failed to embed")]
    EmptyIndex,

    #[error("failed to write {path}: {reason}")]
    Output { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("worker pool error: {0}")]
    ThreadPool(String),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Summary of a finished run, written as `report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub embedders: Vec<AttentionKind>,
    pub weights: BTreeMap<AttentionKind, f32>,
    pub policy: String,
    pub metric: String,
    pub corpus_images: usize,
    pub indexed_images: usize,
    pub queries: usize,
    pub ranked_queries: usize,
    pub failures: usize,
    /// Vectors served from the cache, per embedder.
    pub cache_hits: BTreeMap<AttentionKind, usize>,
    /// Wall time of each stage in milliseconds.
    pub timings_ms: BTreeMap<String, u64>,
    pub metrics: Option<MetricsSummary>,
    pub output_dir: PathBuf,
}

/// Vectors of one image set after the cache and the embedders are consulted.
#[derive(Debug, Default)]
struct EmbeddedImages {
    /// Images that embedded under every embedder, in input order.
    ids: Vec<ImageId>,
    vectors: BTreeMap<AttentionKind, HashMap<ImageId, FeatureVector>>,
    failures: Vec<FailureRecord>,
    cache_hits: BTreeMap<AttentionKind, usize>,
}

impl EmbeddedImages {
    /// Vectors of one image keyed by embedder, if it embedded everywhere.
    fn vectors_of(&self, id: &ImageId) -> BTreeMap<AttentionKind, FeatureVector> {
        self.vectors
            .iter()
            .filter_map(|(kind, vectors)| vectors.get(id).map(|v| (*kind, v.clone())))
            .collect()
    }
}

/// Indexes built from the corpus.
enum CorpusIndexes {
    /// One index per embedder; rankings are fused per query.
    PerEmbedder(BTreeMap<AttentionKind, Arc<Index>>),
    /// A single index of concatenated vectors.
    Concatenated(Arc<Index>),
}

struct Stopwatch {
    timings: BTreeMap<String, u64>,
    current: Instant,
}

impl Stopwatch {
    fn new() -> Self {
        Self {
            timings: BTreeMap::new(),
            current: Instant::now(),
        }
    }

    fn lap(&mut self, stage: &str) {
        let elapsed = self.current.elapsed().as_millis() as u64;
        tracing::debug!(stage, elapsed_ms = elapsed, "Stage finished");
        self.timings.insert(stage.to_string(), elapsed);
        self.current = Instant::now();
    }
}

/// Runs the full embed, index, rank, fuse and evaluate sequence.
pub struct RetrievalPipeline {
    settings: PipelineSettings,
    store: Option<Arc<dyn EmbeddingStore>>,
}

impl RetrievalPipeline {
    /// Creates a pipeline. The cache from `settings.storage` is opened on
    /// [`run`](Self::run) unless a store was supplied.
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            store: None,
        }
    }

    /// Uses `store` for cached vectors and run records.
    pub fn with_store(mut self, store: Arc<dyn EmbeddingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Executes one run and writes its outputs.
    pub async fn run(&self) -> Result<RunReport> {
        let settings = &self.settings;
        settings.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let mut watch = Stopwatch::new();
        tracing::info!(run = %run_id, embedders = ?settings.embedders, "Starting retrieval run");

        let store = self.open_store().await?;
        if let Some(store) = &store {
            store
                .begin_run(run_id, serde_json::to_string(settings)?)
                .await?;
        }

        let corpus = {
            let settings = settings.clone();
            blocking(move || CorpusService::load(&settings).map_err(PipelineError::from)).await?
        };
        watch.lap("load_images");

        let pool = build_pool(settings.parallelism.threads)?;
        let embedders = Arc::new(self.build_embedders().await?);
        let fingerprints: BTreeMap<AttentionKind, String> = settings
            .embedder_specs()
            .iter()
            .map(|spec| (spec.kind, spec.fingerprint(settings.backbone.input_size)))
            .collect();
        watch.lap("build_embedders");

        let corpus_vectors = embed_images(
            &embedders,
            &fingerprints,
            store.as_deref(),
            pool.clone(),
            &corpus.corpus,
            ImageRole::Corpus,
        )
        .await?;
        watch.lap("embed_corpus");

        let weights = settings.ensemble_weights()?;
        let ensembler = Ensembler::new(settings.fusion.policy, weights.clone())
            .with_rrf_k(settings.fusion.rrf_k)?;
        let indexes = build_indexes(&corpus.corpus, &corpus_vectors, &ensembler, settings)?;
        watch.lap("build_index");

        let query_vectors = embed_images(
            &embedders,
            &fingerprints,
            store.as_deref(),
            pool.clone(),
            &corpus.queries,
            ImageRole::Query,
        )
        .await?;
        watch.lap("embed_queries");

        let rankings = rank_queries(indexes, &query_vectors, ensembler, settings, pool).await?;
        watch.lap("rank");

        let mut failures = corpus_vectors.failures;
        failures.extend(query_vectors.failures);
        self.write_outputs(&rankings, &failures)?;

        let metrics = match &corpus.dataset {
            Some(dataset) => Some(self.evaluate(dataset, &rankings)?),
            None => None,
        };
        watch.lap("write_outputs");

        let mut cache_hits = corpus_vectors.cache_hits;
        for (kind, hits) in query_vectors.cache_hits {
            *cache_hits.entry(kind).or_default() += hits;
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            embedders: embedders.kinds(),
            weights: weights.as_map().clone(),
            policy: settings.fusion.policy.to_string(),
            metric: settings.retrieval.metric.to_string(),
            corpus_images: corpus.corpus.len(),
            indexed_images: corpus_vectors.ids.len(),
            queries: corpus.queries.len(),
            ranked_queries: rankings.len(),
            failures: failures.len(),
            cache_hits,
            timings_ms: watch.timings,
            metrics,
            output_dir: settings.output_dir.clone(),
        };
        output::write_json(&settings.output_dir.join(output::REPORT_FILE), &report)?;

        if let Some(store) = &store {
            store
                .finish_run(run_id, serde_json::to_string(&report)?)
                .await?;
        }

        tracing::info!(
            run = %run_id,
            indexed = report.indexed_images,
            ranked = report.ranked_queries,
            failures = report.failures,
            duration_ms = report.duration_ms,
            "Retrieval run finished"
        );
        Ok(report)
    }

    /// Recomputes benchmark metrics from the rankings of a previous run.
    pub fn evaluate_saved(settings: &PipelineSettings) -> Result<MetricsSummary> {
        let ground_truth = settings
            .ground_truth_path
            .as_ref()
            .ok_or(ConfigError::MissingPath("ground_truth_path"))?;
        let dataset = DatasetFile::load(ground_truth)?;
        let rankings = output::read_rankings(&settings.output_dir.join(output::RANKINGS_DIR))?;
        tracing::info!(rankings = rankings.len(), "Loaded saved rankings");

        // Saved rankings cover every indexed image unless top_k cut them short.
        let excluded: HashSet<ImageId> =
            output::read_failures(&settings.output_dir.join(output::FAILURES_FILE))?
                .into_iter()
                .filter(|f| f.role == ImageRole::Corpus)
                .map(|f| f.image_id)
                .collect();
        let expected = dataset
            .corpus_ids()
            .iter()
            .filter(|id| !excluded.contains(*id))
            .count();
        if let Some(short) = rankings.values().find(|r| r.len() < expected) {
            return Err(PipelineError::TruncatedRanking {
                query: short.query().clone(),
                ranked: short.len(),
                expected,
            });
        }

        let evaluation = evaluate_rankings(&dataset, &rankings, &settings.evaluation.pr_ranks)?;
        save_metrics_file(
            &evaluation.summary,
            settings.output_dir.join(output::METRICS_FILE),
        )?;
        Ok(evaluation.summary)
    }

    async fn open_store(&self) -> Result<Option<Arc<dyn EmbeddingStore>>> {
        if let Some(store) = &self.store {
            return Ok(Some(Arc::clone(store)));
        }
        if !self.settings.storage.cache_enabled {
            return Ok(None);
        }
        let path = self.settings.cache_path();
        tracing::info!(path = %path.display(), "Opening embedding cache");
        let store = SqliteEmbeddingStore::open(&path).await?;
        Ok(Some(Arc::new(store)))
    }

    /// Builds every embedder and checks pinned dimensions before any image is read.
    async fn build_embedders(&self) -> Result<EmbedderSet> {
        let specs = self.settings.embedder_specs();
        let preprocessor = ImagePreprocessor::new(
            self.settings.backbone.input_size,
            candle_core::Device::Cpu,
        );
        let set = blocking(move || {
            EmbedderSet::from_specs(&specs, preprocessor).map_err(PipelineError::from)
        })
        .await?;

        for kind in set.kinds() {
            let (Some(configured), Some(embedder)) =
                (self.settings.expected_dimension(kind), set.get(kind))
            else {
                continue;
            };
            if configured != embedder.dimension() {
                return Err(PipelineError::DimensionMismatch {
                    kind,
                    configured,
                    actual: embedder.dimension(),
                });
            }
        }
        Ok(set)
    }

    fn write_outputs(&self, rankings: &[Ranking], failures: &[FailureRecord]) -> Result<()> {
        let output_dir = &self.settings.output_dir;
        std::fs::create_dir_all(output_dir).map_err(|e| PipelineError::Output {
            path: output_dir.clone(),
            reason: e.to_string(),
        })?;
        let dir = output::write_rankings(output_dir, rankings, self.settings.retrieval.top_k)?;
        output::write_failures(&output_dir.join(output::FAILURES_FILE), failures)?;
        tracing::info!(
            rankings = rankings.len(),
            failures = failures.len(),
            dir = %dir.display(),
            "Wrote outputs"
        );
        Ok(())
    }

    fn evaluate(&self, dataset: &DatasetFile, rankings: &[Ranking]) -> Result<MetricsSummary> {
        let by_query: HashMap<ImageId, Ranking> = rankings
            .iter()
            .map(|r| (r.query().clone(), r.clone()))
            .collect();
        let evaluation =
            evaluate_rankings(dataset, &by_query, &self.settings.evaluation.pr_ranks)?;
        save_metrics_file(
            &evaluation.summary,
            self.settings.output_dir.join(output::METRICS_FILE),
        )?;
        Ok(evaluation.summary)
    }
}

impl std::fmt::Debug for RetrievalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalPipeline")
            .field("settings", &self.settings)
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Runs `f` on tokio's blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
}

fn build_pool(threads: Option<usize>) -> Result<Option<Arc<ThreadPool>>> {
    let Some(threads) = threads else {
        return Ok(None);
    };
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("retrieval-{i}"))
        .build()
        .map(|pool| Some(Arc::new(pool)))
        .map_err(|e| PipelineError::ThreadPool(e.to_string()))
}

/// Runs `f` inside `pool`, or on rayon's global pool.
fn install<T, F>(pool: Option<&ThreadPool>, f: F) -> T
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    match pool {
        Some(pool) => pool.install(f),
        None => f(),
    }
}

/// Key of an image in the embedding cache.
///
/// Queries often share ids with corpus images while being cropped, and a
/// file may be replaced between runs under the same name. The key carries
/// the role, the crop and a SHA-256 digest of the file bytes. `None` when
/// the file cannot be read; such images are embedded but never cached.
fn cache_key(role: ImageRole, record: &ImageRecord) -> Option<ImageId> {
    let bytes = std::fs::read(&record.path).ok()?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    let crop = match &record.bbox {
        Some(b) => format!("@{},{},{},{}", b.x1, b.y1, b.x2, b.y2),
        None => String::new(),
    };
    Some(ImageId(format!("{role}/{}{crop}#{digest}", record.id)))
}

/// Cache keys of `records`, hashed on the blocking pool.
async fn cache_keys(
    records: &[ImageRecord],
    role: ImageRole,
    pool: Option<Arc<ThreadPool>>,
) -> Result<HashMap<ImageId, ImageId>> {
    let records = records.to_vec();
    blocking(move || {
        Ok(install(pool.as_deref(), || {
            records
                .par_iter()
                .filter_map(|r| Some((r.id.clone(), cache_key(role, r)?)))
                .collect::<HashMap<_, _>>()
        }))
    })
    .await
}

/// Embeds `records` with every embedder, reusing cached vectors.
///
/// An image that fails under any embedder is left out of `ids`, so every
/// per-embedder index and ranking covers the same images.
async fn embed_images(
    embedders: &Arc<EmbedderSet>,
    fingerprints: &BTreeMap<AttentionKind, String>,
    store: Option<&dyn EmbeddingStore>,
    pool: Option<Arc<ThreadPool>>,
    records: &[ImageRecord],
    role: ImageRole,
) -> Result<EmbeddedImages> {
    let kinds = embedders.kinds();
    let ids: Vec<ImageId> = records.iter().map(|r| r.id.clone()).collect();
    let keys = match store {
        Some(_) => cache_keys(records, role, pool.clone()).await?,
        None => HashMap::new(),
    };
    let mut embedded = EmbeddedImages::default();

    for &kind in &kinds {
        let expected = embedders.get(kind).map(|e| e.dimension()).unwrap_or(0);
        let cached: HashMap<ImageId, FeatureVector> = match (store, fingerprints.get(&kind)) {
            (Some(store), Some(fingerprint)) => {
                let lookup: Vec<ImageId> = keys.values().cloned().collect();
                let mut found = store.load_embeddings(kind, fingerprint, &lookup).await?;
                ids.iter()
                    .filter_map(|id| Some((id.clone(), found.remove(keys.get(id)?)?)))
                    .collect()
            }
            _ => HashMap::new(),
        };
        if let Some((image, vector)) = cached.iter().find(|(_, v)| v.dimension() != expected) {
            return Err(PipelineError::CachedDimension {
                kind,
                image: image.clone(),
                expected,
                actual: vector.dimension(),
            });
        }
        embedded.cache_hits.insert(kind, cached.len());
        embedded.vectors.insert(kind, cached);
    }

    let jobs: Vec<EmbeddingJob> = records
        .iter()
        .filter_map(|record| {
            let missing: Vec<AttentionKind> = kinds
                .iter()
                .copied()
                .filter(|kind| {
                    embedded
                        .vectors
                        .get(kind)
                        .map_or(true, |cached| !cached.contains_key(&record.id))
                })
                .collect();
            (!missing.is_empty()).then(|| EmbeddingJob::new(record.clone(), missing))
        })
        .collect();
    tracing::info!(
        role = %role,
        images = records.len(),
        to_embed = jobs.len(),
        "Embedding images"
    );

    let results = {
        let embedders = Arc::clone(embedders);
        blocking(move || Ok(install(pool.as_deref(), || embedders.embed_batch(&jobs)))).await?
    };

    let mut fresh: BTreeMap<AttentionKind, Vec<(ImageId, FeatureVector)>> = BTreeMap::new();
    let mut failed = HashSet::new();
    for image in results {
        for (kind, outcome) in image.outcomes {
            match outcome {
                EmbeddingOutcome::Embedded(vector) => {
                    if let Some(key) = keys.get(&image.id) {
                        fresh
                            .entry(kind)
                            .or_default()
                            .push((key.clone(), vector.clone()));
                    }
                    if let Some(vectors) = embedded.vectors.get_mut(&kind) {
                        vectors.insert(image.id.clone(), vector);
                    }
                }
                EmbeddingOutcome::Failed { reason } => {
                    failed.insert(image.id.clone());
                    embedded.failures.push(FailureRecord {
                        role,
                        image_id: image.id.clone(),
                        embedder: kind,
                        reason,
                    });
                }
            }
        }
    }

    if let Some(store) = store {
        for (kind, vectors) in fresh {
            if let Some(fingerprint) = fingerprints.get(&kind) {
                store.store_embeddings(kind, fingerprint, vectors).await?;
            }
        }
    }

    embedded.ids = ids.into_iter().filter(|id| !failed.contains(id)).collect();
    if !failed.is_empty() {
        tracing::warn!(
            role = %role,
            failed = failed.len(),
            "Images excluded after embedding failures"
        );
    }
    Ok(embedded)
}

fn build_indexes(
    records: &[ImageRecord],
    embedded: &EmbeddedImages,
    ensembler: &Ensembler,
    settings: &PipelineSettings,
) -> Result<CorpusIndexes> {
    if embedded.ids.is_empty() {
        return Err(PipelineError::EmptyIndex);
    }
    let paths: HashMap<&ImageId, String> = records
        .iter()
        .map(|r| (&r.id, r.path.display().to_string()))
        .collect();
    let entry = |id: &ImageId, vector: FeatureVector| {
        let entry = IndexEntry::new(id.clone(), vector);
        match paths.get(id) {
            Some(path) => entry.with_metadata("path", path.clone()),
            None => entry,
        }
    };

    if ensembler.policy().fuses_vectors() {
        let mut fused = Vec::with_capacity(embedded.ids.len());
        for id in &embedded.ids {
            let vectors = embedded.vectors_of(id);
            fused.push((id, ensembler.concatenate(id, &vectors, settings.retrieval.metric)?));
        }
        let dimension = fused.first().map(|(_, v)| v.dimension()).unwrap_or(0);
        let mut builder = IndexBuilder::new(dimension)?;
        for (id, vector) in fused {
            builder.insert_entry(entry(id, vector))?;
        }
        tracing::info!(images = builder.len(), dimension, "Built concatenated index");
        return Ok(CorpusIndexes::Concatenated(Arc::new(builder.build())));
    }

    let mut indexes = BTreeMap::new();
    for (kind, vectors) in &embedded.vectors {
        let Some(dimension) = embedded
            .ids
            .iter()
            .find_map(|id| vectors.get(id))
            .map(FeatureVector::dimension)
        else {
            continue;
        };
        let mut builder = IndexBuilder::new(dimension)?;
        for id in &embedded.ids {
            if let Some(vector) = vectors.get(id) {
                builder.insert_entry(entry(id, vector.clone()))?;
            }
        }
        tracing::info!(
            embedder = %kind,
            images = builder.len(),
            dimension,
            "Built index"
        );
        indexes.insert(*kind, Arc::new(builder.build()));
    }
    Ok(CorpusIndexes::PerEmbedder(indexes))
}

/// Ranks every successfully embedded query and fuses per-embedder results.
async fn rank_queries(
    indexes: CorpusIndexes,
    queries: &EmbeddedImages,
    ensembler: Ensembler,
    settings: &PipelineSettings,
    pool: Option<Arc<ThreadPool>>,
) -> Result<Vec<Ranking>> {
    let metric = settings.retrieval.metric;
    let retriever = Retriever::new(metric);

    match indexes {
        CorpusIndexes::Concatenated(index) => {
            let query_vectors = queries
                .ids
                .iter()
                .map(|id| {
                    let vectors = queries.vectors_of(id);
                    Ok(QueryVector::new(
                        id.clone(),
                        ensembler.concatenate(id, &vectors, metric)?,
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            blocking(move || {
                Ok(install(pool.as_deref(), || {
                    retriever.rank_all(&query_vectors, &index)
                })?)
            })
            .await
        }
        CorpusIndexes::PerEmbedder(indexes) => {
            let per_kind: BTreeMap<AttentionKind, Vec<QueryVector>> = indexes
                .keys()
                .map(|kind| {
                    let vectors = queries
                        .ids
                        .iter()
                        .filter_map(|id| {
                            let vector = queries.vectors.get(kind)?.get(id)?;
                            Some(QueryVector::new(id.clone(), vector.clone()))
                        })
                        .collect();
                    (*kind, vectors)
                })
                .collect();

            blocking(move || {
                install(pool.as_deref(), || -> Result<Vec<Ranking>> {
                    let mut by_kind = BTreeMap::new();
                    for (kind, index) in &indexes {
                        let vectors = per_kind.get(kind).map(Vec::as_slice).unwrap_or(&[]);
                        by_kind.insert(*kind, retriever.rank_all(vectors, index)?);
                    }
                    fuse_per_query(&ensembler, by_kind)
                })
            })
            .await
        }
    }
}

/// Regroups per-embedder rankings by query and fuses each group.
fn fuse_per_query(
    ensembler: &Ensembler,
    by_kind: BTreeMap<AttentionKind, Vec<Ranking>>,
) -> Result<Vec<Ranking>> {
    let mut by_query: BTreeMap<ImageId, BTreeMap<AttentionKind, Ranking>> = BTreeMap::new();
    let mut order = Vec::new();
    for (kind, rankings) in by_kind {
        for ranking in rankings {
            let query = ranking.query().clone();
            let group = by_query.entry(query.clone()).or_insert_with(|| {
                order.push(query);
                BTreeMap::new()
            });
            group.insert(kind, ranking);
        }
    }

    order
        .iter()
        .filter_map(|query| by_query.get(query))
        .map(|group| ensembler.fuse(group).map_err(PipelineError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BoundingBox, ScoredImage};
    use crate::embedding::{Embedder, MockEmbedder};
    use crate::retrieval::{EnsembleWeights, FusionPolicy};
    use candle_core::{Device, Tensor};
    use image::{DynamicImage, Rgb, RgbImage};
    use std::path::Path;

    fn write_png(dir: &Path, name: &str, shade: u8) -> ImageRecord {
        let path = dir.join(format!("{name}.png"));
        DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([shade; 3])))
            .save(&path)
            .unwrap();
        ImageRecord::new(name, path)
    }

    fn constant(kind: AttentionKind, values: Vec<f32>) -> Arc<dyn Embedder> {
        let mut embedder = MockEmbedder::new();
        embedder.expect_kind().return_const(kind);
        embedder.expect_dimension().return_const(values.len());
        embedder
            .expect_embed()
            .returning(move |_| Ok(FeatureVector::new(values.clone())));
        Arc::new(embedder)
    }

    /// Embeds dark images and rejects bright ones.
    fn rejects_bright(kind: AttentionKind) -> Arc<dyn Embedder> {
        let mut embedder = MockEmbedder::new();
        embedder.expect_kind().return_const(kind);
        embedder.expect_dimension().return_const(2usize);
        embedder.expect_embed().returning(|pixels: &Tensor| {
            if pixels.max_all()?.to_scalar::<f32>()? > 0.5 {
                return Err(EmbeddingError::InputShape {
                    expected: "a dark image".to_string(),
                    actual: pixels.dims().to_vec(),
                });
            }
            Ok(FeatureVector::new(vec![0.0, 1.0]))
        });
        Arc::new(embedder)
    }

    fn embedders() -> Arc<EmbedderSet> {
        let mut set = EmbedderSet::new(ImagePreprocessor::new(8, Device::Cpu));
        set.insert(constant(AttentionKind::Channel, vec![1.0, 0.0, 0.0]));
        set.insert(rejects_bright(AttentionKind::Cbam));
        Arc::new(set)
    }

    fn ensembler(policy: FusionPolicy) -> Ensembler {
        let weights =
            EnsembleWeights::uniform([AttentionKind::Channel, AttentionKind::Cbam]).unwrap();
        Ensembler::new(policy, weights)
    }

    async fn embed(records: &[ImageRecord], role: ImageRole) -> EmbeddedImages {
        embed_images(&embedders(), &BTreeMap::new(), None, None, records, role)
            .await
            .unwrap()
    }

    fn ranking(query: &str, scores: &[(&str, f64)]) -> Ranking {
        Ranking::from_scores(
            ImageId::from(query),
            scores
                .iter()
                .map(|(id, score)| ScoredImage::new(*id, *score))
                .collect(),
        )
    }

    #[test]
    fn fuse_per_query_keeps_first_seen_query_order() {
        let weights =
            EnsembleWeights::uniform([AttentionKind::Channel, AttentionKind::Cbam]).unwrap();
        let ensembler = Ensembler::new(FusionPolicy::MinMaxScore, weights);

        let mut by_kind = BTreeMap::new();
        by_kind.insert(
            AttentionKind::Channel,
            vec![
                ranking("q2", &[("a", 1.0), ("b", 0.0)]),
                ranking("q1", &[("a", 0.0), ("b", 1.0)]),
            ],
        );
        by_kind.insert(
            AttentionKind::Cbam,
            vec![
                ranking("q2", &[("a", 5.0), ("b", 1.0)]),
                ranking("q1", &[("a", 1.0), ("b", 5.0)]),
            ],
        );

        let fused = fuse_per_query(&ensembler, by_kind).unwrap();
        let queries: Vec<&str> = fused.iter().map(|r| r.query().as_str()).collect();
        assert_eq!(queries, vec!["q2", "q1"]);
        assert_eq!(fused[0].top().unwrap().id, ImageId::from("a"));
        assert_eq!(fused[1].top().unwrap().id, ImageId::from("b"));
    }

    #[test]
    fn pool_runs_closure() {
        let pool = build_pool(Some(2)).unwrap();
        let threads = install(pool.as_deref(), rayon::current_num_threads);
        assert_eq!(threads, 2);
        assert!(build_pool(None).unwrap().is_none());
    }

    #[test]
    fn stopwatch_records_stages() {
        let mut watch = Stopwatch::new();
        watch.lap("one");
        watch.lap("two");
        assert_eq!(
            watch.timings.keys().cloned().collect::<Vec<_>>(),
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[tokio::test]
    async fn image_failing_one_embedder_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            write_png(dir.path(), "dark", 10),
            write_png(dir.path(), "bright", 250),
        ];

        let embedded = embed(&records, ImageRole::Corpus).await;
        assert_eq!(embedded.ids, vec![ImageId::from("dark")]);
        assert_eq!(embedded.failures.len(), 1);
        let failure = &embedded.failures[0];
        assert_eq!(failure.role, ImageRole::Corpus);
        assert_eq!(failure.image_id, ImageId::from("bright"));
        assert_eq!(failure.embedder, AttentionKind::Cbam);
        assert_eq!(embedded.vectors_of(&ImageId::from("bright")).len(), 1);
        assert_eq!(embedded.vectors_of(&ImageId::from("dark")).len(), 2);
        assert!(embedded.cache_hits.values().all(|hits| *hits == 0));
    }

    #[tokio::test]
    async fn indexes_and_rankings_skip_dropped_images() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = vec![
            write_png(dir.path(), "dark", 10),
            write_png(dir.path(), "bright", 250),
            write_png(dir.path(), "dim", 40),
        ];
        let queries = vec![write_png(dir.path(), "q", 20)];
        let settings = PipelineSettings::default();
        let corpus_vectors = embed(&corpus, ImageRole::Corpus).await;
        let query_vectors = embed(&queries, ImageRole::Query).await;

        let min_max = ensembler(FusionPolicy::MinMaxScore);
        let indexes = build_indexes(&corpus, &corpus_vectors, &min_max, &settings).unwrap();
        let CorpusIndexes::PerEmbedder(per_kind) = &indexes else {
            panic!("expected one index per embedder");
        };
        assert_eq!(per_kind.len(), 2);
        for index in per_kind.values() {
            let ids: Vec<&str> = index.ids().map(ImageId::as_str).collect();
            assert_eq!(ids, vec!["dark", "dim"]);
        }

        let rankings = rank_queries(indexes, &query_vectors, min_max, &settings, None)
            .await
            .unwrap();
        assert_eq!(rankings.len(), 1);
        let mut ranked: Vec<&str> = rankings[0].ids().map(ImageId::as_str).collect();
        ranked.sort_unstable();
        assert_eq!(ranked, vec!["dark", "dim"]);

        let concatenated = build_indexes(
            &corpus,
            &corpus_vectors,
            &ensembler(FusionPolicy::Concatenate),
            &settings,
        )
        .unwrap();
        let CorpusIndexes::Concatenated(index) = concatenated else {
            panic!("expected a concatenated index");
        };
        assert_eq!(index.len(), 2);
        assert_eq!(index.dimension(), 5);
        assert!(!index.contains(&ImageId::from("bright")));
    }

    #[tokio::test]
    async fn all_corpus_images_failing_is_an_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = vec![write_png(dir.path(), "bright", 250)];
        let embedded = embed(&corpus, ImageRole::Corpus).await;
        let result = build_indexes(
            &corpus,
            &embedded,
            &ensembler(FusionPolicy::MinMaxScore),
            &PipelineSettings::default(),
        );
        assert!(matches!(result, Err(PipelineError::EmptyIndex)));
    }

    #[test]
    fn cache_keys_separate_roles_crops_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let whole = write_png(dir.path(), "a", 10);
        let cropped = whole.clone().with_bbox(BoundingBox::new(1.0, 1.0, 5.0, 5.0));

        let corpus_key = cache_key(ImageRole::Corpus, &whole).unwrap();
        let query_key = cache_key(ImageRole::Query, &whole).unwrap();
        let cropped_key = cache_key(ImageRole::Query, &cropped).unwrap();
        assert!(corpus_key.as_str().starts_with("corpus/a#"));
        assert!(cropped_key.as_str().starts_with("query/a@1,1,5,5#"));
        assert_ne!(corpus_key, query_key);
        assert_ne!(query_key, cropped_key);
        assert_eq!(cache_key(ImageRole::Corpus, &whole), Some(corpus_key.clone()));

        write_png(dir.path(), "a", 200);
        assert_ne!(cache_key(ImageRole::Corpus, &whole), Some(corpus_key));

        let missing = ImageRecord::new("gone", dir.path().join("gone.png"));
        assert_eq!(cache_key(ImageRole::Corpus, &missing), None);
    }
}
