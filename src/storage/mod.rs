//! Embedding cache and run log.
//!
//! This module provides the storage layer of the pipeline:
//!
//! - SQLite database holding previously computed embeddings and run records
//! - Async-safe database operations via tokio::task::spawn_blocking
//! - The [`EmbeddingStore`] trait the pipeline talks to

mod database;
pub mod queries;
mod schema;

pub use database::{Database, Result, StorageError};
pub use queries::runs::RunRecord;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::ImageId;
use crate::embedding::{AttentionKind, FeatureVector};

/// Persistence used by the pipeline for cached vectors and run records.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Cached vectors of `ids` produced by `kind` under `fingerprint`.
    async fn load_embeddings(
        &self,
        kind: AttentionKind,
        fingerprint: &str,
        ids: &[ImageId],
    ) -> Result<HashMap<ImageId, FeatureVector>>;

    /// Saves freshly computed vectors, replacing older rows of the same images.
    async fn store_embeddings(
        &self,
        kind: AttentionKind,
        fingerprint: &str,
        vectors: Vec<(ImageId, FeatureVector)>,
    ) -> Result<usize>;

    /// Records the start of a run with its settings.
    async fn begin_run(&self, id: Uuid, settings_json: String) -> Result<()>;

    /// Attaches the summary to a started run.
    async fn finish_run(&self, id: Uuid, summary_json: String) -> Result<()>;
}

/// [`EmbeddingStore`] backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteEmbeddingStore {
    db: Database,
}

impl SqliteEmbeddingStore {
    /// Opens (or creates) the cache database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::open(path).await?;
        Ok(Self { db })
    }

    /// Creates a store with an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self { db })
    }

    /// Returns a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Wraps the store in an Arc for shared ownership.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl EmbeddingStore for SqliteEmbeddingStore {
    async fn load_embeddings(
        &self,
        kind: AttentionKind,
        fingerprint: &str,
        ids: &[ImageId],
    ) -> Result<HashMap<ImageId, FeatureVector>> {
        let found = queries::embeddings::get_many(&self.db, kind.id(), fingerprint, ids).await?;
        tracing::debug!(
            embedder = %kind,
            requested = ids.len(),
            hits = found.len(),
            "Loaded cached embeddings"
        );
        Ok(found)
    }

    async fn store_embeddings(
        &self,
        kind: AttentionKind,
        fingerprint: &str,
        vectors: Vec<(ImageId, FeatureVector)>,
    ) -> Result<usize> {
        if vectors.is_empty() {
            return Ok(0);
        }
        let stale = queries::embeddings::delete_stale(&self.db, kind.id(), fingerprint).await?;
        if stale > 0 {
            tracing::info!(embedder = %kind, rows = stale, "Dropped stale cached embeddings");
        }
        queries::embeddings::upsert_many(&self.db, kind.id(), fingerprint, vectors).await
    }

    async fn begin_run(&self, id: Uuid, settings_json: String) -> Result<()> {
        queries::runs::insert(&self.db, id, chrono::Utc::now(), settings_json).await
    }

    async fn finish_run(&self, id: Uuid, summary_json: String) -> Result<()> {
        if !queries::runs::finish(&self.db, id, summary_json).await? {
            tracing::warn!(run = %id, "Finished a run that was never started");
        }
        Ok(())
    }
}
