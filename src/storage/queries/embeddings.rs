//! Cached embedding operations.
//!
//! Vectors are stored as little-endian `f32` blobs next to the fingerprint
//! of the embedder configuration that produced them.

use chrono::Utc;
use rusqlite::params;
use std::collections::{HashMap, HashSet};

use crate::domain::ImageId;
use crate::embedding::FeatureVector;
use crate::storage::database::{Database, Result, StorageError};

/// Inserts or replaces vectors for one embedder in a single transaction.
pub async fn upsert_many(
    db: &Database,
    embedder: &str,
    fingerprint: &str,
    vectors: Vec<(ImageId, FeatureVector)>,
) -> Result<usize> {
    let embedder = embedder.to_string();
    let fingerprint = fingerprint.to_string();

    db.transaction(move |tx| {
        let now = Utc::now().to_rfc3339();
        let mut stmt = tx.prepare(
            r#"
            INSERT OR REPLACE INTO embeddings (
                embedder, image_id, fingerprint, dimension, vector, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )?;

        for (id, vector) in &vectors {
            stmt.execute(params![
                embedder,
                id.as_str(),
                fingerprint,
                vector.dimension() as i64,
                vector.to_le_bytes(),
                now,
            ])?;
        }

        Ok(vectors.len())
    })
    .await
}

/// Loads the cached vectors of `ids` that were produced under `fingerprint`.
///
/// Ids without a matching row are absent from the result.
pub async fn get_many(
    db: &Database,
    embedder: &str,
    fingerprint: &str,
    ids: &[ImageId],
) -> Result<HashMap<ImageId, FeatureVector>> {
    let embedder = embedder.to_string();
    let fingerprint = fingerprint.to_string();
    let wanted: HashSet<ImageId> = ids.iter().cloned().collect();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT image_id, dimension, vector FROM embeddings
            WHERE embedder = ?1 AND fingerprint = ?2
            "#,
        )?;
        let rows = stmt.query_map(params![embedder, fingerprint], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut found = HashMap::new();
        for row in rows {
            let (image_id, dimension, blob) = row?;
            let id = ImageId::from(image_id);
            if !wanted.contains(&id) {
                continue;
            }

            let vector = FeatureVector::from_le_bytes(&blob)
                .filter(|v| v.dimension() as i64 == dimension)
                .ok_or_else(|| StorageError::CorruptVector {
                    embedder: embedder.clone(),
                    image_id: id.to_string(),
                    reason: format!("{} bytes for dimension {dimension}", blob.len()),
                })?;
            found.insert(id, vector);
        }
        Ok(found)
    })
    .await
}

/// Removes rows of `embedder` written under any other fingerprint.
pub async fn delete_stale(db: &Database, embedder: &str, fingerprint: &str) -> Result<usize> {
    let embedder = embedder.to_string();
    let fingerprint = fingerprint.to_string();

    db.with_conn(move |conn| {
        let deleted = conn.execute(
            "DELETE FROM embeddings WHERE embedder = ?1 AND fingerprint != ?2",
            params![embedder, fingerprint],
        )?;
        Ok(deleted)
    })
    .await
}

/// Counts cached vectors of one embedder.
pub async fn count(db: &Database, embedder: &str) -> Result<usize> {
    let embedder = embedder.to_string();

    db.with_conn(move |conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE embedder = ?1",
            params![embedder],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    #[tokio::test]
    async fn stored_blob_is_little_endian_f32() {
        let db = Database::open_in_memory().await.unwrap();
        upsert_many(&db, "se", "fp", vec![(ImageId::from("a"), vector(&[1.0, -2.5]))])
            .await
            .unwrap();

        let blob: Vec<u8> = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT vector FROM embeddings", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(&blob[4..], &(-2.5f32).to_le_bytes());
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let db = Database::open_in_memory().await.unwrap();
        let rows = vec![
            (ImageId::from("a"), vector(&[1.0, 2.0])),
            (ImageId::from("b"), vector(&[3.0, 4.0])),
        ];
        assert_eq!(upsert_many(&db, "cbam", "fp1", rows).await.unwrap(), 2);

        let found = get_many(&db, "cbam", "fp1", &[ImageId::from("a"), ImageId::from("z")])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&ImageId::from("a")].values(), &[1.0, 2.0]);
    }

    #[tokio::test]
    async fn other_fingerprint_is_a_miss() {
        let db = Database::open_in_memory().await.unwrap();
        upsert_many(&db, "cbam", "fp1", vec![(ImageId::from("a"), vector(&[1.0]))])
            .await
            .unwrap();

        let found = get_many(&db, "cbam", "fp2", &[ImageId::from("a")]).await.unwrap();
        assert!(found.is_empty());
        let found = get_many(&db, "channel", "fp1", &[ImageId::from("a")]).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let db = Database::open_in_memory().await.unwrap();
        let id = ImageId::from("a");
        upsert_many(&db, "se", "old", vec![(id.clone(), vector(&[1.0]))])
            .await
            .unwrap();
        upsert_many(&db, "se", "new", vec![(id.clone(), vector(&[9.0, 9.0]))])
            .await
            .unwrap();

        assert_eq!(count(&db, "se").await.unwrap(), 1);
        let found = get_many(&db, "se", "new", &[id.clone()]).await.unwrap();
        assert_eq!(found[&id].dimension(), 2);
    }

    #[tokio::test]
    async fn delete_stale_keeps_current_fingerprint() {
        let db = Database::open_in_memory().await.unwrap();
        upsert_many(&db, "se", "old", vec![(ImageId::from("a"), vector(&[1.0]))])
            .await
            .unwrap();
        upsert_many(&db, "se", "new", vec![(ImageId::from("b"), vector(&[1.0]))])
            .await
            .unwrap();

        assert_eq!(delete_stale(&db, "se", "new").await.unwrap(), 1);
        assert_eq!(count(&db, "se").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn corrupt_blob_is_reported() {
        let db = Database::open_in_memory().await.unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO embeddings VALUES ('se', 'a', 'fp', 3, x'0000', '2025-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let err = get_many(&db, "se", "fp", &[ImageId::from("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CorruptVector { .. }));
    }
}
