//! SQL schema definitions as const strings.
//!
//! Contains the SQLite schema of the embedding cache and run log.

/// SQL to create the embeddings table.
///
/// One row per embedder and image. `fingerprint` identifies the weights,
/// backbone and input size that produced `vector` (little-endian `f32`).
pub const CREATE_EMBEDDINGS: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    embedder TEXT NOT NULL,
    image_id TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (embedder, image_id)
)
"#;

/// SQL to create the embeddings index.
pub const CREATE_EMBEDDINGS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_embeddings_fingerprint ON embeddings(embedder, fingerprint)
"#;

/// SQL to create the runs table.
pub const CREATE_RUNS: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    settings_json TEXT NOT NULL,
    summary_json TEXT
)
"#;

/// SQL to create the runs index.
pub const CREATE_RUNS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at DESC)
"#;

/// Returns all schema creation statements in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_EMBEDDINGS,
        CREATE_EMBEDDINGS_INDEX,
        CREATE_RUNS,
        CREATE_RUNS_INDEX,
    ]
}
