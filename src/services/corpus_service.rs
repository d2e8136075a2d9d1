//! Corpus and query discovery.
//!
//! Images come from one of three sources:
//!
//! - a directory, scanned recursively for `jpg`, `jpeg` and `png` files;
//!   the file stem is the image id and records are sorted by id
//! - a manifest file with one `id<TAB>path[<TAB>x1,y1,x2,y2]` or bare
//!   `path` per line; relative paths are resolved against the manifest's
//!   directory and `#` starts a comment
//! - a Revisited Oxford/Paris dataset file, whose image lists are resolved
//!   inside the corpus directory

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::PipelineSettings;
use crate::domain::{BoundingBox, ImageId, ImageRecord};
use crate::evaluation::{DatasetFile, EvaluationError};

/// File extensions picked up by a directory scan.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Errors raised while discovering images.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("{path} does not exist")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("{path}:{line}: {reason}")]
    Manifest {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("image id {id} appears more than once in {path}")]
    DuplicateId { id: ImageId, path: PathBuf },

    #[error("no images found in {path}")]
    Empty { path: PathBuf },

    #[error("image file {path} for {id} is missing: {reason}")]
    MissingImage {
        id: ImageId,
        path: PathBuf,
        reason: String,
    },

    #[error("dataset error: {0}")]
    Dataset(#[from] EvaluationError),
}

pub type Result<T> = std::result::Result<T, CorpusError>;

/// Corpus and query records of one run.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub corpus: Vec<ImageRecord>,
    pub queries: Vec<ImageRecord>,
    /// Ground truth, when the run is a benchmark evaluation.
    pub dataset: Option<DatasetFile>,
}

/// Resolves settings into image records.
pub struct CorpusService;

impl CorpusService {
    /// Loads the corpus and queries named by `settings`.
    ///
    /// Every referenced image file must exist.
    pub fn load(settings: &PipelineSettings) -> Result<Corpus> {
        let corpus_path = settings.corpus_path.as_deref().ok_or_else(|| CorpusError::Missing {
            path: PathBuf::from("<corpus_path>"),
        })?;

        let corpus = match &settings.ground_truth_path {
            Some(ground_truth) => {
                let dataset = DatasetFile::load(ground_truth)?;
                let images_dir = match settings.query_source() {
                    Some(dir) if dir.is_dir() => dir.to_path_buf(),
                    _ => corpus_path.to_path_buf(),
                };
                Corpus {
                    corpus: dataset.corpus_records(corpus_path),
                    queries: dataset.query_records(&images_dir),
                    dataset: Some(dataset),
                }
            }
            None => {
                let query_path = settings.query_source().ok_or_else(|| CorpusError::Missing {
                    path: PathBuf::from("<query_path>"),
                })?;
                Corpus {
                    corpus: load_images(corpus_path)?,
                    queries: load_images(query_path)?,
                    dataset: None,
                }
            }
        };

        if corpus.corpus.is_empty() {
            return Err(CorpusError::Empty {
                path: corpus_path.to_path_buf(),
            });
        }
        check_files_exist(&corpus.corpus)?;
        check_files_exist(&corpus.queries)?;

        tracing::info!(
            corpus = corpus.corpus.len(),
            queries = corpus.queries.len(),
            benchmark = corpus.dataset.is_some(),
            "Loaded image lists"
        );
        Ok(corpus)
    }
}

/// Loads records from a directory or a manifest file.
pub fn load_images(path: &Path) -> Result<Vec<ImageRecord>> {
    if !path.exists() {
        return Err(CorpusError::Missing {
            path: path.to_path_buf(),
        });
    }
    if path.is_dir() {
        scan_directory(path)
    } else {
        read_manifest(path)
    }
}

/// Recursively collects image files under `dir`, sorted by id.
pub fn scan_directory(dir: &Path) -> Result<Vec<ImageRecord>> {
    let mut records = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| CorpusError::Io {
            path: e.path().unwrap_or(dir).to_path_buf(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() || !has_image_extension(entry.path()) {
            continue;
        }
        match entry.path().file_stem().and_then(|s| s.to_str()) {
            Some(stem) => records.push(ImageRecord::new(stem, entry.path())),
            None => tracing::warn!(
                path = %entry.path().display(),
                "Skipping image whose name is not valid UTF-8"
            ),
        }
    }

    records.sort_by(|a, b| a.id.cmp(&b.id));
    if let Some(pair) = records.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(CorpusError::DuplicateId {
            id: pair[1].id.clone(),
            path: dir.to_path_buf(),
        });
    }
    Ok(records)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reads a manifest file, keeping its line order.
pub fn read_manifest(path: &Path) -> Result<Vec<ImageRecord>> {
    let contents = std::fs::read_to_string(path).map_err(|e| CorpusError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for (i, raw) in contents.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let record = parse_manifest_line(line, base).map_err(|reason| CorpusError::Manifest {
            path: path.to_path_buf(),
            line: i + 1,
            reason,
        })?;
        if !seen.insert(record.id.clone()) {
            return Err(CorpusError::DuplicateId {
                id: record.id,
                path: path.to_path_buf(),
            });
        }
        records.push(record);
    }
    Ok(records)
}

fn parse_manifest_line(line: &str, base: &Path) -> std::result::Result<ImageRecord, String> {
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    let resolve = |p: &str| {
        let p = Path::new(p);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            base.join(p)
        }
    };

    match fields.as_slice() {
        [path] => {
            let path = resolve(*path);
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| format!("cannot derive an id from {}", path.display()))?
                .to_string();
            Ok(ImageRecord::new(id, path))
        }
        [id, path] => Ok(ImageRecord::new(*id, resolve(*path))),
        [id, path, bbox] => {
            Ok(ImageRecord::new(*id, resolve(*path)).with_bbox(parse_bbox(bbox)?))
        }
        _ => Err(format!("expected 1 to 3 tab-separated fields, found {}", fields.len())),
    }
}

fn parse_bbox(value: &str) -> std::result::Result<BoundingBox, String> {
    let corners = value
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid bounding box {value:?}: {e}"))?;
    match corners.as_slice() {
        [x1, y1, x2, y2] => Ok(BoundingBox::new(*x1, *y1, *x2, *y2)),
        _ => Err(format!("bounding box {value:?} needs 4 values")),
    }
}

/// Fails on the first record whose file cannot be found.
pub fn check_files_exist(records: &[ImageRecord]) -> Result<()> {
    for record in records {
        if let Err(e) = std::fs::metadata(&record.path) {
            return Err(CorpusError::MissingImage {
                id: record.id.clone(),
                path: record.path.clone(),
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}
