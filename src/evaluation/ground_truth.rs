//! Revisited Oxford/Paris ground truth.
//!
//! Dataset files list the query images (`qimlist`), the corpus images
//! (`imlist`) and one ground-truth entry per query. Indices in `easy`,
//! `hard` and `junk` point into `imlist` and are 0-based.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::{EvaluationError, Result};
use crate::domain::{BoundingBox, ImageId, ImageRecord};

/// Image file extension used by both benchmarks.
pub const IMAGE_EXTENSION: &str = "jpg";

/// Ground truth for one query, as stored in the dataset file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryGroundTruth {
    #[serde(default)]
    pub easy: Vec<usize>,
    #[serde(default)]
    pub hard: Vec<usize>,
    #[serde(default)]
    pub junk: Vec<usize>,
    /// Query crop as `[x1, y1, x2, y2]`.
    #[serde(default)]
    pub bbx: Option<[f32; 4]>,
}

/// Parsed dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetFile {
    pub qimlist: Vec<String>,
    pub imlist: Vec<String>,
    pub gnd: Vec<QueryGroundTruth>,
}

impl DatasetFile {
    /// Reads and validates a dataset file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| EvaluationError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let dataset: Self =
            serde_json::from_str(&contents).map_err(|e| EvaluationError::GroundTruth {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        dataset.validate().map_err(|reason| EvaluationError::GroundTruth {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(dataset)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.gnd.len() != self.qimlist.len() {
            return Err(format!(
                "{} ground-truth entries for {} queries",
                self.gnd.len(),
                self.qimlist.len()
            ));
        }
        let corpus_size = self.imlist.len();
        for (query, gt) in self.gnd.iter().enumerate() {
            let out_of_range = gt
                .easy
                .iter()
                .chain(&gt.hard)
                .chain(&gt.junk)
                .find(|&&i| i >= corpus_size);
            if let Some(i) = out_of_range {
                return Err(format!(
                    "query {query} references image {i}, corpus has {corpus_size}"
                ));
            }
        }
        Ok(())
    }

    /// Corpus records resolved as `<images_dir>/<name>.jpg`.
    pub fn corpus_records(&self, images_dir: &Path) -> Vec<ImageRecord> {
        self.imlist
            .iter()
            .map(|name| ImageRecord::new(name.as_str(), image_path(images_dir, name)))
            .collect()
    }

    /// Query records, cropped to their ground-truth box when one is given.
    pub fn query_records(&self, images_dir: &Path) -> Vec<ImageRecord> {
        self.qimlist
            .iter()
            .zip(&self.gnd)
            .map(|(name, gt)| {
                let record = ImageRecord::new(name.as_str(), image_path(images_dir, name));
                match gt.bbx {
                    Some(corners) => record.with_bbox(BoundingBox::from_corners(corners)),
                    None => record,
                }
            })
            .collect()
    }

    pub fn query_ids(&self) -> Vec<ImageId> {
        self.qimlist.iter().map(|n| ImageId::from(n.as_str())).collect()
    }

    pub fn corpus_ids(&self) -> Vec<ImageId> {
        self.imlist.iter().map(|n| ImageId::from(n.as_str())).collect()
    }

    /// Ground truth of every query under `protocol`.
    pub fn protocol_ground_truth(&self, protocol: Protocol) -> Vec<ProtocolGroundTruth> {
        self.gnd
            .iter()
            .map(|gt| ProtocolGroundTruth::from_query(gt, protocol))
            .collect()
    }
}

fn image_path(images_dir: &Path, name: &str) -> PathBuf {
    images_dir.join(format!("{name}.{IMAGE_EXTENSION}"))
}

/// Difficulty protocol of the Revisited benchmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Easy,
    Medium,
    Hard,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Easy, Protocol::Medium, Protocol::Hard];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Positive and ignored corpus indices for one query under one protocol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolGroundTruth {
    /// Images that count as correct answers.
    pub ok: BTreeSet<usize>,
    /// Images removed from the ranking before scoring.
    pub junk: BTreeSet<usize>,
}

impl ProtocolGroundTruth {
    pub fn from_query(gt: &QueryGroundTruth, protocol: Protocol) -> Self {
        let set = |lists: &[&Vec<usize>]| -> BTreeSet<usize> {
            lists.iter().flat_map(|l| l.iter().copied()).collect()
        };
        match protocol {
            Protocol::Easy => Self {
                ok: set(&[&gt.easy]),
                junk: set(&[&gt.junk, &gt.hard]),
            },
            Protocol::Medium => Self {
                ok: set(&[&gt.easy, &gt.hard]),
                junk: set(&[&gt.junk]),
            },
            Protocol::Hard => Self {
                ok: set(&[&gt.hard]),
                junk: set(&[&gt.junk, &gt.easy]),
            },
        }
    }
}

/// Known benchmark names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetName {
    #[serde(rename = "roxford5k")]
    ROxford5k,
    #[serde(rename = "rparis6k")]
    RParis6k,
}

impl DatasetName {
    pub fn id(&self) -> &'static str {
        match self {
            Self::ROxford5k => "roxford5k",
            Self::RParis6k => "rparis6k",
        }
    }

    /// Directory holding the benchmark's images.
    pub fn image_dir(&self) -> &'static str {
        match self {
            Self::ROxford5k => "oxford5k_images",
            Self::RParis6k => "paris6k_images",
        }
    }

    /// File name of the JSON ground truth.
    pub fn ground_truth_file(&self) -> String {
        format!("gnd_{}.json", self.id())
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for DatasetName {
    type Err = EvaluationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roxford5k" => Ok(Self::ROxford5k),
            "rparis6k" => Ok(Self::RParis6k),
            other => Err(EvaluationError::UnknownDataset(other.to_string())),
        }
    }
}
