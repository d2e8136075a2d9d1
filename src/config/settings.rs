//! Pipeline settings and configuration types.
//!
//! Settings are read from a JSON file, by default
//! `~/.config/landmark-retrieval/settings.json` (or the platform
//! equivalent). Every section has defaults, so a file only needs the
//! fields it changes.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::embedding::{
    AttentionKind, BackboneConfig, EmbedderSpec, WeightSource, DEFAULT_HEAD_DIM,
    DEFAULT_INPUT_SIZE,
};
use crate::evaluation::{DatasetName, DEFAULT_PR_RANKS};
use crate::retrieval::{EnsembleWeights, FusionPolicy, SimilarityMetric, DEFAULT_RRF_K};

/// File name of the settings file inside the config directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("invalid settings file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("no embedders configured")]
    NoEmbedders,

    #[error("embedder {0} is listed more than once")]
    DuplicateEmbedder(AttentionKind),

    #[error("weight given for {0}, which is not a configured embedder")]
    UnknownWeight(AttentionKind),

    #[error("invalid ensemble weights: {0}")]
    Weights(String),

    #[error("{0} is required")]
    MissingPath(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("no platform configuration directory available")]
    NoConfigDir,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Embedders to run, in any order.
    pub embedders: Vec<AttentionKind>,
    /// Ensemble weight per embedder. Missing entries weigh 1.0.
    pub weights: BTreeMap<AttentionKind, f32>,
    /// Corpus images: a directory or a manifest file.
    pub corpus_path: Option<PathBuf>,
    /// Query images: a directory or a manifest file.
    pub query_path: Option<PathBuf>,
    /// Revisited Oxford/Paris dataset file. When set, the corpus and
    /// queries come from its image lists.
    pub ground_truth_path: Option<PathBuf>,
    /// Where rankings, metrics and reports are written.
    pub output_dir: PathBuf,
    pub backbone: BackboneSettings,
    /// Per-embedder overrides.
    pub modules: BTreeMap<AttentionKind, ModuleSettings>,
    pub retrieval: RetrievalSettings,
    pub fusion: FusionSettings,
    pub evaluation: EvaluationSettings,
    pub storage: StorageSettings,
    pub parallelism: ParallelismSettings,
    /// Seed for synthetic weights of modules without a weights file.
    pub seed: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            embedders: vec![
                AttentionKind::SqueezeExcitation,
                AttentionKind::Cbam,
                AttentionKind::Channel,
            ],
            weights: BTreeMap::new(),
            corpus_path: None,
            query_path: None,
            ground_truth_path: None,
            output_dir: PathBuf::from("eval"),
            backbone: BackboneSettings::default(),
            modules: BTreeMap::new(),
            retrieval: RetrievalSettings::default(),
            fusion: FusionSettings::default(),
            evaluation: EvaluationSettings::default(),
            storage: StorageSettings::default(),
            parallelism: ParallelismSettings::default(),
            seed: 42,
        }
    }
}

/// Backbone architecture and input resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneSettings {
    pub preset: BackbonePreset,
    /// Side of the square network input in pixels.
    pub input_size: u32,
}

impl Default for BackboneSettings {
    fn default() -> Self {
        Self {
            preset: BackbonePreset::Resnet101,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

/// Named backbone configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackbonePreset {
    Resnet101,
    Resnet50,
    /// Reduced network for smoke runs.
    Tiny,
}

impl BackbonePreset {
    pub fn config(&self) -> BackboneConfig {
        match self {
            Self::Resnet101 => BackboneConfig::resnet101(),
            Self::Resnet50 => BackboneConfig::resnet50(),
            Self::Tiny => BackboneConfig::tiny(),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::Resnet101 => "resnet101",
            Self::Resnet50 => "resnet50",
            Self::Tiny => "tiny",
        }
    }
}

impl fmt::Display for BackbonePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for BackbonePreset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resnet101" => Ok(Self::Resnet101),
            "resnet50" => Ok(Self::Resnet50),
            "tiny" => Ok(Self::Tiny),
            other => Err(format!("unknown backbone preset: {other}")),
        }
    }
}

/// Overrides for one embedder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    /// Trained parameters in safetensors format.
    pub weights_path: Option<PathBuf>,
    /// Width of the projection head, for modules that have one.
    pub head_dim: Option<usize>,
    /// Expected output dimension; checked against the built embedder.
    pub dimension: Option<usize>,
}

/// Ranking options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub metric: SimilarityMetric,
    /// Truncate written rankings to this many entries.
    pub top_k: Option<usize>,
}

/// Ensembling options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    pub policy: FusionPolicy,
    /// Damping constant of reciprocal rank fusion.
    pub rrf_k: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            policy: FusionPolicy::default(),
            rrf_k: DEFAULT_RRF_K,
        }
    }
}

/// Benchmark evaluation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// Cut-offs for precision and recall.
    pub pr_ranks: Vec<usize>,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            pr_ranks: DEFAULT_PR_RANKS.to_vec(),
        }
    }
}

/// Embedding cache options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub cache_enabled: bool,
    /// Cache database; defaults to `embeddings.sqlite` in the output directory.
    pub cache_path: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_path: None,
        }
    }
}

/// Worker pool options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelismSettings {
    /// Worker threads for embedding and ranking; rayon's default when unset.
    pub threads: Option<usize>,
}

impl PipelineSettings {
    /// Settings pointing at a Revisited benchmark laid out under `data_dir`.
    pub fn for_dataset(dataset: DatasetName, data_dir: &Path) -> Self {
        let images = data_dir.join(dataset.image_dir());
        Self {
            corpus_path: Some(images.clone()),
            query_path: Some(images),
            ground_truth_path: Some(data_dir.join(dataset.ground_truth_file())),
            ..Self::default()
        }
    }

    /// Platform default location of the settings file.
    pub fn default_path() -> Result<PathBuf> {
        ProjectDirs::from("org", "landmark-retrieval", "landmark-retrieval")
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Reads settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Reads settings from `path`, or from the default location when it
    /// exists, falling back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Ok(default) if default.exists() => Self::load(default),
            _ => Ok(Self::default()),
        }
    }

    /// Writes settings as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_error = |e: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, json).map_err(io_error)
    }

    /// Checks the settings for values no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.embedders.is_empty() {
            return Err(ConfigError::NoEmbedders);
        }
        let mut seen = BTreeSet::new();
        for kind in &self.embedders {
            if !seen.insert(*kind) {
                return Err(ConfigError::DuplicateEmbedder(*kind));
            }
        }
        if let Some(kind) = self.weights.keys().find(|k| !seen.contains(k)) {
            return Err(ConfigError::UnknownWeight(*kind));
        }
        self.ensemble_weights()?;

        if self.corpus_path.is_none() {
            return Err(ConfigError::MissingPath("corpus_path"));
        }
        if self.query_path.is_none() && self.ground_truth_path.is_none() {
            return Err(ConfigError::MissingPath("query_path"));
        }

        if self.backbone.input_size == 0 {
            return Err(invalid("backbone.input_size", "must be positive"));
        }
        for (kind, module) in &self.modules {
            if module.head_dim == Some(0) {
                return Err(invalid("modules.head_dim", format!("{kind}: must be positive")));
            }
            if module.dimension == Some(0) {
                return Err(invalid("modules.dimension", format!("{kind}: must be positive")));
            }
        }
        if self.retrieval.top_k == Some(0) {
            return Err(invalid("retrieval.top_k", "must be positive"));
        }
        if !(self.fusion.rrf_k.is_finite() && self.fusion.rrf_k > 0.0) {
            return Err(invalid("fusion.rrf_k", format!("{} is not positive", self.fusion.rrf_k)));
        }
        if self.evaluation.pr_ranks.is_empty() || self.evaluation.pr_ranks.contains(&0) {
            return Err(invalid("evaluation.pr_ranks", "ranks must be positive and non-empty"));
        }
        if self.parallelism.threads == Some(0) {
            return Err(invalid("parallelism.threads", "must be positive"));
        }
        Ok(())
    }

    /// Weight of every configured embedder, 1.0 where none is given.
    pub fn ensemble_weights(&self) -> Result<EnsembleWeights> {
        let weights = self
            .embedders
            .iter()
            .map(|kind| (*kind, self.weights.get(kind).copied().unwrap_or(1.0)))
            .collect();
        EnsembleWeights::new(weights).map_err(|e| ConfigError::Weights(e.to_string()))
    }

    /// Build instructions for each configured embedder.
    pub fn embedder_specs(&self) -> Vec<EmbedderSpec> {
        let backbone = self.backbone.preset.config();
        self.embedders
            .iter()
            .map(|kind| {
                let module = self.modules.get(kind).cloned().unwrap_or_default();
                let weights = match module.weights_path {
                    Some(path) => WeightSource::File(path),
                    None => WeightSource::Seeded(self.seed),
                };
                EmbedderSpec::new(*kind, backbone, weights)
                    .with_head_dim(module.head_dim.unwrap_or(DEFAULT_HEAD_DIM))
            })
            .collect()
    }

    /// Configured output dimension of `kind`, if one is pinned.
    pub fn expected_dimension(&self, kind: AttentionKind) -> Option<usize> {
        self.modules.get(&kind).and_then(|m| m.dimension)
    }

    /// Query source; the corpus images when only a dataset file is given.
    pub fn query_source(&self) -> Option<&Path> {
        self.query_path
            .as_deref()
            .or_else(|| self.ground_truth_path.as_ref().and(self.corpus_path.as_deref()))
    }

    /// Location of the embedding cache database.
    pub fn cache_path(&self) -> PathBuf {
        self.storage
            .cache_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join("embeddings.sqlite"))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> PipelineSettings {
        PipelineSettings {
            corpus_path: Some(PathBuf::from("corpus")),
            query_path: Some(PathBuf::from("queries")),
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.embedders.len(), 3);
        assert_eq!(settings.backbone.input_size, 300);
        assert_eq!(settings.retrieval.metric, SimilarityMetric::Euclidean);
        assert_eq!(settings.fusion.policy, FusionPolicy::MinMaxScore);
        assert_eq!(settings.evaluation.pr_ranks, vec![1, 5, 10]);
        assert!(settings.storage.cache_enabled);
        assert_eq!(settings.seed, 42);
    }

    #[test]
    fn parses_full_shape() {
        let json = r#"{
            "embedders": ["squeeze_excitation", "cbam", "channel"],
            "weights": {"squeeze_excitation": 1.0, "cbam": 2.0, "channel": 0.5},
            "corpus_path": "data/oxford5k_images",
            "query_path": "data/oxford5k_images",
            "ground_truth_path": "data/gnd_roxford5k.json",
            "output_dir": "eval",
            "backbone": {"preset": "resnet101", "input_size": 300},
            "modules": {"cbam": {"weights_path": "weights/cbam.safetensors", "head_dim": 2048, "dimension": null}},
            "retrieval": {"metric": "euclidean", "top_k": null},
            "fusion": {"policy": "min_max_score", "rrf_k": 60.0},
            "evaluation": {"pr_ranks": [1, 5, 10]},
            "storage": {"cache_enabled": true, "cache_path": null},
            "parallelism": {"threads": null},
            "seed": 42
        }"#;
        let settings: PipelineSettings = serde_json::from_str(json).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.weights[&AttentionKind::Cbam], 2.0);
        assert_eq!(
            settings.modules[&AttentionKind::Cbam].weights_path,
            Some(PathBuf::from("weights/cbam.safetensors"))
        );

        let specs = settings.embedder_specs();
        assert_eq!(specs.len(), 3);
        assert_eq!(
            specs[1].weights,
            WeightSource::File(PathBuf::from("weights/cbam.safetensors"))
        );
        assert_eq!(specs[0].weights, WeightSource::Seeded(42));
    }

    #[test]
    fn partial_file_uses_defaults() {
        let settings: PipelineSettings =
            serde_json::from_str(r#"{"embedders": ["se"], "fusion": {"policy": "rrf"}}"#).unwrap();
        assert_eq!(settings.embedders, vec![AttentionKind::SqueezeExcitation]);
        assert_eq!(settings.fusion.policy, FusionPolicy::ReciprocalRank);
        assert_eq!(settings.fusion.rrf_k, 60.0);
        assert_eq!(settings.output_dir, PathBuf::from("eval"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let mut settings = valid();
        settings.weights.insert(AttentionKind::Cbam, 0.25);
        settings.retrieval.top_k = Some(100);

        settings.save(&path).unwrap();
        let loaded = PipelineSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PipelineSettings::load(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            PipelineSettings::load(dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_embedder_lists() {
        let mut settings = valid();
        settings.embedders.clear();
        assert!(matches!(settings.validate(), Err(ConfigError::NoEmbedders)));

        let mut settings = valid();
        settings.embedders = vec![AttentionKind::Cbam, AttentionKind::Cbam];
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::DuplicateEmbedder(AttentionKind::Cbam))
        ));

        let mut settings = valid();
        settings.weights.insert(AttentionKind::Spatial, 1.0);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::UnknownWeight(AttentionKind::Spatial))
        ));
    }

    #[test]
    fn validation_rejects_bad_weights() {
        let mut settings = valid();
        for kind in settings.embedders.clone() {
            settings.weights.insert(kind, 0.0);
        }
        assert!(matches!(settings.validate(), Err(ConfigError::Weights(_))));

        let mut settings = valid();
        settings.weights.insert(AttentionKind::Cbam, -1.0);
        assert!(matches!(settings.validate(), Err(ConfigError::Weights(_))));
    }

    #[test]
    fn validation_requires_paths() {
        let mut settings = valid();
        settings.corpus_path = None;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingPath("corpus_path"))
        ));

        let mut settings = valid();
        settings.query_path = None;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingPath("query_path"))
        ));

        settings.ground_truth_path = Some(PathBuf::from("gnd.json"));
        settings.validate().unwrap();
        assert_eq!(settings.query_source(), Some(Path::new("corpus")));
    }

    #[test]
    fn validation_rejects_zero_values() {
        let mut settings = valid();
        settings.evaluation.pr_ranks = vec![0];
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { field: "evaluation.pr_ranks", .. })
        ));

        let mut settings = valid();
        settings.fusion.rrf_k = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = valid();
        settings.parallelism.threads = Some(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_weights_default_to_one() {
        let mut settings = valid();
        settings.weights.insert(AttentionKind::Cbam, 3.0);
        let weights = settings.ensemble_weights().unwrap();
        assert_eq!(weights.get(AttentionKind::Cbam), 3.0);
        assert_eq!(weights.get(AttentionKind::Channel), 1.0);
    }

    #[test]
    fn dataset_layout() {
        let settings = PipelineSettings::for_dataset(DatasetName::RParis6k, Path::new("data"));
        assert_eq!(
            settings.corpus_path,
            Some(PathBuf::from("data/paris6k_images"))
        );
        assert_eq!(
            settings.ground_truth_path,
            Some(PathBuf::from("data/gnd_rparis6k.json"))
        );
        assert_eq!(settings.cache_path(), PathBuf::from("eval/embeddings.sqlite"));
    }

    #[test]
    fn backbone_presets() {
        assert_eq!("tiny".parse::<BackbonePreset>().unwrap(), BackbonePreset::Tiny);
        assert_eq!(BackbonePreset::Resnet50.config().blocks, [3, 4, 6, 3]);
        let json = serde_json::to_string(&BackbonePreset::Resnet101).unwrap();
        assert_eq!(json, "\"resnet101\"");
    }
}
