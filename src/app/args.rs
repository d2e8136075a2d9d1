//! Command-line arguments.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::PipelineSettings;
use crate::embedding::AttentionKind;
use crate::evaluation::DatasetName;
use crate::retrieval::{FusionPolicy, SimilarityMetric};

/// Attention-augmented landmark retrieval
#[derive(Debug, Parser)]
#[command(name = "landmark-retrieval")]
#[command(version)]
pub struct Cli {
    /// Path to the JSON settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Embed the corpus and queries, rank, fuse and evaluate
    Run(RunArgs),

    /// Recompute metrics from the rankings of a previous run
    Evaluate(EvaluateArgs),

    /// List attention modules and where their weights come from
    Modules,

    /// Write a settings file for a benchmark dataset
    InitConfig(InitConfigArgs),
}

/// Overrides applied on top of the settings file.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Corpus directory or manifest
    #[arg(long)]
    pub corpus: Option<PathBuf>,

    /// Query directory or manifest
    #[arg(long)]
    pub queries: Option<PathBuf>,

    /// Revisited Oxford/Paris ground truth JSON
    #[arg(long)]
    pub ground_truth: Option<PathBuf>,

    /// Directory for rankings, metrics and the run report
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Embedders to run, comma separated (e.g. se,cbam,channel)
    #[arg(long, value_delimiter = ',')]
    pub embedders: Vec<AttentionKind>,

    /// Ensemble fusion policy
    #[arg(long)]
    pub policy: Option<FusionPolicy>,

    /// Similarity metric
    #[arg(long)]
    pub metric: Option<SimilarityMetric>,

    /// Keep only the best k results in ranking files
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Worker threads for embedding and ranking
    #[arg(long)]
    pub threads: Option<usize>,

    /// Skip the embedding cache
    #[arg(long)]
    pub no_cache: bool,
}

impl RunArgs {
    /// Applies every given flag to `settings`.
    pub fn apply(&self, settings: &mut PipelineSettings) {
        if let Some(path) = &self.corpus {
            settings.corpus_path = Some(path.clone());
        }
        if let Some(path) = &self.queries {
            settings.query_path = Some(path.clone());
        }
        if let Some(path) = &self.ground_truth {
            settings.ground_truth_path = Some(path.clone());
        }
        if let Some(dir) = &self.output {
            settings.output_dir = dir.clone();
        }
        if !self.embedders.is_empty() {
            settings.embedders = self.embedders.clone();
        }
        if let Some(policy) = self.policy {
            settings.fusion.policy = policy;
        }
        if let Some(metric) = self.metric {
            settings.retrieval.metric = metric;
        }
        if self.top_k.is_some() {
            settings.retrieval.top_k = self.top_k;
        }
        if self.threads.is_some() {
            settings.parallelism.threads = self.threads;
        }
        if self.no_cache {
            settings.storage.cache_enabled = false;
        }
    }
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    /// Revisited Oxford/Paris ground truth JSON
    #[arg(long)]
    pub ground_truth: Option<PathBuf>,

    /// Output directory of the run to evaluate
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Precision/recall ranks, comma separated
    #[arg(long, value_delimiter = ',')]
    pub pr_ranks: Vec<usize>,
}

impl EvaluateArgs {
    pub fn apply(&self, settings: &mut PipelineSettings) {
        if let Some(path) = &self.ground_truth {
            settings.ground_truth_path = Some(path.clone());
        }
        if let Some(dir) = &self.output {
            settings.output_dir = dir.clone();
        }
        if !self.pr_ranks.is_empty() {
            settings.evaluation.pr_ranks = self.pr_ranks.clone();
        }
    }
}

#[derive(Debug, Args)]
pub struct InitConfigArgs {
    /// Dataset name: roxford5k or rparis6k
    #[arg(long)]
    pub dataset: DatasetName,

    /// Directory holding the dataset images and ground truth
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Where to write the settings; defaults to --config or the user config dir
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Replace an existing file
    #[arg(long)]
    pub force: bool,
}
