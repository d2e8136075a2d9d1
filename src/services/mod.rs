//! Pipeline services.
//!
//! Services sit between the command-line layer and the building blocks:
//!
//! ```text
//! Application Layer (CLI commands)
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Embedding, Retrieval, Evaluation, Storage
//! ```
//!
//! # Services Overview
//!
//! - [`CorpusService`]: Resolves corpus and query images from settings
//! - [`RetrievalPipeline`]: Embeds, indexes, ranks, fuses and evaluates
//! - [`output`]: Layout of ranking, failure and report files

mod corpus_service;
pub mod output;
mod pipeline_service;

pub use corpus_service::{
    check_files_exist, load_images, read_manifest, scan_directory, Corpus, CorpusError,
    CorpusService, IMAGE_EXTENSIONS,
};
pub use output::{FailureRecord, ImageRole};
pub use pipeline_service::{PipelineError, Result, RetrievalPipeline, RunReport};
