//! Attention-augmented image embedding.
//!
//! Images are decoded and resized once, run through a ResNet backbone and
//! summarised by one of four attention modules into a fixed-length
//! [`FeatureVector`].
//!
//! # Architecture
//!
//! - [`Backbone`] - Bottleneck ResNet returning every stage output
//! - [`Embedder`] - Backbone plus attention module; one implementation per [`AttentionKind`]
//! - [`EmbedderSet`] - The embedders of a run, sharing an [`ImagePreprocessor`]
//! - [`WeightSource`] - Trained `safetensors` weights or seeded synthesis
//!
//! # Example
//!
//! ```ignore
//! use landmark_retrieval::embedding::{
//!     AttentionKind, BackboneConfig, EmbedderSet, EmbedderSpec, ImagePreprocessor, WeightSource,
//! };
//!
//! let spec = EmbedderSpec::new(
//!     AttentionKind::Cbam,
//!     BackboneConfig::resnet101(),
//!     WeightSource::File("weights/cbam.safetensors".into()),
//! );
//! let set = EmbedderSet::from_specs(&[spec], ImagePreprocessor::default())?;
//! let results = set.embed_batch(&jobs);
//! ```

mod attention;
mod backbone;
mod embedder;
mod engine;
mod models;
mod preprocess;
mod vector;
mod weights;

pub use backbone::{Backbone, BackboneConfig, StageFeatures};
pub use embedder::{
    build_embedder, CbamEmbedder, ChannelEmbedder, Embedder, EmbedderSpec, EmbeddingError,
    SpatialEmbedder, SqueezeExcitationEmbedder, DEFAULT_HEAD_DIM,
};
#[cfg(test)]
pub(crate) use embedder::MockEmbedder;
pub use engine::{EmbedderSet, EmbeddingJob, EmbeddingOutcome, ImageEmbeddings};
pub use models::{AttentionKind, ModuleInfo, ModuleRegistry, WeightsStatus};
pub use preprocess::{ImagePreprocessor, DEFAULT_INPUT_SIZE};
pub use vector::FeatureVector;
pub use weights::WeightSource;
