//! Corpus indexing, ranking and rank fusion.
//!
//! # Architecture
//!
//! - [`IndexBuilder`] / [`Index`] - Corpus vectors, frozen once built
//! - [`Retriever`] - Scores a query against every index entry
//! - [`Ensembler`] - Fuses the per-embedder rankings of one query
//!
//! One index is built per embedder. Building finishes before any query is
//! ranked; afterwards the index is shared read-only across ranking threads.

mod ensemble;
mod index;
mod retriever;

pub use ensemble::{EnsembleError, EnsembleWeights, Ensembler, FusionPolicy, DEFAULT_RRF_K};
pub use index::{Index, IndexBuilder, IndexEntry, IndexError};
pub use retriever::{QueryVector, RetrievalError, Retriever, SimilarityMetric};
