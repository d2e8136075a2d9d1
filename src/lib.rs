//! landmark-retrieval - Attention-augmented landmark image retrieval
//!
//! This crate embeds images with a family of attention modules on a shared
//! CNN backbone, ranks a corpus against queries per embedder, fuses the
//! per-embedder rankings, and scores the result on the Revisited Oxford and
//! Paris benchmarks.

pub mod app;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod evaluation;
pub mod retrieval;
pub mod services;
pub mod storage;

pub use app::App;
