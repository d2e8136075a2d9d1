//! Database query modules.
//!
//! Each module provides async functions that operate on the database.

pub mod embeddings;
pub mod runs;
