//! Configuration and settings management.
//!
//! This module provides the pipeline settings types and their persistence.
//! Settings are stored as JSON, by default in the user's config directory.

mod settings;

pub use settings::{
    BackbonePreset, BackboneSettings, ConfigError, EvaluationSettings, FusionSettings,
    ModuleSettings, ParallelismSettings, PipelineSettings, Result, RetrievalSettings,
    StorageSettings, SETTINGS_FILE,
};
