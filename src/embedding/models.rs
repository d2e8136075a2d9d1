//! Attention module definitions and the registry of available modules.
//!
//! Each attention variant is a separately trained embedder sharing the same
//! ResNet backbone architecture. Variants are a closed set selected by
//! configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::backbone::BackboneConfig;

/// Available attention-augmented embedders.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// Dot-product attention from pooled global context over multi-scale positions.
    Spatial,
    /// Channel gating on intermediate stages, multi-scale descriptor.
    Channel,
    /// Squeeze-and-excitation block on the final feature map.
    #[default]
    #[serde(alias = "se")]
    SqueezeExcitation,
    /// Convolutional block attention: channel gate followed by spatial gate.
    Cbam,
}

impl AttentionKind {
    /// Every variant, in canonical order.
    pub const ALL: [AttentionKind; 4] = [
        AttentionKind::Spatial,
        AttentionKind::Channel,
        AttentionKind::SqueezeExcitation,
        AttentionKind::Cbam,
    ];

    /// Identifier used in configuration files and output paths.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Spatial => "spatial",
            Self::Channel => "channel",
            Self::SqueezeExcitation => "squeeze_excitation",
            Self::Cbam => "cbam",
        }
    }

    /// Returns whether the module reads intermediate backbone stages.
    pub fn uses_intermediate_stages(&self) -> bool {
        matches!(self, Self::Spatial | Self::Channel)
    }

    /// Returns whether the module ends in a configurable dense projection.
    pub fn has_projection_head(&self) -> bool {
        matches!(self, Self::SqueezeExcitation | Self::Cbam)
    }

    /// Returns the embedding dimension for a backbone and projection size.
    ///
    /// Multi-scale variants concatenate stage descriptors, so their size is
    /// fixed by the backbone (`C2 + C3 + C4`); projected variants emit
    /// `head_dim` values.
    pub fn embedding_dim(&self, backbone: &BackboneConfig, head_dim: usize) -> usize {
        if self.has_projection_head() {
            head_dim
        } else {
            let [c2, c3, c4, _] = backbone.stage_channels();
            c2 + c3 + c4
        }
    }
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for AttentionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spatial" | "sp" => Ok(Self::Spatial),
            "channel" | "ch" => Ok(Self::Channel),
            "squeeze_excitation" | "se" => Ok(Self::SqueezeExcitation),
            "cbam" => Ok(Self::Cbam),
            other => Err(format!("unknown attention module: {other}")),
        }
    }
}

/// Where an embedder's parameters come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsStatus {
    /// No embedder has been built for the module.
    NotLoaded,
    /// Parameters were read from a weights file.
    Loaded,
    /// Parameters were synthesised from a seed.
    Synthetic,
    /// Building the embedder failed.
    Failed,
}

/// Information about an attention module.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Module type.
    pub kind: AttentionKind,
    /// Human-readable name.
    pub name: String,
    /// Description of the module.
    pub description: String,
    /// Conventional weights file name.
    pub weights_file: String,
    /// Weights status.
    pub status: WeightsStatus,
}

impl ModuleInfo {
    /// Creates info for a module type.
    pub fn for_module(kind: AttentionKind) -> Self {
        let (name, description) = match kind {
            AttentionKind::Spatial => (
                "Spatial attention",
                "Pooled context queries attend over conv2-conv4 positions",
            ),
            AttentionKind::Channel => (
                "Channel attention",
                "Channel gates on conv2-conv4, averaged and concatenated",
            ),
            AttentionKind::SqueezeExcitation => (
                "Squeeze-and-excitation",
                "SE channel recalibration of conv5 with a dense projection",
            ),
            AttentionKind::Cbam => (
                "CBAM",
                "Channel then spatial gating of conv5 with a dense projection",
            ),
        };

        Self {
            kind,
            name: name.to_string(),
            description: description.to_string(),
            weights_file: format!("{}.safetensors", kind.id()),
            status: WeightsStatus::NotLoaded,
        }
    }
}

/// Registry of attention modules and their weights status.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleInfo>,
}

impl ModuleRegistry {
    /// Creates a new registry with all available modules.
    pub fn new() -> Self {
        let modules = AttentionKind::ALL
            .iter()
            .map(|&kind| ModuleInfo::for_module(kind))
            .collect();
        Self { modules }
    }

    /// Gets all available modules.
    pub fn all_modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    /// Gets info for a specific module.
    pub fn get_module(&self, kind: AttentionKind) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.kind == kind)
    }

    /// Updates the status of a module.
    pub fn set_status(&mut self, kind: AttentionKind, status: WeightsStatus) {
        if let Some(module) = self.modules.iter_mut().find(|m| m.kind == kind) {
            module.status = status;
        }
    }

    /// Gets all modules that have an embedder built.
    pub fn ready_modules(&self) -> Vec<&ModuleInfo> {
        self.modules
            .iter()
            .filter(|m| matches!(m.status, WeightsStatus::Loaded | WeightsStatus::Synthetic))
            .collect()
    }
}
