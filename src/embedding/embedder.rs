//! Attention-augmented embedders.
//!
//! Every embedder runs the shared ResNet backbone followed by one attention
//! module and maps a `[1, 3, S, S]` image tensor to a [`FeatureVector`].
//! The four implementations form a closed set chosen by [`AttentionKind`]
//! through [`build_embedder`].

use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use super::attention::{
    dot_product_attention, global_average_pool, ChannelGate, SpatialGate, SqueezeExcitation,
};
use super::backbone::{Backbone, BackboneConfig};
use super::models::AttentionKind;
use super::vector::FeatureVector;
use super::weights::WeightSource;
use crate::domain::BoundingBox;

/// Default width of the dense projection on the SE and CBAM heads.
pub const DEFAULT_HEAD_DIM: usize = 2048;

/// Errors from preprocessing, weight loading or inference.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("malformed image {path}: {reason}")]
    MalformedImage { path: PathBuf, reason: String },

    #[error("bounding box {bbox:?} is empty inside a {width}x{height} image")]
    InvalidBoundingBox {
        bbox: BoundingBox,
        width: u32,
        height: u32,
    },

    #[error("malformed input: expected {expected}, got shape {actual:?}")]
    InputShape { expected: String, actual: Vec<usize> },

    #[error("{kind} embedder produced {actual} values, expected {expected}")]
    DimensionMismatch {
        kind: AttentionKind,
        expected: usize,
        actual: usize,
    },

    #[error("{kind} embedder produced non-finite values")]
    NonFinite { kind: AttentionKind },

    #[error("failed to load weights from {location}: {reason}")]
    Weights { location: String, reason: String },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Maps a preprocessed image to a fixed-length feature vector.
///
/// Implementations are read-only after construction and may be shared
/// across threads.
#[cfg_attr(test, mockall::automock)]
pub trait Embedder: Send + Sync {
    /// Attention module of this embedder.
    fn kind(&self) -> AttentionKind;

    /// Length of every vector returned by [`Embedder::embed`].
    fn dimension(&self) -> usize;

    /// Embeds a `[1, 3, H, W]` tensor.
    fn embed(&self, pixels: &Tensor) -> Result<FeatureVector>;
}

/// Everything needed to construct one embedder.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedderSpec {
    pub kind: AttentionKind,
    pub backbone: BackboneConfig,
    /// Projection width for heads that have one.
    pub head_dim: usize,
    pub weights: WeightSource,
}

impl EmbedderSpec {
    pub fn new(kind: AttentionKind, backbone: BackboneConfig, weights: WeightSource) -> Self {
        Self {
            kind,
            backbone,
            head_dim: DEFAULT_HEAD_DIM,
            weights,
        }
    }

    pub fn with_head_dim(mut self, head_dim: usize) -> Self {
        self.head_dim = head_dim;
        self
    }

    /// Output dimension of the embedder this spec builds.
    pub fn dimension(&self) -> usize {
        self.kind.embedding_dim(&self.backbone, self.head_dim)
    }

    /// Identifies the computation behind embeddings from this spec.
    pub fn fingerprint(&self, input_size: u32) -> String {
        format!(
            "{}|blocks={:?}|width={}|input={}|head={}",
            self.weights.fingerprint(),
            self.backbone.blocks,
            self.backbone.base_width,
            input_size,
            self.head_dim
        )
    }
}

/// Builds the embedder described by `spec`.
pub fn build_embedder(
    spec: &EmbedderSpec,
    device: &candle_core::Device,
) -> Result<Arc<dyn Embedder>> {
    let backbone = spec.backbone;
    let head_dim = spec.head_dim;

    let embedder: Arc<dyn Embedder> = match spec.kind {
        AttentionKind::SqueezeExcitation => Arc::new(spec.weights.build(device, |vb| {
            SqueezeExcitationEmbedder::new(backbone, head_dim, vb)
        })?),
        AttentionKind::Cbam => {
            Arc::new(spec.weights.build(device, |vb| CbamEmbedder::new(backbone, head_dim, vb))?)
        }
        AttentionKind::Channel => {
            Arc::new(spec.weights.build(device, |vb| ChannelEmbedder::new(backbone, vb))?)
        }
        AttentionKind::Spatial => {
            Arc::new(spec.weights.build(device, |vb| SpatialEmbedder::new(backbone, vb))?)
        }
    };

    tracing::debug!(
        embedder = %spec.kind,
        dimension = embedder.dimension(),
        weights = %spec.weights.describe(),
        "Built embedder"
    );
    Ok(embedder)
}

fn check_input(pixels: &Tensor) -> Result<()> {
    let dims = pixels.dims();
    if dims.len() != 4 || dims[0] != 1 || dims[1] != 3 || dims[2] == 0 || dims[3] == 0 {
        return Err(EmbeddingError::InputShape {
            expected: "[1, 3, height, width]".to_string(),
            actual: dims.to_vec(),
        });
    }
    Ok(())
}

/// Converts a `[1, D]` output into a validated feature vector.
fn into_feature_vector(
    kind: AttentionKind,
    expected: usize,
    output: &Tensor,
) -> Result<FeatureVector> {
    let values = output.flatten_all()?.to_vec1::<f32>()?;
    if values.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            kind,
            expected,
            actual: values.len(),
        });
    }
    let vector = FeatureVector::new(values);
    if !vector.is_finite() {
        return Err(EmbeddingError::NonFinite { kind });
    }
    Ok(vector)
}

/// `C5 -> SE -> GAP -> dense(head_dim) relu`.
#[derive(Debug)]
pub struct SqueezeExcitationEmbedder {
    backbone: Backbone,
    se: SqueezeExcitation,
    head: Linear,
    dimension: usize,
}

impl SqueezeExcitationEmbedder {
    pub fn new(
        config: BackboneConfig,
        head_dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let c5 = config.stage_channels()[3];
        Ok(Self {
            backbone: Backbone::new(config, vb.pp("backbone"))?,
            se: SqueezeExcitation::new(c5, vb.pp("se"))?,
            head: linear(c5, head_dim, vb.pp("head"))?,
            dimension: head_dim,
        })
    }
}

impl Embedder for SqueezeExcitationEmbedder {
    fn kind(&self) -> AttentionKind {
        AttentionKind::SqueezeExcitation
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, pixels: &Tensor) -> Result<FeatureVector> {
        check_input(pixels)?;
        let stages = self.backbone.forward(pixels)?;
        let pooled = global_average_pool(&self.se.forward(&stages.c5)?)?;
        let output = self.head.forward(&pooled)?.relu()?;
        into_feature_vector(self.kind(), self.dimension, &output)
    }
}

/// `C5 -> channel gate -> spatial gate -> GAP -> dense(head_dim) relu`.
#[derive(Debug)]
pub struct CbamEmbedder {
    backbone: Backbone,
    channel_gate: ChannelGate,
    spatial_gate: SpatialGate,
    head: Linear,
    dimension: usize,
}

impl CbamEmbedder {
    pub fn new(
        config: BackboneConfig,
        head_dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let c5 = config.stage_channels()[3];
        Ok(Self {
            backbone: Backbone::new(config, vb.pp("backbone"))?,
            channel_gate: ChannelGate::new(c5, vb.pp("channel_gate"))?,
            spatial_gate: SpatialGate::new(vb.pp("spatial_gate"))?,
            head: linear(c5, head_dim, vb.pp("head"))?,
            dimension: head_dim,
        })
    }
}

impl Embedder for CbamEmbedder {
    fn kind(&self) -> AttentionKind {
        AttentionKind::Cbam
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, pixels: &Tensor) -> Result<FeatureVector> {
        check_input(pixels)?;
        let stages = self.backbone.forward(pixels)?;
        let gated = self
            .spatial_gate
            .forward(&self.channel_gate.forward(&stages.c5)?)?;
        let output = self.head.forward(&global_average_pool(&gated)?)?.relu()?;
        into_feature_vector(self.kind(), self.dimension, &output)
    }
}

/// Channel gates on `C2`, `C3` and `C4`; the gated maps are averaged
/// spatially and concatenated.
#[derive(Debug)]
pub struct ChannelEmbedder {
    backbone: Backbone,
    gates: [ChannelGate; 3],
    dimension: usize,
}

impl ChannelEmbedder {
    pub fn new(config: BackboneConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let [c2, c3, c4, _] = config.stage_channels();
        let vb_gates = vb.pp("gates");
        Ok(Self {
            backbone: Backbone::new(config, vb.pp("backbone"))?,
            gates: [
                ChannelGate::new(c2, vb_gates.pp("0"))?,
                ChannelGate::new(c3, vb_gates.pp("1"))?,
                ChannelGate::new(c4, vb_gates.pp("2"))?,
            ],
            dimension: c2 + c3 + c4,
        })
    }
}

impl Embedder for ChannelEmbedder {
    fn kind(&self) -> AttentionKind {
        AttentionKind::Channel
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, pixels: &Tensor) -> Result<FeatureVector> {
        check_input(pixels)?;
        let stages = self.backbone.forward(pixels)?;
        let descriptors = [&stages.c2, &stages.c3, &stages.c4]
            .into_iter()
            .zip(&self.gates)
            .map(|(stage, gate)| global_average_pool(&gate.forward(stage)?))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let output = Tensor::cat(&descriptors, 1)?;
        into_feature_vector(self.kind(), self.dimension, &output)
    }
}

/// Pooled `C5` context projected down to `C4`, `C3` and `C2` widths; each
/// projection queries the positions of the matching stage and the attended
/// vectors are concatenated.
#[derive(Debug)]
pub struct SpatialEmbedder {
    backbone: Backbone,
    dense1: Linear,
    dense2: Linear,
    dense3: Linear,
    dimension: usize,
}

impl SpatialEmbedder {
    pub fn new(config: BackboneConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let [c2, c3, c4, c5] = config.stage_channels();
        Ok(Self {
            backbone: Backbone::new(config, vb.pp("backbone"))?,
            dense1: linear(c5, c4, vb.pp("dense1"))?,
            dense2: linear(c4, c3, vb.pp("dense2"))?,
            dense3: linear(c3, c2, vb.pp("dense3"))?,
            dimension: c2 + c3 + c4,
        })
    }
}

impl Embedder for SpatialEmbedder {
    fn kind(&self) -> AttentionKind {
        AttentionKind::Spatial
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, pixels: &Tensor) -> Result<FeatureVector> {
        check_input(pixels)?;
        let stages = self.backbone.forward(pixels)?;
        let context = global_average_pool(&stages.c5)?;

        let query4 = self.dense1.forward(&context)?.relu()?;
        let query3 = self.dense2.forward(&query4)?.relu()?;
        let query2 = self.dense3.forward(&query3)?.relu()?;

        let attended = [
            dot_product_attention(&query2, &stages.c2)?,
            dot_product_attention(&query3, &stages.c3)?,
            dot_product_attention(&query4, &stages.c4)?,
        ];
        let output = Tensor::cat(&attended, 1)?;
        into_feature_vector(self.kind(), self.dimension, &output)
    }
}
