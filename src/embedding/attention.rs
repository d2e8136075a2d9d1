//! Attention blocks applied on top of backbone feature maps.
//!
//! All blocks take channel-first maps `[batch, channels, height, width]`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, linear, ops, Conv2d, Conv2dConfig, Linear, VarBuilder};

/// Hidden width divisor of the gating MLPs.
pub const REDUCTION_RATIO: usize = 16;

/// Hidden width of a gating MLP over `channels` inputs.
pub fn reduced(channels: usize, ratio: usize) -> usize {
    (channels / ratio).max(1)
}

/// `[B, C, H, W]` -> `[B, C]` by spatial mean.
pub fn global_average_pool(xs: &Tensor) -> Result<Tensor> {
    xs.flatten_from(2)?.mean(2)
}

/// `[B, C, H, W]` -> `[B, C]` by spatial max.
pub fn global_max_pool(xs: &Tensor) -> Result<Tensor> {
    xs.flatten_from(2)?.max(2)
}

/// Multiplies every channel of `xs` by the matching entry of `gate` (`[B, C]`).
pub fn rescale_channels(xs: &Tensor, gate: &Tensor) -> Result<Tensor> {
    xs.broadcast_mul(&gate.unsqueeze(2)?.unsqueeze(3)?)
}

/// Squeeze-and-excitation channel recalibration.
#[derive(Debug, Clone)]
pub struct SqueezeExcitation {
    fc1: Linear,
    fc2: Linear,
}

impl SqueezeExcitation {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = reduced(channels, REDUCTION_RATIO);
        Ok(Self {
            fc1: linear(channels, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, channels, vb.pp("fc2"))?,
        })
    }
}

impl Module for SqueezeExcitation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let squeezed = global_average_pool(xs)?;
        let gate = ops::sigmoid(&self.fc2.forward(&self.fc1.forward(&squeezed)?.relu()?)?)?;
        rescale_channels(xs, &gate)
    }
}

/// Channel gate driven by average- and max-pooled descriptors.
///
/// Both descriptors pass through the same two-layer MLP with a sigmoid
/// output; the two activations are added to form the gate, so gate values
/// lie in `(0, 2)`.
#[derive(Debug, Clone)]
pub struct ChannelGate {
    dense1: Linear,
    dense2: Linear,
}

impl ChannelGate {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = reduced(channels, REDUCTION_RATIO);
        Ok(Self {
            dense1: linear(channels, hidden, vb.pp("dense1"))?,
            dense2: linear(hidden, channels, vb.pp("dense2"))?,
        })
    }

    fn excite(&self, descriptor: &Tensor) -> Result<Tensor> {
        let hidden = self.dense1.forward(descriptor)?.relu()?;
        ops::sigmoid(&self.dense2.forward(&hidden)?)
    }
}

impl Module for ChannelGate {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let avg = self.excite(&global_average_pool(xs)?)?;
        let max = self.excite(&global_max_pool(xs)?)?;
        rescale_channels(xs, &(avg + max)?)
    }
}

/// Spatial gate from channel-wise mean and max maps.
#[derive(Debug, Clone)]
pub struct SpatialGate {
    conv: Conv2d,
}

impl SpatialGate {
    pub const KERNEL_SIZE: usize = 7;

    pub fn new(vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: Self::KERNEL_SIZE / 2,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(2, 1, Self::KERNEL_SIZE, config, vb.pp("conv"))?,
        })
    }
}

impl Module for SpatialGate {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let avg = xs.mean_keepdim(1)?;
        let max = xs.max_keepdim(1)?;
        let pooled = Tensor::cat(&[&avg, &max], 1)?;
        let gate = ops::sigmoid(&self.conv.forward(&pooled)?)?;
        xs.broadcast_mul(&gate)
    }
}

/// Unscaled dot-product attention of a single-token query over spatial positions.
///
/// `query` is `[B, C]` and `features` is `[B, C, H, W]`; every spatial
/// position is a key and value. Returns the attended `[B, C]` vector.
pub fn dot_product_attention(query: &Tensor, features: &Tensor) -> Result<Tensor> {
    let keys = features.flatten_from(2)?.contiguous()?; // [B, C, N]
    let scores = query.unsqueeze(1)?.matmul(&keys)?; // [B, 1, N]
    let weights = ops::softmax_last_dim(&scores)?;
    let values = keys.transpose(1, 2)?.contiguous()?; // [B, N, C]
    weights.matmul(&values)?.squeeze(1)
}
