//! ResNet bottleneck backbone exposing every stage output.
//!
//! Attention modules read either the final feature map (`C5`) or the
//! intermediate stages (`C2`-`C4`), so unlike a classification ResNet the
//! forward pass returns all four stage outputs. Parameter names follow the
//! torchvision layout so exported ResNet weights load unchanged.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};
use serde::{Deserialize, Serialize};

/// Output channels of a bottleneck block relative to its inner width.
const EXPANSION: usize = 4;

const BATCH_NORM_EPS: f64 = 1e-5;

/// Depth and width of a bottleneck ResNet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Bottleneck blocks per stage.
    pub blocks: [usize; 4],
    /// Inner width of the first stage; doubles at every stage.
    pub base_width: usize,
}

impl BackboneConfig {
    /// ResNet-101.
    pub const fn resnet101() -> Self {
        Self {
            blocks: [3, 4, 23, 3],
            base_width: 64,
        }
    }

    /// ResNet-50.
    pub const fn resnet50() -> Self {
        Self {
            blocks: [3, 4, 6, 3],
            base_width: 64,
        }
    }

    /// One block per stage at 1/16 width. For smoke runs and tests only.
    pub const fn tiny() -> Self {
        Self {
            blocks: [1, 1, 1, 1],
            base_width: 4,
        }
    }

    /// Output channels of each stage (`C2`, `C3`, `C4`, `C5`).
    pub fn stage_channels(&self) -> [usize; 4] {
        [0, 1, 2, 3].map(|stage| self.base_width * (1 << stage) * EXPANSION)
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self::resnet101()
    }
}

/// Outputs of the four residual stages.
#[derive(Debug, Clone)]
pub struct StageFeatures {
    pub c2: Tensor,
    pub c3: Tensor,
    pub c4: Tensor,
    pub c5: Tensor,
}

#[derive(Debug, Clone)]
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    #[allow(clippy::too_many_arguments)]
    fn new(
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        vb_conv: VarBuilder,
        vb_bn: VarBuilder,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            stride,
            padding,
            ..Default::default()
        };
        let conv = conv2d_no_bias(c_in, c_out, kernel, config, vb_conv)?;
        let bn = batch_norm(c_out, BATCH_NORM_EPS, vb_bn)?;
        Ok(Self { conv, bn })
    }
}

impl Module for ConvBn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // Inference only: batch norm always uses running statistics.
        xs.apply(&self.conv)?.apply_t(&self.bn, false)
    }
}

#[derive(Debug, Clone)]
struct Bottleneck {
    reduce: ConvBn,
    spatial: ConvBn,
    expand: ConvBn,
    downsample: Option<ConvBn>,
}

impl Bottleneck {
    fn new(c_in: usize, width: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let c_out = width * EXPANSION;
        let reduce = ConvBn::new(c_in, width, 1, 1, 0, vb.pp("conv1"), vb.pp("bn1"))?;
        let spatial = ConvBn::new(width, width, 3, stride, 1, vb.pp("conv2"), vb.pp("bn2"))?;
        let expand = ConvBn::new(width, c_out, 1, 1, 0, vb.pp("conv3"), vb.pp("bn3"))?;
        let downsample = if stride != 1 || c_in != c_out {
            Some(ConvBn::new(
                c_in,
                c_out,
                1,
                stride,
                0,
                vb.pp("downsample.0"),
                vb.pp("downsample.1"),
            )?)
        } else {
            None
        };
        Ok(Self {
            reduce,
            spatial,
            expand,
            downsample,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = match &self.downsample {
            Some(downsample) => downsample.forward(xs)?,
            None => xs.clone(),
        };
        let ys = self.reduce.forward(xs)?.relu()?;
        let ys = self.spatial.forward(&ys)?.relu()?;
        let ys = self.expand.forward(&ys)?;
        (ys + residual)?.relu()
    }
}

/// Bottleneck ResNet returning all stage outputs.
#[derive(Debug, Clone)]
pub struct Backbone {
    config: BackboneConfig,
    stem: ConvBn,
    stages: Vec<Vec<Bottleneck>>,
}

impl Backbone {
    /// Builds the backbone, reading parameters from `vb`.
    pub fn new(config: BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let base = config.base_width;
        let stem = ConvBn::new(3, base, 7, 2, 3, vb.pp("conv1"), vb.pp("bn1"))?;

        let mut c_in = base;
        let mut stages = Vec::with_capacity(4);
        for (stage, &depth) in config.blocks.iter().enumerate() {
            let width = base << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            let vb_stage = vb.pp(format!("layer{}", stage + 1));

            let mut blocks = Vec::with_capacity(depth);
            for index in 0..depth {
                let block_stride = if index == 0 { stride } else { 1 };
                blocks.push(Bottleneck::new(
                    c_in,
                    width,
                    block_stride,
                    vb_stage.pp(index.to_string()),
                )?);
                c_in = width * EXPANSION;
            }
            stages.push(blocks);
        }

        Ok(Self {
            config,
            stem,
            stages,
        })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Runs the backbone on a `[batch, 3, height, width]` tensor.
    pub fn forward(&self, xs: &Tensor) -> Result<StageFeatures> {
        let mut xs = self
            .stem
            .forward(xs)?
            .relu()?
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        let mut outputs = Vec::with_capacity(4);
        for stage in &self.stages {
            for block in stage {
                xs = block.forward(&xs)?;
            }
            outputs.push(xs.clone());
        }

        let mut outputs = outputs.into_iter();
        match (outputs.next(), outputs.next(), outputs.next(), outputs.next()) {
            (Some(c2), Some(c3), Some(c4), Some(c5)) => Ok(StageFeatures { c2, c3, c4, c5 }),
            _ => Err(candle_core::Error::Msg(
                "backbone must have four stages".to_string(),
            )),
        }
    }
}
