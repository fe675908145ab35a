//! Residual and densely connected blocks.
//!
//! All blocks take channels-last feature maps and resolve their parameters
//! through the supplied [`Scope`]. Normalisation inside the blocks is batch
//! normalisation, so the scope's [`Mode`](crate::params::Mode) decides whether
//! batch moments or running statistics are used.
//!
//! Parameter layout of [`resblock`] (other blocks follow the same pattern):
//!
//! ```text
//! <scope>.res1.conv_0.{kernel,bias}   <scope>.res1.batch_norm.{gamma,beta}
//! <scope>.res2.conv_0.{kernel,bias}   <scope>.res2.batch_norm.{gamma,beta}
//! ```

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    checks,
    conv::{conv, deconv, ConvConfig, PadType},
    norm::{batch_norm, condition_batch_norm, NormConfig},
    params::Scope,
};

/// Default number of bottleneck stages in [`dense_block`].
pub const DENSE_BLOCK_LAYERS: usize = 6;
/// Default number of units in [`residual_dense_block`].
pub const RDB_BLOCKS: usize = 20;
/// Default number of convolutions per residual dense unit.
pub const RDB_CONVS: usize = 6;

/// Shared configuration for composite blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Output channel count of the block.
    pub channels: usize,
    pub use_bias: bool,
    pub spectral_norm: bool,
    #[serde(default)]
    pub norm: NormConfig,
}

impl BlockConfig {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            use_bias: true,
            spectral_norm: false,
            norm: NormConfig::default(),
        }
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_spectral_norm(mut self, spectral_norm: bool) -> Self {
        self.spectral_norm = spectral_norm;
        self
    }

    /// 3x3 convolution with the given stride and a one-pixel zero border.
    pub(crate) fn conv3x3(&self, channels: usize, stride: usize) -> ConvConfig {
        ConvConfig::new(channels)
            .with_kernel(3)
            .with_stride(stride)
            .with_pad(1, PadType::Zero)
            .with_bias(self.use_bias)
            .with_spectral_norm(self.spectral_norm)
    }

    /// 1x1 stride-1 projection.
    pub(crate) fn pointwise(&self, channels: usize) -> ConvConfig {
        ConvConfig::pointwise(channels)
            .with_bias(self.use_bias)
            .with_spectral_norm(self.spectral_norm)
    }

    /// 3x3 SAME transposed convolution with the given stride.
    pub(crate) fn deconv3x3(&self, stride: usize) -> ConvConfig {
        ConvConfig::deconv(self.channels)
            .with_kernel(3)
            .with_stride(stride)
            .with_bias(self.use_bias)
            .with_spectral_norm(self.spectral_norm)
    }
}

fn conv_bn_relu(scope: &Scope, x: &Tensor, conv_config: &ConvConfig, norm: &NormConfig) -> Result<Tensor> {
    let y = conv(&scope.pp("conv_0"), x, conv_config)?;
    batch_norm(&scope.pp("batch_norm"), &y, norm)?.relu()
}

/// Two 3x3 conv + batch-norm stages with an identity skip.
///
/// The input must already have `config.channels` channels.
pub fn resblock(scope: &Scope, x: &Tensor, config: &BlockConfig) -> Result<Tensor> {
    let conv3 = config.conv3x3(config.channels, 1);
    let y = conv_bn_relu(&scope.pp("res1"), x, &conv3, &config.norm)?;

    let res2 = scope.pp("res2");
    let y = conv(&res2.pp("conv_0"), &y, &conv3)?;
    let y = batch_norm(&res2.pp("batch_norm"), &y, &config.norm)?;
    checks::expect_same_shape("resblock.skip", &y, x)?;
    y + x
}

/// Residual upsampling by two with a transposed-convolution skip path.
pub fn resblock_up(scope: &Scope, x: &Tensor, config: &BlockConfig) -> Result<Tensor> {
    let res1 = scope.pp("res1");
    let y = deconv(&res1.pp("deconv_0"), x, &config.deconv3x3(2))?;
    let y = batch_norm(&res1.pp("batch_norm"), &y, &config.norm)?.relu()?;

    let res2 = scope.pp("res2");
    let y = deconv(&res2.pp("deconv_0"), &y, &config.deconv3x3(1))?;
    let y = batch_norm(&res2.pp("batch_norm"), &y, &config.norm)?;

    let skip = deconv(&scope.pp("skip").pp("deconv_0"), x, &config.deconv3x3(2))?;
    (y + skip)?.relu()
}

/// [`resblock_up`] with batch normalisation conditioned on `z`.
pub fn resblock_up_condition(
    scope: &Scope,
    x: &Tensor,
    z: &Tensor,
    config: &BlockConfig,
) -> Result<Tensor> {
    let res1 = scope.pp("res1");
    let y = deconv(&res1.pp("deconv_0"), x, &config.deconv3x3(2))?;
    let y = condition_batch_norm(&res1.pp("condition_batch_norm"), &y, z, &config.norm)?.relu()?;

    let res2 = scope.pp("res2");
    let y = deconv(&res2.pp("deconv_0"), &y, &config.deconv3x3(1))?;
    let y = condition_batch_norm(&res2.pp("condition_batch_norm"), &y, z, &config.norm)?;

    let skip = deconv(&scope.pp("skip").pp("deconv_0"), x, &config.deconv3x3(2))?;
    (y + skip)?.relu()
}

/// Residual downsampling by two with a strided-convolution skip path.
pub fn resblock_down(scope: &Scope, x: &Tensor, config: &BlockConfig) -> Result<Tensor> {
    let y = conv_bn_relu(&scope.pp("res1"), x, &config.conv3x3(config.channels, 2), &config.norm)?;

    let res2 = scope.pp("res2");
    let y = conv(&res2.pp("conv_0"), &y, &config.conv3x3(config.channels, 1))?;
    let y = batch_norm(&res2.pp("batch_norm"), &y, &config.norm)?;

    let skip = conv(&scope.pp("skip").pp("conv_0"), x, &config.conv3x3(config.channels, 2))?;
    (y + skip)?.relu()
}

/// Bottleneck stage used by [`dense_block`]: 1x1 to `4c`, then 3x3 to `c`.
fn bottleneck(scope: &Scope, x: &Tensor, config: &BlockConfig) -> Result<Tensor> {
    let y = conv(&scope.pp("conv_0"), x, &config.pointwise(4 * config.channels))?;
    let y = batch_norm(&scope.pp("batch_norm_0"), &y, &config.norm)?.relu()?;
    let y = conv(&scope.pp("conv_1"), &y, &config.conv3x3(config.channels, 1))?;
    batch_norm(&scope.pp("batch_norm_1"), &y, &config.norm)?.relu()
}

/// Densely connected stack: each stage sees the concatenation of the block
/// input and all earlier stage outputs; the result is that concatenation
/// extended by the final stage, i.e. `c_in + layers * channels` channels.
pub fn dense_block(scope: &Scope, x: &Tensor, config: &BlockConfig, layers: usize) -> Result<Tensor> {
    checks::expect_nhwc("dense_block.input", x)?;
    let mut features = vec![x.clone()];
    for i in 0..layers {
        let input = Tensor::cat(&features, 3)?;
        let y = bottleneck(&scope.pp(format!("bottle_neck_{i}")), &input, config)?;
        features.push(y);
    }
    Tensor::cat(&features, 3)
}

/// One residual dense unit: densely connected 3x3 stages, 1x1 local fusion,
/// local residual. The input must have `config.channels` channels.
fn residual_dense_unit(scope: &Scope, x: &Tensor, config: &BlockConfig, convs: usize) -> Result<Tensor> {
    let mut features = vec![x.clone()];
    for i in 0..convs {
        let input = Tensor::cat(&features, 3)?;
        let y = conv(&scope.pp(format!("conv_{i}")), &input, &config.conv3x3(config.channels, 1))?;
        let y = batch_norm(&scope.pp(format!("batch_norm_{i}")), &y, &config.norm)?.relu()?;
        features.push(y);
    }
    let fused = conv(&scope.pp("conv_last"), &Tensor::cat(&features, 3)?, &config.pointwise(config.channels))?;
    fused + x
}

/// Cascade of residual dense units with global feature fusion and a global
/// residual back to the input. The input must have `config.channels` channels.
pub fn residual_dense_block(
    scope: &Scope,
    x: &Tensor,
    config: &BlockConfig,
    blocks: usize,
    convs: usize,
) -> Result<Tensor> {
    let (_, _, _, c) = checks::expect_nhwc("residual_dense_block.input", x)?;
    if c != config.channels {
        return Err(candle_core::Error::Msg(format!(
            "residual_dense_block: input has {c} channels, block expects {}",
            config.channels
        )));
    }
    let mut outputs = Vec::with_capacity(blocks);
    let mut current = x.clone();
    for i in 0..blocks {
        current = residual_dense_unit(&scope.pp(format!("rdb_{i}")), &current, config, convs)?;
        outputs.push(current.clone());
    }
    let concat = Tensor::cat(&outputs, 3)?;
    let fused = conv(&scope.pp("gff_1x1"), &concat, &config.pointwise(config.channels))?;
    let fused = conv(&scope.pp("gff_3x3"), &fused, &config.conv3x3(config.channels, 1))?;
    fused + x
}
