//! Convolution primitives for channels-last images.
//!
//! Kernels are stored in Candle's layout (`[out, in, k, k]` for convolutions,
//! `[in, out, k, k]` for transposed convolutions) under `<scope>.kernel`, with
//! an optional `<scope>.bias` of shape `[out]`. Inputs and outputs are
//! `(batch, height, width, channels)`; the NCHW permutation required by the
//! Candle kernels stays internal to this module.
//!
//! Explicit padding is always applied before a VALID convolution, which keeps
//! the asymmetric splits used by the GAN literature (extra row/column at the
//! trailing edge) independent of what the backend supports.

use candle_core::{Error, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    checks,
    init::WeightInit,
    params::Scope,
    pooling::{depth_to_space, space_to_depth, to_nchw, to_nhwc},
    spectral::spectral_norm,
};

/// Values written into the explicit border of [`conv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadType {
    Zero,
    /// Mirror padding that excludes the edge pixel.
    Reflect,
}

/// Output-size policy for partial, dilated and transposed convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Output spatial size is `ceil(input / stride)` (`input * stride` when transposed).
    Same,
    /// No implicit padding.
    Valid,
}

/// Configuration shared by every convolution primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    /// Output channel count.
    pub channels: usize,
    pub kernel: usize,
    pub stride: usize,
    /// Dilation rate; only [`dilate_conv`] honours values above one.
    pub rate: usize,
    /// Explicit border requested by [`conv`]; see [`conv_padding`].
    pub pad: usize,
    pub pad_type: PadType,
    /// Padding policy for [`partial_conv`], [`dilate_conv`] and [`deconv`].
    pub padding: Padding,
    pub use_bias: bool,
    pub spectral_norm: bool,
}

impl ConvConfig {
    /// Plain convolution defaults: 4x4 kernel, stride 2, no padding.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            kernel: 4,
            stride: 2,
            rate: 1,
            pad: 0,
            pad_type: PadType::Zero,
            padding: Padding::Valid,
            use_bias: true,
            spectral_norm: false,
        }
    }

    /// Partial convolution defaults: 3x3 kernel, stride 2, SAME.
    pub fn partial(channels: usize) -> Self {
        Self {
            kernel: 3,
            padding: Padding::Same,
            ..Self::new(channels)
        }
    }

    /// Dilated convolution defaults: 3x3 kernel, rate 2, stride 1, SAME.
    pub fn dilated(channels: usize) -> Self {
        Self {
            kernel: 3,
            stride: 1,
            rate: 2,
            padding: Padding::Same,
            ..Self::new(channels)
        }
    }

    /// Transposed convolution defaults: 4x4 kernel, stride 2, SAME.
    pub fn deconv(channels: usize) -> Self {
        Self {
            padding: Padding::Same,
            ..Self::new(channels)
        }
    }

    /// 1x1 stride-1 projection.
    pub fn pointwise(channels: usize) -> Self {
        Self {
            kernel: 1,
            stride: 1,
            ..Self::new(channels)
        }
    }

    pub fn with_kernel(mut self, kernel: usize) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_rate(mut self, rate: usize) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_pad(mut self, pad: usize, pad_type: PadType) -> Self {
        self.pad = pad;
        self.pad_type = pad_type;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_spectral_norm(mut self, spectral_norm: bool) -> Self {
        self.spectral_norm = spectral_norm;
        self
    }

    fn validate(&self, label: &str) -> Result<()> {
        let mut errors = Vec::new();
        if self.channels == 0 {
            errors.push("channels must be positive");
        }
        if self.kernel == 0 {
            errors.push("kernel must be positive");
        }
        if self.stride == 0 {
            errors.push("stride must be positive");
        }
        if self.rate == 0 {
            errors.push("rate must be positive");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Msg(format!("{label}: {}", errors.join(", "))))
        }
    }
}

/// Leading and trailing border applied by [`conv`] along an axis of size `dim`.
///
/// When `dim` is divisible by `stride` the requested `pad` is applied on both
/// sides; otherwise just enough border is added to complete the last window.
pub fn conv_padding(dim: usize, kernel: usize, stride: usize, pad: usize) -> (usize, usize) {
    if pad == 0 {
        return (0, 0);
    }
    let total = if dim % stride == 0 {
        pad * 2
    } else {
        kernel.saturating_sub(dim % stride)
    };
    (total / 2, total - total / 2)
}

/// Spatial size produced by [`conv`] for an input axis of size `dim`.
pub fn conv_output_dim(dim: usize, kernel: usize, stride: usize, pad: usize) -> usize {
    let (before, after) = conv_padding(dim, kernel, stride, pad);
    (dim + before + after).saturating_sub(kernel) / stride + 1
}

/// TensorFlow SAME padding for a window of (effective) size `kernel`.
pub fn same_padding(dim: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let out = dim.div_ceil(stride);
    let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(dim);
    (total / 2, total - total / 2)
}

/// Spatial size produced by [`deconv`] for an input axis of size `dim`.
pub fn deconv_output_dim(dim: usize, kernel: usize, stride: usize, padding: Padding) -> usize {
    match padding {
        Padding::Same => dim * stride,
        Padding::Valid => dim * stride + kernel.saturating_sub(stride),
    }
}

/// Pads the height and width axes of a channels-last tensor.
pub fn pad_spatial(
    x: &Tensor,
    (top, bottom): (usize, usize),
    (left, right): (usize, usize),
    pad_type: PadType,
) -> Result<Tensor> {
    match pad_type {
        PadType::Zero => x.pad_with_zeros(1, top, bottom)?.pad_with_zeros(2, left, right),
        PadType::Reflect => {
            let (_, h, w, _) = checks::expect_nhwc("pad_spatial.input", x)?;
            let rows = reflect_indices(h, top, bottom)?;
            let cols = reflect_indices(w, left, right)?;
            let rows = Tensor::from_vec(rows, h + top + bottom, x.device())?;
            let cols = Tensor::from_vec(cols, w + left + right, x.device())?;
            x.index_select(&rows, 1)?.index_select(&cols, 2)
        }
    }
}

fn reflect_indices(len: usize, before: usize, after: usize) -> Result<Vec<u32>> {
    if before >= len || after >= len {
        return Err(Error::Msg(format!(
            "reflect padding ({before}, {after}) must be smaller than the padded axis ({len})"
        )));
    }
    let last = len as i64 - 1;
    Ok((0..(len + before + after) as i64)
        .map(|i| {
            let pos = i - before as i64;
            let mirrored = if pos < 0 {
                -pos
            } else if pos > last {
                2 * last - pos
            } else {
                pos
            };
            mirrored as u32
        })
        .collect())
}

fn kernel_weight(
    scope: &Scope,
    shape: (usize, usize, usize, usize),
    spectral: bool,
) -> Result<Tensor> {
    let kernel = scope.kernel("kernel", shape)?;
    if spectral {
        spectral_norm(scope, &kernel, 1)
    } else {
        Ok(kernel)
    }
}

fn bias(scope: &Scope, channels: usize) -> Result<Tensor> {
    scope.param("bias", channels, &WeightInit::zeros())
}

fn add_bias(scope: &Scope, y: Tensor, config: &ConvConfig) -> Result<Tensor> {
    if config.use_bias {
        y.broadcast_add(&bias(scope, config.channels)?)
    } else {
        Ok(y)
    }
}

/// VALID convolution of an already padded channels-last tensor.
fn conv_valid(x: &Tensor, kernel: &Tensor, stride: usize, dilation: usize) -> Result<Tensor> {
    let y = to_nchw(x)?.conv2d(kernel, 0, stride, dilation, 1)?;
    to_nhwc(&y)
}

/// Strided convolution with explicit zero or reflect padding.
pub fn conv(scope: &Scope, x: &Tensor, config: &ConvConfig) -> Result<Tensor> {
    config.validate("conv")?;
    let (_, h, w, c_in) = checks::expect_nhwc("conv.input", x)?;
    let k = config.kernel;
    let padded = if config.pad > 0 {
        pad_spatial(
            x,
            conv_padding(h, k, config.stride, config.pad),
            conv_padding(w, k, config.stride, config.pad),
            config.pad_type,
        )?
    } else {
        x.clone()
    };
    let kernel = kernel_weight(scope, (config.channels, c_in, k, k), config.spectral_norm)?;
    let y = conv_valid(&padded, &kernel, config.stride, 1)?;
    add_bias(scope, y, config)
}

/// Convolution renormalised by the fraction of each window that covers the image.
///
/// With SAME padding the border windows see fewer valid pixels; their response
/// is scaled by `k^2 / coverage`, and the bias is masked by the clipped
/// coverage. VALID padding degenerates to a plain strided convolution.
pub fn partial_conv(scope: &Scope, x: &Tensor, config: &ConvConfig) -> Result<Tensor> {
    config.validate("partial_conv")?;
    let (_, h, w, c_in) = checks::expect_nhwc("partial_conv.input", x)?;
    let (k, stride) = (config.kernel, config.stride);
    let kernel = kernel_weight(scope, (config.channels, c_in, k, k), config.spectral_norm)?;

    match config.padding {
        Padding::Valid => {
            let y = conv_valid(x, &kernel, stride, 1)?;
            add_bias(scope, y, config)
        }
        Padding::Same => {
            let pad_h = same_padding(h, k, stride);
            let pad_w = same_padding(w, k, stride);

            let ones = Tensor::ones((1, h, w, 1), x.dtype(), x.device())?;
            let window = Tensor::ones((1, 1, k, k), x.dtype(), x.device())?;
            let coverage = conv_valid(&pad_spatial(&ones, pad_h, pad_w, PadType::Zero)?, &window, stride, 1)?;
            let ratio = (&coverage + 1e-8)?.recip()?.affine((k * k) as f64, 0.0)?;
            let mask = coverage.clamp(0.0, 1.0)?;
            let ratio = (ratio * &mask)?;

            let y = conv_valid(&pad_spatial(x, pad_h, pad_w, PadType::Zero)?, &kernel, stride, 1)?;
            let y = y.broadcast_mul(&ratio)?;
            if config.use_bias {
                y.broadcast_add(&bias(scope, config.channels)?)?
                    .broadcast_mul(&mask)
            } else {
                Ok(y)
            }
        }
    }
}

/// Atrous convolution with stride 1.
pub fn dilate_conv(scope: &Scope, x: &Tensor, config: &ConvConfig) -> Result<Tensor> {
    config.validate("dilate_conv")?;
    let (_, h, w, c_in) = checks::expect_nhwc("dilate_conv.input", x)?;
    let (k, rate) = (config.kernel, config.rate);
    let kernel = kernel_weight(scope, (config.channels, c_in, k, k), config.spectral_norm)?;
    let padded = match config.padding {
        Padding::Same => {
            let effective = (k - 1) * rate + 1;
            pad_spatial(
                x,
                same_padding(h, effective, 1),
                same_padding(w, effective, 1),
                PadType::Zero,
            )?
        }
        Padding::Valid => x.clone(),
    };
    let y = conv_valid(&padded, &kernel, 1, rate)?;
    add_bias(scope, y, config)
}

/// Transposed convolution; see [`deconv_output_dim`] for the output size.
pub fn deconv(scope: &Scope, x: &Tensor, config: &ConvConfig) -> Result<Tensor> {
    config.validate("deconv")?;
    let (_, h, w, c_in) = checks::expect_nhwc("deconv.input", x)?;
    let (k, stride) = (config.kernel, config.stride);
    let kernel = kernel_weight(scope, (c_in, config.channels, k, k), config.spectral_norm)?;

    let full = to_nchw(x)?.conv_transpose2d(&kernel, 0, 0, stride, 1)?;
    let crop = match config.padding {
        Padding::Same => k.saturating_sub(stride) / 2,
        Padding::Valid => 0,
    };
    let y = fit_axis(&full, 2, deconv_output_dim(h, k, stride, config.padding), crop)?;
    let y = fit_axis(&y, 3, deconv_output_dim(w, k, stride, config.padding), crop)?;
    add_bias(scope, to_nhwc(&y)?, config)
}

fn fit_axis(t: &Tensor, dim: usize, target: usize, crop: usize) -> Result<Tensor> {
    let len = t.dim(dim)?;
    if len >= target {
        t.narrow(dim, crop.min(len - target), target)
    } else {
        t.pad_with_zeros(dim, 0, target - len)
    }
}

/// Upsampling by sub-pixel convolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelShuffleConfig {
    pub scale_factor: usize,
    pub use_bias: bool,
    pub spectral_norm: bool,
}

impl PixelShuffleConfig {
    pub fn new(scale_factor: usize) -> Self {
        Self {
            scale_factor,
            use_bias: true,
            spectral_norm: false,
        }
    }
}

/// 1x1 projection to `c * s^2` channels followed by depth-to-space.
pub fn pixel_shuffle_up(scope: &Scope, x: &Tensor, config: &PixelShuffleConfig) -> Result<Tensor> {
    let c = checks::channels("pixel_shuffle_up.input", x)?;
    let s = config.scale_factor;
    let projection = ConvConfig::pointwise(c * s * s)
        .with_bias(config.use_bias)
        .with_spectral_norm(config.spectral_norm);
    depth_to_space(&conv(scope, x, &projection)?, s)
}

/// 1x1 projection to `c / s^2` channels followed by space-to-depth.
pub fn pixel_shuffle_down(scope: &Scope, x: &Tensor, config: &PixelShuffleConfig) -> Result<Tensor> {
    let c = checks::channels("pixel_shuffle_down.input", x)?;
    let s = config.scale_factor;
    checks::expect_divisible("pixel_shuffle_down.channels", c, s * s)?;
    let projection = ConvConfig::pointwise(c / (s * s))
        .with_bias(config.use_bias)
        .with_spectral_norm(config.spectral_norm);
    space_to_depth(&conv(scope, x, &projection)?, s)
}
