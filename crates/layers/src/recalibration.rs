//! Channel and spatial recalibration blocks: SE, CBAM, global context and SRM.

use candle_core::{Error, Result, Tensor};
use candle_nn::ops::softmax;

use crate::{
    activations::sigmoid,
    checks,
    conv::{conv, ConvConfig, PadType},
    init::WeightInit,
    linear::{dense, DenseConfig},
    norm::{batch_norm, layer_norm, NormConfig, LAYER_NORM_EPSILON},
    params::Scope,
    pooling::{global_avg_pooling, global_max_pooling, hw_flatten},
    residual::BlockConfig,
};

/// Default bottleneck reduction for [`squeeze_excitation`] and the CBAM channel MLP.
pub const SE_RATIO: usize = 16;

const SRM_EPSILON: f64 = 1e-5;

fn check_channels(label: &str, x: &Tensor, config: &BlockConfig) -> Result<(usize, usize, usize, usize)> {
    let dims = checks::expect_nhwc(label, x)?;
    if dims.3 != config.channels {
        return Err(Error::Msg(format!(
            "{label}: input has {} channels, block expects {}",
            dims.3, config.channels
        )));
    }
    Ok(dims)
}

fn bottleneck_units(label: &str, channels: usize, ratio: usize) -> Result<usize> {
    if ratio == 0 || channels < ratio {
        return Err(Error::Msg(format!(
            "{label}: reduction ratio {ratio} incompatible with {channels} channels"
        )));
    }
    Ok(channels / ratio)
}

/// Two dense layers (`fc1`, `fc2`) with a ReLU between them, no output activation.
fn channel_mlp(scope: &Scope, pooled: &Tensor, config: &BlockConfig, units: usize) -> Result<Tensor> {
    let dense_config = |units| {
        DenseConfig::new(units)
            .with_bias(config.use_bias)
            .with_spectral_norm(config.spectral_norm)
    };
    let hidden = dense(&scope.pp("fc1"), pooled, &dense_config(units))?.relu()?;
    dense(&scope.pp("fc2"), &hidden, &dense_config(config.channels))
}

/// Squeeze-and-excitation: per-channel sigmoid gates computed from the
/// spatial mean.
pub fn squeeze_excitation(scope: &Scope, x: &Tensor, config: &BlockConfig, ratio: usize) -> Result<Tensor> {
    let (b, _, _, c) = check_channels("squeeze_excitation.input", x, config)?;
    let units = bottleneck_units("squeeze_excitation", c, ratio)?;
    let excitation = channel_mlp(scope, &global_avg_pooling(x)?, config, units)?;
    let excitation = sigmoid(&excitation)?.reshape((b, 1, 1, c))?;
    x.broadcast_mul(&excitation)
}

/// CBAM: channel attention followed by spatial attention.
///
/// The average- and max-pooled branches share the `channel_attention` MLP.
/// The spatial gate is a bias-free 7x7 convolution over the channel-wise mean
/// and max maps, reflect padded.
pub fn convolution_block_attention(
    scope: &Scope,
    x: &Tensor,
    config: &BlockConfig,
    ratio: usize,
) -> Result<Tensor> {
    let (b, _, _, c) = check_channels("convolution_block_attention.input", x, config)?;
    let units = bottleneck_units("convolution_block_attention", c, ratio)?;

    let channel_scope = scope.pp("channel_attention");
    let from_avg = channel_mlp(&channel_scope, &global_avg_pooling(x)?, config, units)?;
    let from_max = channel_mlp(&channel_scope, &global_max_pooling(x)?, config, units)?;
    let channel_gate = sigmoid(&(from_avg + from_max)?)?.reshape((b, 1, 1, c))?;
    let x = x.broadcast_mul(&channel_gate)?;

    let descriptor = Tensor::cat(&[x.mean_keepdim(3)?, x.max_keepdim(3)?], 3)?;
    let spatial_config = ConvConfig::new(1)
        .with_kernel(7)
        .with_stride(1)
        .with_pad(3, PadType::Reflect)
        .with_bias(false)
        .with_spectral_norm(config.spectral_norm);
    let spatial_gate = sigmoid(&conv(&scope.pp("spatial_attention").pp("conv"), &descriptor, &spatial_config)?)?;
    x.broadcast_mul(&spatial_gate)
}

/// 1x1 conv, layer norm, ReLU, 1x1 conv back to `channels`.
fn context_transform(scope: &Scope, context: &Tensor, config: &BlockConfig, channels: usize) -> Result<Tensor> {
    let y = conv(&scope.pp("conv_0"), context, &config.pointwise(config.channels))?;
    let norm = NormConfig {
        epsilon: LAYER_NORM_EPSILON,
        ..config.norm
    };
    let y = layer_norm(&scope.pp("layer_norm"), &y, &norm)?.relu()?;
    conv(&scope.pp("conv_1"), &y, &config.pointwise(channels))
}

/// Global context block.
///
/// A softmax attention mask pools the image into one context vector per
/// sample. `transform_0` turns it into a multiplicative channel gate,
/// `transform_1` into an additive term. `config.channels` is the bottleneck
/// width; the output keeps the input's channel count.
pub fn global_context_block(scope: &Scope, x: &Tensor, config: &BlockConfig) -> Result<Tensor> {
    let (b, _, _, c) = checks::expect_nhwc("global_context_block.input", x)?;

    let context_scope = scope.pp("context_modeling");
    let mask = conv(&context_scope.pp("conv"), x, &config.pointwise(1))?;
    // [b, n, 1], normalised over the positions.
    let mask = softmax(&hw_flatten(&mask)?, 1)?;
    let context = hw_flatten(x)?
        .t()?
        .contiguous()?
        .matmul(&mask)?
        .reshape((b, 1, 1, c))?;

    let gate = sigmoid(&context_transform(&scope.pp("transform_0"), &context, config, c)?)?;
    let x = x.broadcast_mul(&gate)?;
    let shift = context_transform(&scope.pp("transform_1"), &context, config, c)?;
    x.broadcast_add(&shift)
}

/// Style-based recalibration.
///
/// Per-channel spatial mean and standard deviation form a length-2 sequence
/// that a channel-wise conv1d (`kernel`, `[c, c, 2]`) and batch norm turn
/// into a sigmoid gate. `config.use_bias` controls the conv1d bias.
pub fn srm_block(scope: &Scope, x: &Tensor, config: &BlockConfig) -> Result<Tensor> {
    let (b, h, w, c) = check_channels("srm_block.input", x, config)?;
    let flat = x.reshape((b, h * w, c))?;
    let mean = flat.mean_keepdim(1)?;
    let var = flat.broadcast_sub(&mean)?.sqr()?.mean_keepdim(1)?;
    let std = (var + SRM_EPSILON)?.sqrt()?;
    // [b, c, 2]: candle's conv1d wants channels first.
    let style = Tensor::cat(&[mean, std], 1)?.transpose(1, 2)?.contiguous()?;

    let kernel = scope.param("kernel", (c, c, 2), &WeightInit::XavierUniform { gain: 1.0 })?;
    let mut z = style.conv1d(&kernel, 0, 1, 1, 1)?;
    if config.use_bias {
        let bias = scope.param("bias", c, &WeightInit::zeros())?;
        z = z.broadcast_add(&bias.reshape((1, c, 1))?)?;
    }
    // [b, 1, c]
    let z = z.transpose(1, 2)?.contiguous()?;
    let z = batch_norm(&scope.pp("batch_norm"), &z, &config.norm)?;
    let gate = sigmoid(&z)?;

    flat.broadcast_mul(&gate)?.reshape((b, h, w, c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Mode, ParamStore};
    use candle_core::{DType, Device};
    use std::sync::Arc;

    fn setup(seed: u64) -> (Arc<ParamStore>, Scope) {
        let store = Arc::new(ParamStore::seeded(seed, DType::F32, &Device::Cpu));
        let scope = Scope::new(Arc::clone(&store), Mode::Training);
        (store, scope)
    }

    fn ratio_to_input(y: &Tensor, x: &Tensor) -> Result<Vec<f32>> {
        (y / x)?.flatten_all()?.to_vec1::<f32>()
    }

    #[test]
    fn squeeze_excitation_gates_whole_channels() -> Result<()> {
        let (store, scope) = setup(0);
        let x = (Tensor::rand(0f32, 1.0, (2, 3, 3, 32), &Device::Cpu)? + 0.5)?;
        let y = squeeze_excitation(&scope.pp("senet"), &x, &BlockConfig::new(32), SE_RATIO)?;
        assert_eq!(y.dims(), x.dims());
        let ratios = ratio_to_input(&y, &x)?;
        // Same gate at every position of a channel, strictly inside (0, 1).
        for (i, r) in ratios.iter().enumerate() {
            assert!(*r > 0.0 && *r < 1.0);
            let same_channel_first_pixel = ratios[(i / (9 * 32)) * 9 * 32 + i % 32];
            assert!((r - same_channel_first_pixel).abs() < 1e-5);
        }
        assert_eq!(
            store.parameter("senet.fc1.kernel")?.map(|t| t.dims().to_vec()),
            Some(vec![2, 32])
        );
        Ok(())
    }

    #[test]
    fn squeeze_excitation_rejects_oversized_ratio() -> Result<()> {
        let (_, scope) = setup(0);
        let x = Tensor::ones((1, 2, 2, 8), DType::F32, &Device::Cpu)?;
        assert!(squeeze_excitation(&scope, &x, &BlockConfig::new(8), SE_RATIO).is_err());
        Ok(())
    }

    #[test]
    fn cbam_shares_channel_mlp() -> Result<()> {
        let (store, scope) = setup(1);
        let x = Tensor::randn(0f32, 1.0, (2, 8, 8, 16), &Device::Cpu)?;
        let y = convolution_block_attention(&scope.pp("cbam"), &x, &BlockConfig::new(16), 4)?;
        assert_eq!(y.dims(), x.dims());
        assert_eq!(
            store.trainable_paths()?,
            vec![
                "cbam.channel_attention.fc1.bias".to_string(),
                "cbam.channel_attention.fc1.kernel".to_string(),
                "cbam.channel_attention.fc2.bias".to_string(),
                "cbam.channel_attention.fc2.kernel".to_string(),
                "cbam.spatial_attention.conv.kernel".to_string(),
            ]
        );
        assert_eq!(
            store.parameter("cbam.spatial_attention.conv.kernel")?.map(|t| t.dims().to_vec()),
            Some(vec![1, 2, 7, 7])
        );
        Ok(())
    }

    #[test]
    fn global_context_keeps_input_channels() -> Result<()> {
        let (store, scope) = setup(2);
        let x = Tensor::randn(0f32, 1.0, (2, 4, 4, 12), &Device::Cpu)?;
        let y = global_context_block(&scope.pp("gc_block"), &x, &BlockConfig::new(6))?;
        assert_eq!(y.dims(), x.dims());
        let paths = store.trainable_paths()?;
        assert!(paths.contains(&"gc_block.context_modeling.conv.kernel".to_string()));
        assert!(paths.contains(&"gc_block.transform_1.layer_norm.gamma".to_string()));
        assert_eq!(
            store.parameter("gc_block.transform_0.conv_1.kernel")?.map(|t| t.dims().to_vec()),
            Some(vec![12, 6, 1, 1])
        );
        Ok(())
    }

    #[test]
    fn srm_gate_is_per_channel() -> Result<()> {
        let (store, scope) = setup(3);
        let x = (Tensor::rand(0f32, 1.0, (4, 3, 3, 5), &Device::Cpu)? + 1.0)?;
        let config = BlockConfig::new(5).with_bias(false);
        let y = srm_block(&scope.pp("srm_block"), &x, &config)?;
        assert_eq!(y.dims(), x.dims());
        let ratios = ratio_to_input(&y, &x)?;
        for (i, r) in ratios.iter().enumerate() {
            let first = ratios[(i / 45) * 45 + i % 5];
            assert!((r - first).abs() < 1e-5);
        }
        assert_eq!(
            store.buffer_paths()?,
            vec![
                "srm_block.batch_norm.moving_mean".to_string(),
                "srm_block.batch_norm.moving_variance".to_string(),
            ]
        );
        assert!(store.parameter("srm_block.bias")?.is_none());
        Ok(())
    }
}
