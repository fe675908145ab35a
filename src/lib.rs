//! GAN building blocks on Candle.
//!
//! [`layers`] holds the scoped parameter registry, convolution and dense
//! primitives, the normalisation family and composite blocks; [`losses`]
//! holds reconstruction, perceptual and adversarial objectives.

pub use layers;
pub use losses;

use candle_core::{Device, Result};

/// Everything needed to assemble a generator or discriminator.
pub mod prelude {
    pub use layers::{
        activations::{lrelu, relu, sigmoid, tanh},
        attention::{self_attention, self_attention_with_pooling},
        conv::{conv, deconv, dilate_conv, partial_conv, pixel_shuffle_down, pixel_shuffle_up},
        linear::dense,
        norm::{batch_norm, condition_batch_norm, instance_norm, layer_norm, normalize, pixel_norm},
        pooling::{flatten, global_avg_pooling, up_sample},
        recalibration::{convolution_block_attention, global_context_block, squeeze_excitation, srm_block},
        residual::{dense_block, resblock, resblock_down, resblock_up, resblock_up_condition, residual_dense_block},
        spectral::spectral_norm,
        Activation, BlockConfig, ConvConfig, DenseConfig, Mode, NormConfig, NormKind, PadType, Padding,
        ParamStore, PixelShuffleConfig, Scope, StoreConfig, WeightInit,
    };
    pub use losses::{
        discriminator_loss, generator_loss, simple_gradient_penalty, AdversarialConfig, GanLoss,
        LossError,
    };
}

/// Picks the compute device: CPU when `CANDLE_FORCE_CPU` is set, otherwise
/// see [`select_device`].
pub fn default_device() -> Result<Device> {
    select_device(std::env::var_os("CANDLE_FORCE_CPU").is_some())
}

/// CPU when `force_cpu`, otherwise Metal (with the `metal` feature) or CUDA
/// when available, falling back to CPU.
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        log::info!("CPU backend forced");
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("Metal device selected: {device:?}");
                return Ok(device);
            }
            Err(err) => log::info!("Metal unavailable ({err}), falling back"),
        }
    }
    let device = Device::cuda_if_available(0)?;
    if device.is_cuda() {
        log::info!("CUDA device selected: {device:?}");
    } else {
        log::info!("using CPU backend");
    }
    Ok(device)
}
