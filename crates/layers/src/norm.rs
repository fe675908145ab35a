//! Normalisation family for channels-last activations.
//!
//! Every variant standardises with `(x - mean) / sqrt(var + epsilon)` and then
//! applies learned or supplied affine parameters. They differ only in which
//! axes the moments are taken over:
//!
//! | variant  | axes (for `[b, h, w, c]`) |
//! |----------|---------------------------|
//! | batch    | `b, h, w`                 |
//! | instance | `h, w`                    |
//! | layer    | `h, w, c`                 |
//! | group    | `h, w` and channels within a group |
//!
//! Batch and conditional batch normalisation keep running estimates as
//! non-trainable buffers: they are updated with an exponential moving average
//! in [`Mode::Training`] and used instead of batch moments in
//! [`Mode::Inference`]. Moments are reduced through [`moments`], which promotes
//! half-precision inputs before reducing.

use candle_core::{Result, Tensor};
use candle_nn::ops::softmax;
use serde::{Deserialize, Serialize};

use crate::{
    checks,
    init::WeightInit,
    linear::{dense, DenseConfig},
    params::{Constraint, Mode, Scope},
    stats::{batch_axes, layer_axes, moments, spatial_axes, standardize},
};

/// Stabiliser used by [`pixel_norm`].
pub const PIXEL_NORM_EPSILON: f64 = 1e-8;

/// Stabiliser used by [`NormConfig::layer_norm`].
pub const LAYER_NORM_EPSILON: f64 = 1e-12;

/// Default number of groups for [`group_norm`].
pub const DEFAULT_GROUPS: usize = 32;

/// Numeric settings shared by the normalisation layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormConfig {
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Moving-average decay for running statistics.
    pub decay: f64,
}

impl Default for NormConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            decay: 0.9,
        }
    }
}

impl NormConfig {
    /// Settings for [`layer_norm`], which uses a much smaller stabiliser.
    pub fn layer_norm() -> Self {
        Self {
            epsilon: LAYER_NORM_EPSILON,
            ..Self::default()
        }
    }
}

/// Normalisation variants that only need the input tensor and a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormKind {
    Batch,
    Instance,
    Layer,
    Group { groups: usize },
    Pixel,
    BatchInstance,
    Switch,
}

/// Dispatches to the variant selected by `kind`.
pub fn normalize(scope: &Scope, x: &Tensor, kind: NormKind, config: &NormConfig) -> Result<Tensor> {
    match kind {
        NormKind::Batch => batch_norm(scope, x, config),
        NormKind::Instance => instance_norm(scope, x, config),
        NormKind::Layer => layer_norm(scope, x, config),
        NormKind::Group { groups } => group_norm(scope, x, groups, config),
        NormKind::Pixel => pixel_norm(x, PIXEL_NORM_EPSILON),
        NormKind::BatchInstance => batch_instance_norm(scope, x, config),
        NormKind::Switch => switch_norm(scope, x, config),
    }
}

fn scale_and_shift(scope: &Scope, x: &Tensor, channels: usize) -> Result<Tensor> {
    let gamma = scope.param("gamma", channels, &WeightInit::ones())?;
    let beta = scope.param("beta", channels, &WeightInit::zeros())?;
    x.broadcast_mul(&gamma)?.broadcast_add(&beta)
}

/// Batch moments in training (folding them into the running buffers),
/// running buffers in inference.
fn population_moments(
    scope: &Scope,
    x: &Tensor,
    channels: usize,
    config: &NormConfig,
    (mean_name, var_name): (&str, &str),
) -> Result<(Tensor, Tensor)> {
    match scope.mode() {
        Mode::Training => {
            let (mean, var) = moments(x, &batch_axes(x.rank()))?;
            let decay = config.decay;
            let updates = [
                (mean_name, &mean, WeightInit::zeros()),
                (var_name, &var, WeightInit::ones()),
            ];
            for (name, batch_stat, init) in updates {
                let observed = batch_stat.detach().flatten_all()?;
                scope.update_buffer(name, channels, &init, |running| {
                    let next = ((running * decay)? + (&observed * (1.0 - decay))?)?;
                    Ok((next, ()))
                })?;
            }
            Ok((mean, var))
        }
        Mode::Inference => Ok((
            scope.buffer(mean_name, channels, &WeightInit::zeros())?,
            scope.buffer(var_name, channels, &WeightInit::ones())?,
        )),
    }
}

/// Batch normalisation with running statistics.
pub fn batch_norm(scope: &Scope, x: &Tensor, config: &NormConfig) -> Result<Tensor> {
    let channels = checks::channels("batch_norm.input", x)?;
    let (mean, var) =
        population_moments(scope, x, channels, config, ("moving_mean", "moving_variance"))?;
    let normalized = standardize(x, &mean, &var, config.epsilon)?;
    scale_and_shift(scope, &normalized, channels)
}

/// Per-sample, per-channel normalisation over the spatial axes.
pub fn instance_norm(scope: &Scope, x: &Tensor, config: &NormConfig) -> Result<Tensor> {
    checks::expect_min_rank("instance_norm.input", x, 3)?;
    let channels = checks::channels("instance_norm.input", x)?;
    let (mean, var) = moments(x, &spatial_axes(x.rank()))?;
    let normalized = standardize(x, &mean, &var, config.epsilon)?;
    scale_and_shift(scope, &normalized, channels)
}

/// Per-sample normalisation over every non-batch axis, affine per channel.
///
/// Pass [`NormConfig::layer_norm`] for the conventional 1e-12 stabiliser.
pub fn layer_norm(scope: &Scope, x: &Tensor, config: &NormConfig) -> Result<Tensor> {
    let channels = checks::channels("layer_norm.input", x)?;
    let (mean, var) = moments(x, &layer_axes(x.rank()))?;
    let normalized = standardize(x, &mean, &var, config.epsilon)?;
    scale_and_shift(scope, &normalized, channels)
}

/// Normalisation over the spatial axes and `channels / groups` channel slices.
pub fn group_norm(scope: &Scope, x: &Tensor, groups: usize, config: &NormConfig) -> Result<Tensor> {
    let channels = checks::channels("group_norm.input", x)?;
    checks::expect_divisible("group_norm.channels", channels, groups)?;
    let dims = x.dims().to_vec();
    let batch = dims[0];
    let spatial: usize = dims[1..dims.len() - 1].iter().product();

    let grouped = x.reshape((batch, spatial, groups, channels / groups))?;
    let (mean, var) = moments(&grouped, &[1, 3])?;
    let normalized = standardize(&grouped, &mean, &var, config.epsilon)?.reshape(dims)?;
    scale_and_shift(scope, &normalized, channels)
}

/// Instance normalisation with caller-supplied scale and offset.
///
/// `gamma` and `beta` must broadcast against `x` (typically `[b, 1, 1, c]`).
pub fn adaptive_instance_norm(
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    epsilon: f64,
) -> Result<Tensor> {
    checks::expect_min_rank("adaptive_instance_norm.input", x, 3)?;
    let (mean, var) = moments(x, &spatial_axes(x.rank()))?;
    standardize(x, &mean, &var, epsilon)?
        .broadcast_mul(gamma)?
        .broadcast_add(beta)
}

/// Scales every feature vector to unit root-mean-square over the channel axis.
pub fn pixel_norm(x: &Tensor, epsilon: f64) -> Result<Tensor> {
    checks::channels("pixel_norm.input", x)?;
    let mean_square = x.sqr()?.mean_keepdim(x.rank() - 1)?;
    x.broadcast_div(&(mean_square + epsilon)?.sqrt()?)
}

/// Batch normalisation whose scale and offset are dense projections of `z`.
///
/// Projections live under `<scope>.gamma` and `<scope>.beta`; running
/// statistics are the `pop_mean` / `pop_var` buffers.
pub fn condition_batch_norm(
    scope: &Scope,
    x: &Tensor,
    z: &Tensor,
    config: &NormConfig,
) -> Result<Tensor> {
    let channels = checks::channels("condition_batch_norm.input", x)?;
    let (mean, var) = population_moments(scope, x, channels, config, ("pop_mean", "pop_var"))?;

    let mut affine_shape = vec![1; x.rank()];
    affine_shape[0] = z.dim(0)?;
    affine_shape[x.rank() - 1] = channels;
    let beta = dense(&scope.pp("beta"), z, &DenseConfig::new(channels))?.reshape(affine_shape.clone())?;
    let gamma = dense(&scope.pp("gamma"), z, &DenseConfig::new(channels))?.reshape(affine_shape)?;

    standardize(x, &mean, &var, config.epsilon)?
        .broadcast_mul(&gamma)?
        .broadcast_add(&beta)
}

/// Learned per-channel blend `rho * batch + (1 - rho) * instance`.
///
/// `rho` is clipped into `[0, 1]` by [`ParamStore::apply_constraints`](crate::params::ParamStore::apply_constraints).
pub fn batch_instance_norm(scope: &Scope, x: &Tensor, config: &NormConfig) -> Result<Tensor> {
    checks::expect_min_rank("batch_instance_norm.input", x, 3)?;
    let channels = checks::channels("batch_instance_norm.input", x)?;
    let (batch_mean, batch_var) = moments(x, &batch_axes(x.rank()))?;
    let x_batch = standardize(x, &batch_mean, &batch_var, config.epsilon)?;
    let (ins_mean, ins_var) = moments(x, &spatial_axes(x.rank()))?;
    let x_ins = standardize(x, &ins_mean, &ins_var, config.epsilon)?;

    let rho = scope.constrained_param(
        "rho",
        channels,
        &WeightInit::ones(),
        Constraint::Clip { min: 0.0, max: 1.0 },
    )?;
    let blended = (x_batch.broadcast_mul(&rho)? + x_ins.broadcast_mul(&rho.affine(-1.0, 1.0)?)?)?;
    scale_and_shift(scope, &blended, channels)
}

/// Softmax over mixing logits; the three weights always sum to one.
pub fn mixing_weights(logits: &Tensor) -> Result<Tensor> {
    softmax(logits, 0)
}

/// Switchable normalisation: learned mixture of batch, instance and layer moments.
pub fn switch_norm(scope: &Scope, x: &Tensor, config: &NormConfig) -> Result<Tensor> {
    checks::expect_min_rank("switch_norm.input", x, 3)?;
    let channels = checks::channels("switch_norm.input", x)?;
    let rank = x.rank();
    let (batch_mean, batch_var) = moments(x, &batch_axes(rank))?;
    let (ins_mean, ins_var) = moments(x, &spatial_axes(rank))?;
    let (layer_mean, layer_var) = moments(x, &layer_axes(rank))?;

    let mean_weight = mixing_weights(&scope.param("mean_weight", 3, &WeightInit::ones())?)?;
    let var_weight = mixing_weights(&scope.param("var_weight", 3, &WeightInit::ones())?)?;
    let mix = |weights: &Tensor, stats: [&Tensor; 3]| -> Result<Tensor> {
        let mut total = stats[0].broadcast_mul(&weights.narrow(0, 0, 1)?)?;
        for (i, stat) in stats.iter().enumerate().skip(1) {
            total = total.broadcast_add(&stat.broadcast_mul(&weights.narrow(0, i, 1)?)?)?;
        }
        Ok(total)
    };
    let mean = mix(&mean_weight, [&batch_mean, &ins_mean, &layer_mean])?;
    let var = mix(&var_weight, [&batch_var, &ins_var, &layer_var])?;

    let normalized = standardize(x, &mean, &var, config.epsilon)?;
    scale_and_shift(scope, &normalized, channels)
}
