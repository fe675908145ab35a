//! Weight initialisation policies.
//!
//! Kernels default to a truncated normal with `stddev = 0.02`, the common
//! choice for GAN generators and discriminators. Xavier and Kaiming variants
//! follow the PyTorch gain conventions so architectures ported from either
//! framework start from the same distribution. Sampling goes through a
//! caller-provided RNG so a seeded [`ParamStore`](crate::params::ParamStore)
//! produces reproducible parameters.

use candle_core::{DType, Device, Error, Result, Shape, Tensor};
use rand::{distributions::Uniform, Rng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Supported initialisation distributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightInit {
    /// Every element set to `value`.
    Constant { value: f64 },
    /// Gaussian samples.
    Normal { mean: f64, stddev: f64 },
    /// Gaussian samples re-drawn until they fall within two standard deviations.
    TruncatedNormal { mean: f64, stddev: f64 },
    /// Uniform samples in `[low, high]`.
    Uniform { low: f64, high: f64 },
    /// Xavier/Glorot uniform initialisation.
    XavierUniform { gain: f64 },
    /// Xavier/Glorot normal initialisation.
    XavierNormal { gain: f64 },
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
    /// Kaiming/He normal initialisation.
    KaimingNormal { negative_slope: f64 },
}

impl Default for WeightInit {
    fn default() -> Self {
        Self::TruncatedNormal {
            mean: 0.0,
            stddev: 0.02,
        }
    }
}

impl WeightInit {
    pub fn zeros() -> Self {
        Self::Constant { value: 0.0 }
    }

    pub fn ones() -> Self {
        Self::Constant { value: 1.0 }
    }

    pub fn standard_normal() -> Self {
        Self::Normal {
            mean: 0.0,
            stddev: 1.0,
        }
    }

    /// Draws a tensor of `shape` on `device`, cast to `dtype`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        shape: &Shape,
        dtype: DType,
        device: &Device,
        rng: &mut R,
    ) -> Result<Tensor> {
        let count = shape.elem_count();
        let (fan_in, fan_out) = fans(shape.dims());
        let values = match self {
            WeightInit::Constant { value } => {
                return Tensor::full(*value as f32, shape.clone(), device)?.to_dtype(dtype)
            }
            WeightInit::Normal { mean, stddev } => normal_values(*mean, *stddev, count, rng)?,
            WeightInit::TruncatedNormal { mean, stddev } => {
                let normal = gaussian(*mean, *stddev)?;
                let limit = 2.0 * stddev.abs();
                (0..count)
                    .map(|_| loop {
                        let sample = normal.sample(rng);
                        if (sample - mean).abs() <= limit {
                            break sample as f32;
                        }
                    })
                    .collect()
            }
            WeightInit::Uniform { low, high } => uniform_values(*low, *high, count, rng),
            WeightInit::XavierUniform { gain } => {
                let bound = gain * (6.0 / (fan_in + fan_out)).sqrt();
                uniform_values(-bound, bound, count, rng)
            }
            WeightInit::XavierNormal { gain } => {
                let std = gain * (2.0 / (fan_in + fan_out)).sqrt();
                normal_values(0.0, std, count, rng)?
            }
            WeightInit::KaimingUniform { negative_slope } => {
                let gain = (2.0 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3.0f64.sqrt() * gain / fan_in.sqrt();
                uniform_values(-bound, bound, count, rng)
            }
            WeightInit::KaimingNormal { negative_slope } => {
                let gain = (2.0 / (1.0 + negative_slope.powi(2))).sqrt();
                normal_values(0.0, gain / fan_in.sqrt(), count, rng)?
            }
        };
        Tensor::from_vec(values, shape.clone(), device)?.to_dtype(dtype)
    }
}

/// `(fan_in, fan_out)` for a weight laid out as `[out, in, *receptive]`.
pub fn fans(dims: &[usize]) -> (f64, f64) {
    match dims {
        [] => (1.0, 1.0),
        [n] => (*n as f64, *n as f64),
        [out, inp, receptive @ ..] => {
            let receptive: usize = receptive.iter().product();
            ((inp * receptive) as f64, (out * receptive) as f64)
        }
    }
}

fn gaussian(mean: f64, stddev: f64) -> Result<Normal<f64>> {
    Normal::new(mean, stddev)
        .map_err(|err| Error::Msg(format!("invalid normal initialiser ({mean}, {stddev}): {err}")))
}

fn normal_values<R: Rng + ?Sized>(
    mean: f64,
    stddev: f64,
    count: usize,
    rng: &mut R,
) -> Result<Vec<f32>> {
    let normal = gaussian(mean, stddev)?;
    Ok((0..count).map(|_| normal.sample(rng) as f32).collect())
}

fn uniform_values<R: Rng + ?Sized>(low: f64, high: f64, count: usize, rng: &mut R) -> Vec<f32> {
    let (low, high) = if low <= high { (low, high) } else { (high, low) };
    let dist = Uniform::new_inclusive(low, high);
    (0..count).map(|_| dist.sample(rng) as f32).collect()
}
