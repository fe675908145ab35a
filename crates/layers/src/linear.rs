//! Fully connected projection.
//!
//! Inputs of any rank are flattened to `(batch, features)` before the affine
//! map, so dense layers can sit directly on top of convolutional feature maps.
//! The kernel is stored as `[units, features]` under `<scope>.kernel`.

use candle_core::{Error, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    init::WeightInit, params::Scope, pooling::flatten, spectral::spectral_norm,
};

/// Configuration for [`dense`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseConfig {
    /// Output feature count.
    pub units: usize,
    pub use_bias: bool,
    pub spectral_norm: bool,
}

impl DenseConfig {
    pub fn new(units: usize) -> Self {
        Self {
            units,
            use_bias: true,
            spectral_norm: false,
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
}

/// `flatten(x) @ W^T + b`, returning `(batch, units)`.
pub fn dense(scope: &Scope, x: &Tensor, config: &DenseConfig) -> Result<Tensor> {
    if config.units == 0 {
        return Err(Error::Msg("dense: units must be positive".into()));
    }
    let x = flatten(x)?;
    let (_, features) = x.dims2()?;

    let mut weight = scope.kernel("kernel", (config.units, features))?;
    if config.spectral_norm {
        weight = spectral_norm(scope, &weight, 1)?;
    }
    let y = x.matmul(&weight.t()?)?;
    if config.use_bias {
        let bias = scope.param("bias", config.units, &WeightInit::zeros())?;
        y.broadcast_add(&bias)
    } else {
        Ok(y)
    }
}
