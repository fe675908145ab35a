//! KL divergences to a standard normal and reparameterised sampling.
//!
//! Inputs are `[batch, latent]`; the divergence is summed over the latent axis
//! and averaged over the batch.

use candle_core::{Tensor, D};

use crate::error::{expect_same_shape, Result};

/// Floor inside the log of [`kl_loss_var`].
pub const VARIANCE_EPSILON: f64 = 1e-8;
/// Default information constraint of [`vdb_loss`].
pub const VDB_INFORMATION_CONSTRAINT: f64 = 0.1;

/// Per-example `0.5·Σ(μ² + exp(logvar) − 1 − logvar)`.
fn kl_per_example(mean: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    expect_same_shape("kl_loss", mean, logvar)?;
    let terms = ((mean.sqr()? + logvar.exp()?)? - logvar)?.affine(1.0, -1.0)?;
    Ok((terms.sum(D::Minus1)? * 0.5)?)
}

/// KL divergence with log-variance parameterisation.
pub fn kl_loss(mean: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    Ok(kl_per_example(mean, logvar)?.mean_all()?)
}

/// KL divergence where `var` is used as the scale: `0.5·Σ(μ² + var² − log(1e-8 + var²) − 1)`.
pub fn kl_loss_var(mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    expect_same_shape("kl_loss_var", mean, var)?;
    let var_sq = var.sqr()?;
    let log_term = (&var_sq + VARIANCE_EPSILON)?.log()?;
    let terms = ((mean.sqr()? + var_sq)? - log_term)?.affine(1.0, -1.0)?;
    Ok((terms.sum(D::Minus1)? * 0.5)?.mean_all()?)
}

/// `mean + exp(0.5·logvar)·ε` with `ε ~ N(0, 1)`.
pub fn z_sample(mean: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    expect_same_shape("z_sample", mean, logvar)?;
    let eps = mean.randn_like(0.0, 1.0)?;
    Ok((mean + (logvar * 0.5)?.exp()?.mul(&eps)?)?)
}

/// `mean + var·ε` with `ε ~ N(0, 1)`.
pub fn z_sample_var(mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    expect_same_shape("z_sample_var", mean, var)?;
    let eps = mean.randn_like(0.0, 1.0)?;
    Ok((mean + var.mul(&eps)?)?)
}

/// Variational discriminator bottleneck: `mean_b(KL − i_c)`.
pub fn vdb_loss(mean: &Tensor, logvar: &Tensor, information_constraint: f64) -> Result<Tensor> {
    let kl = kl_per_example(mean, logvar)?;
    Ok((kl - information_constraint)?.mean_all()?)
}
