//! Spectral normalisation of weight tensors.
//!
//! The weight is viewed as a matrix `[rows, rest]` where `rows` is its leading
//! dimension (output channels for convolution and dense kernels, input channels
//! for transposed convolution kernels). A persistent left vector `u` of shape
//! `[1, rows]` is refined by power iteration on every call, and the weight is
//! divided by the resulting estimate of its largest singular value.

use candle_core::{Error, Result, Tensor};

use crate::{init::WeightInit, params::Scope, stats::l2_normalize};

/// Returns `weight / sigma(weight)` and advances the stored `u` vector.
///
/// Both power-iteration vectors are treated as constants for differentiation,
/// so gradients flow through `sigma` only via the weight itself. The read of
/// `u`, the iterations and the write-back happen under the buffer's lock.
pub fn spectral_norm(scope: &Scope, weight: &Tensor, iterations: usize) -> Result<Tensor> {
    let dims = weight.dims().to_vec();
    let rows = *dims.first().ok_or_else(|| {
        Error::Msg("spectral_norm: weight must have at least one dimension".into())
    })?;
    let matrix = weight.reshape((rows, ()))?;
    let frozen = matrix.detach();

    scope.update_buffer("u", (1, rows), &WeightInit::standard_normal(), |u| {
        let mut v_hat = l2_normalize(&u.matmul(&frozen)?)?;
        let mut u_hat = l2_normalize(&v_hat.matmul(&frozen.t()?)?)?;
        for _ in 1..iterations {
            v_hat = l2_normalize(&u_hat.matmul(&frozen)?)?;
            u_hat = l2_normalize(&v_hat.matmul(&frozen.t()?)?)?;
        }

        let sigma = u_hat.matmul(&matrix)?.matmul(&v_hat.t()?)?;
        let normalized = matrix.broadcast_div(&sigma)?.reshape(dims)?;
        Ok((u_hat, normalized))
    })
}
