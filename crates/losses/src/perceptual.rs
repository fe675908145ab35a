//! Statistics-matching losses: colour histograms, Gram matrices and spatial
//! colour moments.

use candle_core::{DType, Tensor};
use layers::stats::{batch_axes, moments};

use crate::{
    error::{expect_same_shape, LossError, Result},
    reconstruction::{l1_loss, l2_loss},
};

/// Width of a histogram bin.
pub const HISTOGRAM_BIN_WIDTH: f64 = 0.2;
/// Bins cover `(-1, 1]`.
pub const HISTOGRAM_BINS: usize = 10;

const HISTOGRAM_EPSILON: f64 = 1e-8;
const VARIANCE_WEIGHT: f64 = 5.0;

/// Per-channel intensity histogram of a channels-last batch.
///
/// Bin `i` counts values in `(e, e + 0.2]` with `e = -1 + 0.2·i`, over every
/// sample and position. The `channels * 10` counts (channel-major) are
/// min-max normalised together. The result carries no gradient.
pub fn histogram(x: &Tensor) -> Result<Tensor> {
    if x.rank() < 2 {
        return Err(LossError::shape(
            "histogram",
            format!("expected a channels-last tensor, got {:?}", x.dims()),
        ));
    }
    let x = x.detach();
    let axes = batch_axes(x.rank());
    let mut bins = Vec::with_capacity(HISTOGRAM_BINS);
    for i in 0..HISTOGRAM_BINS {
        let lower = -1.0 + HISTOGRAM_BIN_WIDTH * i as f64;
        let upper = lower + HISTOGRAM_BIN_WIDTH;
        let inside = x.gt(lower)?.mul(&x.le(upper)?)?.to_dtype(DType::F32)?;
        bins.push(inside.sum(axes.clone())?);
    }
    // [channels, bins] flattened channel-major.
    let counts = Tensor::stack(&bins, 1)?.flatten_all()?;

    let min = counts.min_all()?;
    let range = (counts.max_all()? - &min)?;
    Ok(counts
        .broadcast_sub(&min)?
        .broadcast_div(&(range + HISTOGRAM_EPSILON)?)?)
}

/// L1 distance between the normalised histograms of `x` and `y`.
pub fn histogram_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let hx = histogram(x)?;
    let hy = histogram(y)?;
    expect_same_shape("histogram_loss", &hx, &hy)?;
    l1_loss(&hx, &hy)
}

/// `[b, c, c]` channel correlations normalised by `h·w·c`.
pub fn gram_matrix(x: &Tensor) -> Result<Tensor> {
    let (b, h, w, c) = x.dims4().map_err(|_| {
        LossError::shape("gram_matrix", format!("expected [b, h, w, c], got {:?}", x.dims()))
    })?;
    let flat = x.reshape((b, h * w, c))?;
    let gram = flat.t()?.contiguous()?.matmul(&flat)?;
    Ok((gram / (h * w * c) as f64)?)
}

/// Mean squared difference of Gram matrices.
pub fn gram_style_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    expect_same_shape("gram_style_loss", x, y)?;
    l2_loss(&gram_matrix(x)?, &gram_matrix(y)?)
}

/// `L2(mean) + 5·L2(variance)` of the per-sample, per-channel spatial moments.
pub fn color_consistency_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    expect_same_shape("color_consistency_loss", x, y)?;
    if x.rank() != 4 {
        return Err(LossError::shape(
            "color_consistency_loss",
            format!("expected [b, h, w, c], got {:?}", x.dims()),
        ));
    }
    let (x_mean, x_var) = moments(x, &[1, 2])?;
    let (y_mean, y_var) = moments(y, &[1, 2])?;
    let loss = (l2_loss(&x_mean, &y_mean)? + (l2_loss(&x_var, &y_var)? * VARIANCE_WEIGHT)?)?;
    Ok(loss)
}
