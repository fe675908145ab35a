//! Overlap losses for multi-class segmentation.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax;
use layers::stats::batch_axes;

use crate::error::{LossError, Result};

/// Added to numerator and denominator of every per-class index.
pub const DICE_SMOOTH: f64 = 1e-7;

/// Generalised Tversky loss, `n − Σ_c (num_c + s) / (den_c + s)`.
///
/// `logits` is `[..., n_classes]`; `labels` holds integer class ids with the
/// same leading shape and a trailing axis of one. Ids outside `[0, n_classes)`
/// produce an all-zero one-hot row. With `alpha = beta = 0.5` this is the
/// Dice loss, with `alpha = beta = 1` the Jaccard loss.
pub fn tversky_loss(
    n_classes: usize,
    logits: &Tensor,
    labels: &Tensor,
    alpha: f64,
    beta: f64,
) -> Result<Tensor> {
    let dims = logits.dims();
    if dims.last() != Some(&n_classes) || logits.rank() < 2 {
        return Err(LossError::shape(
            "tversky_loss",
            format!("logits {dims:?} must end with {n_classes} classes"),
        ));
    }
    let expected_labels: Vec<usize> = dims[..dims.len() - 1].iter().copied().chain([1]).collect();
    if labels.dims() != expected_labels.as_slice() {
        return Err(LossError::shape(
            "tversky_loss",
            format!("labels {:?} must be {expected_labels:?}", labels.dims()),
        ));
    }

    let dtype = logits.dtype();
    let classes = Tensor::arange(0i64, n_classes as i64, logits.device())?;
    let g0 = labels
        .to_dtype(DType::I64)?
        .broadcast_eq(&classes)?
        .to_dtype(dtype)?;
    let g1 = g0.affine(-1.0, 1.0)?;
    let p0 = softmax(logits, D::Minus1)?;
    let p1 = p0.affine(-1.0, 1.0)?;

    let axes = batch_axes(logits.rank());
    let num = (&p0 * &g0)?.sum(axes.clone())?;
    let false_positive = (&p0 * &g1)?.sum(axes.clone())?;
    let false_negative = (&p1 * &g0)?.sum(axes)?;
    let den = ((&num + (false_positive * alpha)?)? + (false_negative * beta)?)?;

    let index = ((num + DICE_SMOOTH)? / (den + DICE_SMOOTH)?)?.sum_all()?;
    Ok(index.affine(-1.0, n_classes as f64)?)
}

/// Multi-class Dice loss; see [`tversky_loss`].
pub fn dice_loss(n_classes: usize, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    tversky_loss(n_classes, logits, labels, 0.5, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn confident_logits(ids: &[u32], n: usize) -> Result<Tensor> {
        let mut values = vec![-30f32; ids.len() * n];
        for (i, &id) in ids.iter().enumerate() {
            values[i * n + id as usize] = 30.0;
        }
        Ok(Tensor::from_vec(values, (1, 2, 2, n), &Device::Cpu)?)
    }

    #[test]
    fn perfect_prediction_has_zero_loss() -> Result<()> {
        let ids = [0u32, 1, 2, 1];
        let logits = confident_logits(&ids, 3)?;
        let labels = Tensor::from_vec(ids.to_vec(), (1, 2, 2, 1), &Device::Cpu)?;
        let loss = dice_loss(3, &logits, &labels)?.to_scalar::<f32>()?;
        assert!(loss.abs() < 1e-4, "loss {loss}");
        Ok(())
    }

    #[test]
    fn wrong_prediction_is_penalised() -> Result<()> {
        let logits = confident_logits(&[1, 0, 1, 0], 2)?;
        let labels = Tensor::from_vec(vec![0u32, 1, 0, 1], (1, 2, 2, 1), &Device::Cpu)?;
        let loss = dice_loss(2, &logits, &labels)?.to_scalar::<f32>()?;
        assert!((loss - 2.0).abs() < 1e-4, "loss {loss}");
        Ok(())
    }

    #[test]
    fn out_of_range_labels_are_empty_rows() -> Result<()> {
        let logits = confident_logits(&[0, 0, 0, 0], 2)?;
        let labels = Tensor::from_vec(vec![0i64, 0, 0, 7], (1, 2, 2, 1), &Device::Cpu)?;
        let loss = dice_loss(2, &logits, &labels)?.to_scalar::<f32>()?;
        // Class 0: 3 hits, 1 false positive; class 1 is absent from both.
        let expected = 2.0 - (3.0 / 3.5 + 1.0);
        assert!((loss - expected).abs() < 1e-4, "loss {loss}");
        Ok(())
    }

    #[test]
    fn label_shape_is_checked() -> Result<()> {
        let logits = confident_logits(&[0, 0, 0, 0], 2)?;
        let labels = Tensor::zeros((1, 2, 2), DType::U32, &Device::Cpu)?;
        assert!(dice_loss(2, &logits, &labels).is_err());
        assert!(dice_loss(3, &logits, &labels).is_err());
        Ok(())
    }
}
