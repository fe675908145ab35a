//! Pixel-wise distances and the softmax classification loss.
//!
//! Every function returns a rank-0 tensor averaged over all elements.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::error::{expect_same_shape, LossError, Result};

/// Threshold between the quadratic and linear regions of [`huber_loss`].
pub const HUBER_DELTA: f64 = 1.0;

/// Mean absolute error.
pub fn l1_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    expect_same_shape("l1_loss", x, y)?;
    Ok((x - y)?.abs()?.mean_all()?)
}

/// Mean squared error.
pub fn l2_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    expect_same_shape("l2_loss", x, y)?;
    Ok((x - y)?.sqr()?.mean_all()?)
}

/// Mean Huber loss: `0.5·d²` for `|d| <= 1`, `|d| - 0.5` beyond.
pub fn huber_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    expect_same_shape("huber_loss", x, y)?;
    let abs = (x - y)?.abs()?;
    let quadratic = abs.clamp(0.0, HUBER_DELTA)?;
    let linear = (&abs - &quadratic)?;
    let loss = ((quadratic.sqr()? * 0.5)? + (linear * HUBER_DELTA)?)?;
    Ok(loss.mean_all()?)
}

/// Result of [`classification_loss`].
#[derive(Debug, Clone)]
pub struct ClassificationOutput {
    /// Mean softmax cross-entropy.
    pub loss: Tensor,
    /// Fraction of rows whose logit argmax matches the label argmax.
    pub accuracy: Tensor,
}

/// Softmax cross-entropy against one-hot (or soft) labels of the same shape,
/// classes on the last axis.
pub fn classification_loss(logits: &Tensor, labels: &Tensor) -> Result<ClassificationOutput> {
    expect_same_shape("classification_loss", logits, labels)?;
    if logits.rank() < 2 {
        return Err(LossError::shape(
            "classification_loss",
            format!("expected [batch, classes], got {:?}", logits.dims()),
        ));
    }
    let labels = labels.to_dtype(logits.dtype())?;
    let per_row = (log_softmax(logits, D::Minus1)? * &labels)?.sum(D::Minus1)?.neg()?;
    let loss = per_row.mean_all()?;

    let hits = logits
        .argmax(D::Minus1)?
        .eq(&labels.argmax(D::Minus1)?)?
        .to_dtype(DType::F32)?;
    Ok(ClassificationOutput {
        loss,
        accuracy: hits.mean_all()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> Result<f32> {
        Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    fn pair() -> Result<(Tensor, Tensor)> {
        let x = Tensor::new(&[0.0f32, 1.0, -2.0, 0.5], &Device::Cpu)?;
        let y = Tensor::new(&[0.5f32, 1.0, 1.0, 0.0], &Device::Cpu)?;
        Ok((x, y))
    }

    #[test]
    fn distances_match_hand_computed_values() -> Result<()> {
        let (x, y) = pair()?;
        assert!((scalar(&l1_loss(&x, &y)?)? - 1.0).abs() < 1e-6);
        assert!((scalar(&l2_loss(&x, &y)?)? - 2.375).abs() < 1e-6);
        // 0.125 + 0 + 2.5 + 0.125
        assert!((scalar(&huber_loss(&x, &y)?)? - 0.6875).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_are_rejected() -> Result<()> {
        let (x, _) = pair()?;
        let y = Tensor::zeros(3, DType::F32, &Device::Cpu)?;
        assert!(matches!(
            l1_loss(&x, &y),
            Err(LossError::InvalidShape { label: "l1_loss", .. })
        ));
        Ok(())
    }

    #[test]
    fn classification_reports_accuracy() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[4.0f32, 0.0, 0.0], [0.0, 0.0, 4.0]], &device)?;
        let labels = Tensor::new(&[[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]], &device)?;
        let out = classification_loss(&logits, &labels)?;
        assert!((scalar(&out.accuracy)? - 0.5).abs() < 1e-6);

        let denom = 4f32.exp() + 2.0;
        let expected = ((denom.ln() - 4.0) + denom.ln()) / 2.0;
        assert!((scalar(&out.loss)? - expected).abs() < 1e-5);
        Ok(())
    }
}
