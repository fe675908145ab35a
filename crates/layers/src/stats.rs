//! Reduction utilities shared by the normalisation layers and the losses crate.

use candle_core::{DType, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

const FLOAT_DTYPES: [DType; 4] = [DType::F16, DType::BF16, DType::F32, DType::F64];

/// Mean and population variance over `axes`, keeping the reduced dimensions.
///
/// Statistics are reduced in the dtype chosen by [`PrecisionPolicy`] and cast
/// back to the input dtype.
pub fn moments(x: &Tensor, axes: &[usize]) -> Result<(Tensor, Tensor)> {
    checks::expect_dtype_in("moments.input", x, &FLOAT_DTYPES)?;
    let policy = PrecisionPolicy::from_parameter_dtype(x.dtype());
    if !policy.is_mixed_precision() {
        return mean_and_variance(x, axes);
    }
    let (mean, variance) = mean_and_variance(&policy.cast_for_reduction(x)?, axes)?;
    Ok((
        policy.cast_to_storage(&mean)?,
        policy.cast_to_storage(&variance)?,
    ))
}

fn mean_and_variance(x: &Tensor, axes: &[usize]) -> Result<(Tensor, Tensor)> {
    let mean = x.mean_keepdim(axes.to_vec())?;
    let variance = x.broadcast_sub(&mean)?.sqr()?.mean_keepdim(axes.to_vec())?;
    Ok((mean, variance))
}

/// Every axis except the trailing channel axis.
pub fn batch_axes(rank: usize) -> Vec<usize> {
    (0..rank.saturating_sub(1)).collect()
}

/// Spatial axes of a channels-last tensor (neither batch nor channels).
pub fn spatial_axes(rank: usize) -> Vec<usize> {
    (1..rank.saturating_sub(1)).collect()
}

/// Every axis except the batch axis.
pub fn layer_axes(rank: usize) -> Vec<usize> {
    (1..rank).collect()
}

/// `(x - mean) / sqrt(var + epsilon)` with broadcasting.
pub fn standardize(x: &Tensor, mean: &Tensor, variance: &Tensor, epsilon: f64) -> Result<Tensor> {
    let denom = (variance + epsilon)?.sqrt()?;
    x.broadcast_sub(mean)?.broadcast_div(&denom)
}

/// Divides `x` by its global L2 norm, floored at `sqrt(1e-12)`.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_all()?.maximum(1e-12)?.sqrt()?;
    x.broadcast_div(&norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn moments_use_population_variance() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6.], (1, 3, 2), &device)?;
        let (mean, var) = moments(&x, &[0, 1])?;
        assert_eq!(mean.dims(), &[1, 1, 2]);
        assert_eq!(mean.flatten_all()?.to_vec1::<f32>()?, vec![3.0, 4.0]);
        let var = var.flatten_all()?.to_vec1::<f32>()?;
        assert!((var[0] - 8.0 / 3.0).abs() < 1e-5);
        assert!((var[1] - 8.0 / 3.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn moments_keep_half_precision_storage() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((2, 4), DType::F16, &device)?;
        let (mean, var) = moments(&x, &[0])?;
        assert_eq!(mean.dtype(), DType::F16);
        assert_eq!(var.dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn half_precision_sums_beyond_f16_range_stay_finite() -> Result<()> {
        // 64 * 2000 exceeds the largest finite f16.
        let x = (Tensor::ones((64, 2), DType::F16, &Device::Cpu)? * 2000.0)?;
        let (mean, var) = moments(&x, &[0])?;
        let mean = mean.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let var = var.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(mean, vec![2000.0, 2000.0]);
        assert_eq!(var, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn axis_helpers_follow_channels_last() {
        assert_eq!(batch_axes(4), vec![0, 1, 2]);
        assert_eq!(spatial_axes(4), vec![1, 2]);
        assert_eq!(layer_axes(4), vec![1, 2, 3]);
        assert_eq!(spatial_axes(3), vec![1]);
    }

    #[test]
    fn l2_normalize_yields_unit_norm() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![3f32, 4.], (1, 2), &device)?;
        let y = l2_normalize(&x)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((y[0] - 0.6).abs() < 1e-6);
        assert!((y[1] - 0.8).abs() < 1e-6);
        Ok(())
    }
}
