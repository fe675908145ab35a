//! Pooling, resizing and layout helpers for channels-last images.
//!
//! Candle's pooling and resize kernels operate on `(batch, channels, height,
//! width)`, so these helpers permute around them and return channels-last
//! tensors.

use candle_core::{Error, Result, Tensor};

use crate::{checks, conv::same_padding};

pub(crate) fn to_nchw(x: &Tensor) -> Result<Tensor> {
    x.permute((0, 3, 1, 2))?.contiguous()
}

pub(crate) fn to_nhwc(x: &Tensor) -> Result<Tensor> {
    x.permute((0, 2, 3, 1))?.contiguous()
}

/// Nearest-neighbour upsampling by an integer factor.
pub fn up_sample(x: &Tensor, scale_factor: usize) -> Result<Tensor> {
    let (_, h, w, _) = checks::expect_nhwc("up_sample.input", x)?;
    let resized = to_nchw(x)?.upsample_nearest2d(h * scale_factor, w * scale_factor)?;
    to_nhwc(&resized)
}

/// Mean over the spatial axes, keeping them as size-one dimensions.
pub fn global_avg_pooling(x: &Tensor) -> Result<Tensor> {
    checks::expect_nhwc("global_avg_pooling.input", x)?;
    x.mean_keepdim((1, 2))
}

/// Max over the spatial axes, keeping them as size-one dimensions.
pub fn global_max_pooling(x: &Tensor) -> Result<Tensor> {
    let (b, h, w, c) = checks::expect_nhwc("global_max_pooling.input", x)?;
    x.reshape((b, h * w, c))?.max_keepdim(1)?.reshape((b, 1, 1, c))
}

/// Max pooling with window and stride `pool`, SAME padding.
///
/// Edge replication never changes a window maximum.
pub fn max_pooling(x: &Tensor, pool: usize) -> Result<Tensor> {
    let pads = same_pool_padding("max_pooling", x, pool)?;
    let padded = x
        .pad_with_same(1, pads.top, pads.bottom)?
        .pad_with_same(2, pads.left, pads.right)?;
    to_nhwc(&to_nchw(&padded)?.max_pool2d_with_stride(pool, pool)?)
}

/// Average pooling with window and stride `pool`, SAME padding.
///
/// Border windows average over the pixels that fall inside the input: the
/// zero-padded window mean is divided by the mean of a padded ones-mask.
pub fn avg_pooling(x: &Tensor, pool: usize) -> Result<Tensor> {
    let pads = same_pool_padding("avg_pooling", x, pool)?;
    let (_, h, w, _) = x.dims4()?;
    let zero_pad = |t: &Tensor| -> Result<Tensor> {
        t.pad_with_zeros(1, pads.top, pads.bottom)?
            .pad_with_zeros(2, pads.left, pads.right)
    };
    let sums = to_nchw(&zero_pad(x)?)?.avg_pool2d_with_stride(pool, pool)?;
    let mask = Tensor::ones((1, h, w, 1), x.dtype(), x.device())?;
    let coverage = to_nchw(&zero_pad(&mask)?)?.avg_pool2d_with_stride(pool, pool)?;
    to_nhwc(&sums.broadcast_div(&coverage)?)
}

struct PoolPadding {
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
}

fn same_pool_padding(label: &str, x: &Tensor, pool: usize) -> Result<PoolPadding> {
    if pool == 0 {
        return Err(Error::Msg(format!("{label}: pool size must be positive")));
    }
    let (_, h, w, _) = checks::expect_nhwc(label, x)?;
    let (top, bottom) = same_padding(h, pool, pool);
    let (left, right) = same_padding(w, pool, pool);
    Ok(PoolPadding { top, bottom, left, right })
}

/// Collapses every non-batch axis.
pub fn flatten(x: &Tensor) -> Result<Tensor> {
    checks::expect_min_rank("flatten.input", x, 2)?;
    x.flatten_from(1)
}

/// `[b, h, w, c]` to `[b, h * w, c]`.
pub fn hw_flatten(x: &Tensor) -> Result<Tensor> {
    let (b, h, w, c) = checks::expect_nhwc("hw_flatten.input", x)?;
    x.reshape((b, h * w, c))
}

/// Moves `block x block` spatial tiles into the channel axis (TensorFlow ordering).
pub fn space_to_depth(x: &Tensor, block: usize) -> Result<Tensor> {
    let (b, h, w, c) = checks::expect_nhwc("space_to_depth.input", x)?;
    checks::expect_divisible("space_to_depth.height", h, block)?;
    checks::expect_divisible("space_to_depth.width", w, block)?;
    x.reshape(vec![b, h / block, block, w / block, block, c])?
        .permute(vec![0, 1, 3, 2, 4, 5])?
        .reshape((b, h / block, w / block, block * block * c))
}

/// Inverse of [`space_to_depth`].
pub fn depth_to_space(x: &Tensor, block: usize) -> Result<Tensor> {
    let (b, h, w, c) = checks::expect_nhwc("depth_to_space.input", x)?;
    checks::expect_divisible("depth_to_space.channels", c, block * block)?;
    let out_c = c / (block * block);
    x.reshape(vec![b, h, w, block, block, out_c])?
        .permute(vec![0, 1, 3, 2, 4, 5])?
        .reshape((b, h * block, w * block, out_c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn ramp(shape: (usize, usize, usize, usize)) -> Result<Tensor> {
        let n = shape.0 * shape.1 * shape.2 * shape.3;
        Tensor::arange(0f32, n as f32, &Device::Cpu)?.reshape(shape)
    }

    #[test]
    fn up_sample_repeats_pixels() -> Result<()> {
        let x = ramp((1, 2, 2, 1))?;
        let y = up_sample(&x, 2)?;
        assert_eq!(y.dims(), &[1, 4, 4, 1]);
        let row0 = y.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(row0, vec![0.0, 0.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn global_pools_keep_spatial_axes() -> Result<()> {
        let x = ramp((2, 3, 3, 4))?;
        assert_eq!(global_avg_pooling(&x)?.dims(), &[2, 1, 1, 4]);
        let max = global_max_pooling(&x)?;
        assert_eq!(max.dims(), &[2, 1, 1, 4]);
        let first = max.narrow(0, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(first, vec![32.0, 33.0, 34.0, 35.0]);
        Ok(())
    }

    #[test]
    fn same_pooling_rounds_up_odd_sizes() -> Result<()> {
        let x = ramp((1, 5, 5, 2))?;
        assert_eq!(max_pooling(&x, 2)?.dims(), &[1, 3, 3, 2]);

        let x = ramp((1, 3, 3, 1))?;
        let avg = avg_pooling(&x, 2)?.flatten_all()?.to_vec1::<f32>()?;
        // Windows: {0,1,3,4}, {2,5}, {6,7}, {8}
        assert_eq!(avg, vec![2.0, 3.5, 6.5, 8.0]);
        Ok(())
    }

    #[test]
    fn same_avg_pooling_ignores_padding_wider_than_one_cell() -> Result<()> {
        // One row, four columns, pool 3: one padded cell on each side.
        let x = ramp((1, 1, 4, 1))?;
        let avg = avg_pooling(&x, 3)?;
        assert_eq!(avg.dims(), &[1, 1, 2, 1]);
        let values = avg.flatten_all()?.to_vec1::<f32>()?;
        assert!((values[0] - 0.5).abs() < 1e-6, "{values:?}");
        assert!((values[1] - 2.5).abs() < 1e-6, "{values:?}");
        assert_eq!(max_pooling(&x, 3)?.flatten_all()?.to_vec1::<f32>()?, vec![1.0, 3.0]);
        Ok(())
    }

    #[test]
    fn same_pooling_with_uneven_padding() -> Result<()> {
        // 5x5, pool 4: one leading and two trailing padded cells per axis.
        // Row groups {0,1,2} and {3,4}, likewise for columns.
        let x = ramp((1, 5, 5, 1))?;
        let avg = avg_pooling(&x, 4)?;
        assert_eq!(avg.dims(), &[1, 2, 2, 1]);
        let values = avg.flatten_all()?.to_vec1::<f32>()?;
        for (got, want) in values.iter().zip([6.0f32, 8.5, 18.5, 21.0]) {
            assert!((got - want).abs() < 1e-5, "{values:?}");
        }
        let max = max_pooling(&x, 4)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(max, vec![12.0, 14.0, 22.0, 24.0]);

        let x = ramp((2, 7, 5, 3))?;
        assert_eq!(avg_pooling(&x, 3)?.dims(), &[2, 3, 2, 3]);
        assert_eq!(max_pooling(&x, 3)?.dims(), &[2, 3, 2, 3]);
        assert_eq!(avg_pooling(&x, 4)?.dims(), &[2, 2, 2, 3]);
        assert_eq!(max_pooling(&x, 4)?.dims(), &[2, 2, 2, 3]);
        Ok(())
    }

    #[test]
    fn depth_to_space_inverts_space_to_depth() -> Result<()> {
        let x = ramp((2, 4, 6, 3))?;
        let packed = space_to_depth(&x, 2)?;
        assert_eq!(packed.dims(), &[2, 2, 3, 12]);
        let unpacked = depth_to_space(&packed, 2)?;
        let diff = (unpacked - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn depth_to_space_uses_tensorflow_ordering() -> Result<()> {
        let x = ramp((1, 1, 1, 4))?;
        let y = depth_to_space(&x, 2)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(y, vec![0.0, 1.0, 2.0, 3.0]);
        assert!(depth_to_space(&Tensor::zeros((1, 1, 1, 3), DType::F32, &Device::Cpu)?, 2).is_err());
        Ok(())
    }

    #[test]
    fn flatten_helpers() -> Result<()> {
        let x = ramp((2, 3, 4, 5))?;
        assert_eq!(flatten(&x)?.dims(), &[2, 60]);
        assert_eq!(hw_flatten(&x)?.dims(), &[2, 12, 5]);
        Ok(())
    }
}
