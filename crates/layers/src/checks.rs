//! Lightweight validation helpers shared across layer components.
//!
//! Every primitive in this crate consumes channels-last tensors
//! (`[batch, height, width, channels]` for images). These routines return
//! `candle_core::Result` so call sites can propagate layout errors without
//! panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures two tensors share the same shape.
pub fn expect_same_shape(label: &str, lhs: &Tensor, rhs: &Tensor) -> Result<()> {
    if lhs.dims() == rhs.dims() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: shapes {:?} and {:?} differ",
            lhs.dims(),
            rhs.dims()
        )))
    }
}

/// Validates the `(batch, height, width, channels)` layout and returns its dims.
pub fn expect_nhwc(label: &str, tensor: &Tensor) -> Result<(usize, usize, usize, usize)> {
    match tensor.dims() {
        &[batch, height, width, channels] => Ok((batch, height, width, channels)),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, height, width, channels) layout, got {:?}",
            dims
        ))),
    }
}

/// Returns the channel count of a channels-last tensor with a batch axis.
pub fn channels(label: &str, tensor: &Tensor) -> Result<usize> {
    match tensor.dims() {
        [_, .., channels] => Ok(*channels),
        dims => Err(Error::Msg(format!(
            "{label}: expected a batch axis and a trailing channel axis, got {:?}",
            dims
        ))),
    }
}

/// Rejects tensors whose rank is below `min_rank`.
pub fn expect_min_rank(label: &str, tensor: &Tensor, min_rank: usize) -> Result<()> {
    if tensor.rank() >= min_rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank >= {min_rank}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Checks that `value` is a positive multiple of `divisor`.
pub fn expect_divisible(label: &str, value: usize, divisor: usize) -> Result<()> {
    if divisor != 0 && value != 0 && value % divisor == 0 {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: {value} is not a positive multiple of {divisor}"
        )))
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().copied().any(|allowed| allowed == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}
