//! Non-local self-attention over spatial positions.
//!
//! Both variants build query (`g_conv`), key (`f_conv`) and value (`h_conv`)
//! projections with 1x1 convolutions, attend over all `h * w` positions and
//! blend the result back through a learned scalar `gamma` that starts at zero,
//! so a freshly initialised block is the identity.

use candle_core::{Error, Result, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::{
    checks,
    conv::conv,
    init::WeightInit,
    params::Scope,
    pooling::{hw_flatten, max_pooling},
    residual::BlockConfig,
};

/// Key and query width is `channels / QK_REDUCTION`.
pub const QK_REDUCTION: usize = 8;

fn check_input(label: &str, x: &Tensor, config: &BlockConfig) -> Result<(usize, usize, usize, usize)> {
    let dims = checks::expect_nhwc(label, x)?;
    if dims.3 != config.channels {
        return Err(Error::Msg(format!(
            "{label}: input has {} channels, block expects {}",
            dims.3, config.channels
        )));
    }
    if config.channels < QK_REDUCTION {
        return Err(Error::Msg(format!(
            "{label}: at least {QK_REDUCTION} channels required, got {}",
            config.channels
        )));
    }
    Ok(dims)
}

/// `softmax(query · keyᵀ) · value` over flattened positions.
fn attend(query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
    let query = hw_flatten(query)?;
    let key_t = hw_flatten(key)?.t()?.contiguous()?;
    let scores = query.matmul(&key_t)?;
    softmax_last_dim(&scores)?.matmul(&hw_flatten(value)?)
}

fn gate(scope: &Scope, o: &Tensor, x: &Tensor) -> Result<Tensor> {
    let gamma = scope.param("gamma", 1, &WeightInit::zeros())?;
    o.broadcast_mul(&gamma)? + x
}

/// SAGAN self-attention; memory grows with `(h * w)²`.
pub fn self_attention(scope: &Scope, x: &Tensor, config: &BlockConfig) -> Result<Tensor> {
    let (b, h, w, c) = check_input("self_attention.input", x, config)?;
    let f = conv(&scope.pp("f_conv"), x, &config.pointwise(c / QK_REDUCTION))?;
    let g = conv(&scope.pp("g_conv"), x, &config.pointwise(c / QK_REDUCTION))?;
    let v = conv(&scope.pp("h_conv"), x, &config.pointwise(c))?;

    let o = attend(&g, &f, &v)?.reshape((b, h, w, c))?;
    gate(scope, &o, x)
}

/// Self-attention with keys and values max-pooled by two, cutting the score
/// matrix to `(h * w) x (h * w / 4)`. Values are `c / 2` wide and projected
/// back to `c` by `attn_conv`.
pub fn self_attention_with_pooling(scope: &Scope, x: &Tensor, config: &BlockConfig) -> Result<Tensor> {
    let (b, h, w, c) = check_input("self_attention_with_pooling.input", x, config)?;
    let f = conv(&scope.pp("f_conv"), x, &config.pointwise(c / QK_REDUCTION))?;
    let f = max_pooling(&f, 2)?;
    let g = conv(&scope.pp("g_conv"), x, &config.pointwise(c / QK_REDUCTION))?;
    let v = conv(&scope.pp("h_conv"), x, &config.pointwise(c / 2))?;
    let v = max_pooling(&v, 2)?;

    let o = attend(&g, &f, &v)?.reshape((b, h, w, c / 2))?;
    let o = conv(&scope.pp("attn_conv"), &o, &config.pointwise(c))?;
    gate(scope, &o, x)
}
