//! Activation catalogue for generator and discriminator stacks.
//!
//! All activations are elementwise and preserve the input layout. The leaky
//! ReLU default slope is `0.01`; discriminators usually pass `0.2` explicitly.
//!
//! # Built-in formulas
//!
//! * **Swish** computes `x * sigmoid(x)` via Candle's fused SiLU kernel.
//! * **ELU** returns `x` for positive inputs and `alpha * (exp(x) - 1)` otherwise.

use candle_core::{Result, Tensor};
use candle_nn::ops;
use serde::{Deserialize, Serialize};

/// Default negative slope for [`lrelu`].
pub const LEAKY_RELU_SLOPE: f64 = 0.01;

/// Identifies a non-linearity so blocks can be configured declaratively.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    /// Identity function, useful for output heads.
    Identity,
    Relu,
    LeakyRelu { alpha: f64 },
    Tanh,
    Sigmoid,
    Swish,
    Elu { alpha: f64 },
}

impl Activation {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match *self {
            Activation::Identity => Ok(x.clone()),
            Activation::Relu => relu(x),
            Activation::LeakyRelu { alpha } => lrelu(x, alpha),
            Activation::Tanh => tanh(x),
            Activation::Sigmoid => sigmoid(x),
            Activation::Swish => swish(x),
            Activation::Elu { alpha } => x.elu(alpha),
        }
    }
}

pub fn relu(x: &Tensor) -> Result<Tensor> {
    x.relu()
}

pub fn lrelu(x: &Tensor, alpha: f64) -> Result<Tensor> {
    ops::leaky_relu(x, alpha)
}

pub fn tanh(x: &Tensor) -> Result<Tensor> {
    x.tanh()
}

pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    ops::sigmoid(x)
}

pub fn swish(x: &Tensor) -> Result<Tensor> {
    x.silu()
}

pub fn elu(x: &Tensor) -> Result<Tensor> {
    x.elu(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn input() -> Result<Tensor> {
        Tensor::from_vec(vec![-2.0f32, -0.5, 0.0, 1.5], (1, 4), &Device::Cpu)
    }

    fn values(t: &Tensor) -> Result<Vec<f32>> {
        t.flatten_all()?.to_vec1::<f32>()
    }

    #[test]
    fn leaky_relu_scales_negative_inputs() -> Result<()> {
        let out = values(&lrelu(&input()?, LEAKY_RELU_SLOPE)?)?;
        for (got, expected) in out.iter().zip([-0.02f32, -0.005, 0.0, 1.5]) {
            assert!((got - expected).abs() < 1e-6, "{got} vs {expected}");
        }
        Ok(())
    }

    #[test]
    fn swish_matches_reference() -> Result<()> {
        let x = input()?;
        let out = values(&swish(&x)?)?;
        for (got, v) in out.iter().zip(values(&x)?) {
            let expected = v / (1.0 + (-v).exp());
            assert!((got - expected).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn elu_saturates_at_minus_alpha() -> Result<()> {
        let x = Tensor::from_vec(vec![-30.0f32, 2.0], 2, &Device::Cpu)?;
        let out = values(&Activation::Elu { alpha: 1.0 }.forward(&x)?)?;
        assert!((out[0] + 1.0).abs() < 1e-5);
        assert_eq!(out[1], 2.0);
        Ok(())
    }

    #[test]
    fn enum_dispatch_matches_free_functions() -> Result<()> {
        let x = input()?;
        assert_eq!(values(&Activation::Relu.forward(&x)?)?, values(&relu(&x)?)?);
        assert_eq!(values(&Activation::Tanh.forward(&x)?)?, values(&tanh(&x)?)?);
        assert_eq!(values(&Activation::Sigmoid.forward(&x)?)?, values(&sigmoid(&x)?)?);
        assert_eq!(values(&Activation::Identity.forward(&x)?)?, values(&x)?);
        Ok(())
    }
}
