//! Adversarial objectives and gradient penalties.
//!
//! [`GanLoss`] is a closed set: unknown names fail at parse time instead of
//! silently contributing nothing. Each formulation can run in relativistic
//! average (Ra) mode, where a score is compared against the batch mean of the
//! opposite class. Ra has no Wasserstein counterpart; requesting both logs a
//! warning and evaluates the plain Wasserstein loss.

use std::{fmt, str::FromStr};

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{LossError, Result};

/// Supported adversarial formulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GanLoss {
    /// Least squares.
    Lsgan,
    /// Sigmoid cross-entropy.
    Gan,
    /// Sigmoid cross-entropy; the penalty term is applied by the caller.
    GanGp,
    Dragan,
    Hinge,
    Wgan,
    WganGp,
    WganLp,
}

impl GanLoss {
    pub const ALL: [GanLoss; 8] = [
        GanLoss::Lsgan,
        GanLoss::Gan,
        GanLoss::GanGp,
        GanLoss::Dragan,
        GanLoss::Hinge,
        GanLoss::Wgan,
        GanLoss::WganGp,
        GanLoss::WganLp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GanLoss::Lsgan => "lsgan",
            GanLoss::Gan => "gan",
            GanLoss::GanGp => "gan-gp",
            GanLoss::Dragan => "dragan",
            GanLoss::Hinge => "hinge",
            GanLoss::Wgan => "wgan",
            GanLoss::WganGp => "wgan-gp",
            GanLoss::WganLp => "wgan-lp",
        }
    }

    pub fn is_wasserstein(self) -> bool {
        matches!(self, GanLoss::Wgan | GanLoss::WganGp | GanLoss::WganLp)
    }

    fn is_cross_entropy(self) -> bool {
        matches!(self, GanLoss::Gan | GanLoss::GanGp | GanLoss::Dragan)
    }

    /// Whether Ra mode actually applies to this formulation.
    fn effective_relativistic(self, requested: bool) -> bool {
        if requested && self.is_wasserstein() {
            log::warn!(
                "relativistic {} is not defined; using the non-relativistic loss",
                self.as_str()
            );
            return false;
        }
        requested
    }
}

impl fmt::Display for GanLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GanLoss {
    type Err = LossError;

    fn from_str(s: &str) -> Result<Self> {
        GanLoss::ALL
            .into_iter()
            .find(|loss| loss.as_str() == s)
            .ok_or_else(|| LossError::UnknownLossFunction(s.to_string()))
    }
}

/// Mean sigmoid cross-entropy against a constant target, in the overflow-safe
/// form `max(x, 0) − x·z + log(1 + exp(−|x|))`.
fn sigmoid_cross_entropy(logits: &Tensor, target: f64) -> Result<Tensor> {
    let softplus_tail = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let loss = ((logits.relu()? - (logits * target)?)? + softplus_tail)?;
    Ok(loss.mean_all()?)
}

fn squared_distance(logits: &Tensor, target: f64) -> Result<Tensor> {
    Ok((logits - target)?.sqr()?.mean_all()?)
}

/// `mean(relu(margin + sign·x))`.
fn hinge(logits: &Tensor, sign: f64) -> Result<Tensor> {
    Ok(logits.affine(sign, 1.0)?.relu()?.mean_all()?)
}

/// `(real − mean(fake), fake − mean(real))`.
fn relativistic_logits(real: &Tensor, fake: &Tensor) -> Result<(Tensor, Tensor)> {
    let real_logit = real.broadcast_sub(&fake.mean_all()?)?;
    let fake_logit = fake.broadcast_sub(&real.mean_all()?)?;
    Ok((real_logit, fake_logit))
}

/// Pushes `positive` toward "real" and `negative` toward "fake".
fn two_sided(loss: GanLoss, positive: &Tensor, negative: &Tensor) -> Result<Tensor> {
    let total = if loss.is_cross_entropy() {
        (sigmoid_cross_entropy(positive, 1.0)? + sigmoid_cross_entropy(negative, 0.0)?)?
    } else {
        match loss {
            GanLoss::Lsgan => (squared_distance(positive, 1.0)? + squared_distance(negative, -1.0)?)?,
            GanLoss::Hinge => (hinge(positive, -1.0)? + hinge(negative, 1.0)?)?,
            _ => (negative.mean_all()? - positive.mean_all()?)?,
        }
    };
    Ok(total)
}

/// Discriminator objective for critic scores on real and generated samples.
pub fn discriminator_loss(loss: GanLoss, relativistic: bool, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
    if loss.effective_relativistic(relativistic) {
        let (real_logit, fake_logit) = relativistic_logits(real, fake)?;
        return two_sided(loss, &real_logit, &fake_logit);
    }
    let total = match loss {
        GanLoss::Lsgan => (squared_distance(real, 1.0)? + squared_distance(fake, 0.0)?)?,
        _ => two_sided(loss, real, fake)?,
    };
    Ok(total)
}

/// Generator objective. In Ra mode the real scores also contribute, with the
/// roles of real and fake swapped.
pub fn generator_loss(loss: GanLoss, relativistic: bool, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
    if loss.effective_relativistic(relativistic) {
        let (real_logit, fake_logit) = relativistic_logits(real, fake)?;
        return two_sided(loss, &fake_logit, &real_logit);
    }
    if loss.is_cross_entropy() {
        return sigmoid_cross_entropy(fake, 1.0);
    }
    let total = match loss {
        GanLoss::Lsgan => squared_distance(fake, 1.0)?,
        _ => fake.mean_all()?.neg()?,
    };
    Ok(total)
}

/// `0.5·γ·mean_b(Σ ‖∂ Σ logits / ∂ images‖²)` for one side.
fn gradient_penalty(logits: &Tensor, images: &Var, gamma: f64, name: &'static str) -> Result<Tensor> {
    let grads = logits.sum_all()?.backward()?;
    let grad = grads.get(images.as_tensor()).ok_or(LossError::MissingGradient(name))?;
    let per_sample = grad.sqr()?.flatten_from(1)?.sum(1)?;
    Ok((per_sample.mean_all()? * (0.5 * gamma))?)
}

/// R1 (real) and R2 (fake) gradient penalties.
///
/// Each term is evaluated only when its coefficient is non-zero. The image
/// tensors must be the [`Var`]s the logits were computed from.
///
/// # Limitation
///
/// The returned value is exact, but Candle detaches the gradient of every
/// intermediate activation while computing first-order gradients. Unless
/// `CANDLE_GRAD_DO_NOT_DETACH=1` is set before the first backward pass, the
/// penalty is not a faithful training signal: backpropagating it does not
/// give its true gradient with respect to the critic parameters, and for
/// most critics it acts as a near-constant term in the discriminator loss.
pub fn simple_gradient_penalty(
    real_logit: &Tensor,
    fake_logit: &Tensor,
    real_images: &Var,
    fake_images: &Var,
    r1_gamma: f64,
    r2_gamma: f64,
) -> Result<Tensor> {
    let mut penalty = Tensor::zeros((), real_logit.dtype(), real_logit.device())?;
    if r1_gamma != 0.0 {
        penalty = (penalty + gradient_penalty(real_logit, real_images, r1_gamma, "real_images")?)?;
    }
    if r2_gamma != 0.0 {
        penalty = (penalty + gradient_penalty(fake_logit, fake_images, r2_gamma, "fake_images")?)?;
    }
    Ok(penalty)
}

fn default_r1_gamma() -> f64 {
    10.0
}

/// Declarative selection of the adversarial objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdversarialConfig {
    pub loss: GanLoss,
    #[serde(default)]
    pub relativistic: bool,
    #[serde(default = "default_r1_gamma")]
    pub r1_gamma: f64,
    #[serde(default)]
    pub r2_gamma: f64,
}

impl AdversarialConfig {
    pub fn new(loss: GanLoss) -> Self {
        Self {
            loss,
            relativistic: false,
            r1_gamma: default_r1_gamma(),
            r2_gamma: 0.0,
        }
    }

    pub fn with_relativistic(mut self, relativistic: bool) -> Self {
        self.relativistic = relativistic;
        self
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn discriminator_loss(&self, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
        discriminator_loss(self.loss, self.relativistic, real, fake)
    }

    pub fn generator_loss(&self, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
        generator_loss(self.loss, self.relativistic, real, fake)
    }

    /// [`simple_gradient_penalty`] with the configured γ values. Its gradient
    /// with respect to the critic is only correct when
    /// `CANDLE_GRAD_DO_NOT_DETACH=1` is set.
    pub fn gradient_penalty(
        &self,
        real_logit: &Tensor,
        fake_logit: &Tensor,
        real_images: &Var,
        fake_images: &Var,
    ) -> Result<Tensor> {
        simple_gradient_penalty(
            real_logit,
            fake_logit,
            real_images,
            fake_images,
            self.r1_gamma,
            self.r2_gamma,
        )
    }
}
