//! Loss functions for GAN training.
//!
//! All losses are stateless reductions returning rank-0 tensors, so they can
//! be summed and handed straight to `backward()`. Adversarial objectives are
//! selected through the closed [`GanLoss`] enum; parsing an unknown name is an
//! error rather than a silent zero contribution.

pub mod adversarial;
pub mod dice;
pub mod error;
pub mod perceptual;
pub mod reconstruction;
pub mod variational;

pub use adversarial::{
    discriminator_loss, generator_loss, simple_gradient_penalty, AdversarialConfig, GanLoss,
};
pub use dice::{dice_loss, tversky_loss};
pub use error::{LossError, Result};
pub use perceptual::{color_consistency_loss, gram_matrix, gram_style_loss, histogram, histogram_loss};
pub use reconstruction::{classification_loss, huber_loss, l1_loss, l2_loss, ClassificationOutput};
pub use variational::{kl_loss, kl_loss_var, vdb_loss, z_sample, z_sample_var};
