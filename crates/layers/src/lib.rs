//! GAN building blocks on top of Candle.
//!
//! Every image tensor is channels-last, `[batch, height, width, channels]`.
//! Stateful layers take a [`Scope`] that resolves parameters by hierarchical
//! path inside a shared [`ParamStore`]; calling a layer twice with the same
//! scope reuses its weights. The scope also carries the execution [`Mode`],
//! which decides whether normalisation layers use batch statistics and update
//! their running buffers or read the frozen ones.
//!
//! Trainable tensors live in a `candle_nn::VarMap` so any Candle optimiser can
//! consume [`ParamStore::trainable_vars`]. Non-trainable state (spectral
//! normalisation vectors, running moments) is kept apart and is updated in
//! place during the forward pass.

pub mod activations;
pub mod attention;
pub mod checks;
pub mod conv;
pub mod dtypes;
pub mod init;
pub mod linear;
pub mod norm;
pub mod params;
pub mod pooling;
pub mod recalibration;
pub mod residual;
pub mod spectral;
pub mod stats;

pub use activations::Activation;
pub use conv::{ConvConfig, PadType, Padding, PixelShuffleConfig};
pub use init::WeightInit;
pub use linear::DenseConfig;
pub use norm::{NormConfig, NormKind};
pub use params::{Constraint, Mode, ParamStore, Scope, StoreConfig};
pub use residual::BlockConfig;
