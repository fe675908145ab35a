use thiserror::Error;

pub type Result<T> = std::result::Result<T, LossError>;

#[derive(Error, Debug)]
pub enum LossError {
    /// A GAN loss identifier outside the supported set.
    #[error("unknown GAN loss function `{0}`")]
    UnknownLossFunction(String),

    #[error("invalid shape for {label}: {message}")]
    InvalidShape { label: &'static str, message: String },

    /// Autodiff produced no gradient for the named input.
    #[error("no gradient flows from the logits to {0}")]
    MissingGradient(&'static str),

    #[error("invalid loss configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl LossError {
    pub(crate) fn shape<S: Into<String>>(label: &'static str, message: S) -> Self {
        Self::InvalidShape {
            label,
            message: message.into(),
        }
    }
}

pub(crate) fn expect_same_shape(
    label: &'static str,
    lhs: &candle_core::Tensor,
    rhs: &candle_core::Tensor,
) -> Result<()> {
    if lhs.dims() != rhs.dims() {
        return Err(LossError::shape(
            label,
            format!("{:?} does not match {:?}", lhs.dims(), rhs.dims()),
        ));
    }
    Ok(())
}
