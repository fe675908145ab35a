//! Precision policy used by every statistic computed in this crate.
//!
//! Parameters and activations may live in `f16`/`bf16`, but batch, instance
//! and layer moments are always reduced in at least `f32` before the result is
//! cast back to the storage dtype. [`PrecisionPolicy`] centralises those casts.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, reduction: DType) -> Self {
        Self { storage, reduction }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, reduction)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for reductions such as normalisation moments.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether statistics are computed in a wider dtype.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.reduction
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn policy_promotes_reduced_precision_parameters() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        assert_eq!(policy.storage(), DType::F16);
        assert_eq!(policy.reduction(), DType::F32);
        assert!(policy.is_mixed_precision());

        let wide = PrecisionPolicy::from_parameter_dtype(DType::F64);
        assert_eq!(wide.reduction(), DType::F64);
        assert!(!wide.is_mixed_precision());
    }

    #[test]
    fn reductions_promote_to_f32_and_cast_back() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let tensor = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &device)?
            .to_dtype(policy.storage())?;

        let promoted = policy.cast_for_reduction(&tensor)?;
        assert_eq!(promoted.dtype(), DType::F32);

        let restored = policy.cast_to_storage(&promoted)?;
        assert_eq!(restored.dtype(), DType::BF16);
        let values = restored.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert_eq!(values, vec![0.125, -0.75, 3.5]);
        Ok(())
    }
}
