use std::{fmt::Display, str::FromStr};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::info;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, clap::ValueEnum)]
/// DType for the model.
///
/// Note: When using `Auto`, accelerators use F16 if a probe matmul succeeds and the CPU always uses F32.
pub enum ModelDType {
    #[default]
    Auto,
    BF16,
    F16,
    F32,
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::BF16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

impl FromStr for ModelDType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "bf16" => Ok(Self::BF16),
            "f16" => Ok(Self::F16),
            "f32" => Ok(Self::F32),
            other => Err(format!("unknown dtype `{other}`")),
        }
    }
}

/// Type which can be converted to a DType
pub trait TryIntoDType {
    fn try_into_dtype(&self, device: &Device, silent: bool) -> Result<DType>;
}

impl TryIntoDType for DType {
    fn try_into_dtype(&self, _: &Device, silent: bool) -> Result<DType> {
        if !silent {
            info!("dtype selected is {self:?}.");
        }
        if !matches!(self, DType::BF16 | DType::F32 | DType::F16) {
            anyhow::bail!("DType must be one of BF16, F16, F32");
        }
        Ok(*self)
    }
}

fn determine_auto_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        return DType::F32;
    }
    // Try a matmul
    let supported = Tensor::zeros((2, 2), DType::F16, device)
        .and_then(|x| x.matmul(&x))
        .is_ok();
    if supported {
        DType::F16
    } else {
        DType::F32
    }
}

impl TryIntoDType for ModelDType {
    fn try_into_dtype(&self, device: &Device, silent: bool) -> Result<DType> {
        let dtype = match self {
            Self::Auto => determine_auto_dtype(device),
            Self::BF16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        if !silent {
            info!("dtype selected is {dtype:?}.");
        }
        Ok(dtype)
    }
}
