//! Device selection: where inference runs and with what precision.
//!
//! The pairing is fixed: CUDA runs float16 with flash-attention-2 (when the
//! `flash-attn` feature is compiled in), CPU runs float32 with eager
//! attention. Callers pick a [`DevicePreference`]; [`DevicePreference::resolve`]
//! turns it into the concrete candle device plus dtype and attention backend.

use crate::error::OcrError;
use candle_core::{DType, Device, DeviceLocation};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Which device the caller wants. Parsed from `auto`, `cpu`, `cuda`, `cuda:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA device 0 when available, else CPU (default).
    #[default]
    Auto,
    /// Force CPU.
    Cpu,
    /// A specific CUDA device ordinal. Requires the `cuda` feature.
    Cuda(usize),
}

impl FromStr for DevicePreference {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        match s.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            _ => {
                if let Some(ordinal) = s.strip_prefix("cuda:") {
                    let ordinal = ordinal.parse().map_err(|_| {
                        OcrError::InvalidConfig(format!("invalid CUDA ordinal in '{s}'"))
                    })?;
                    Ok(Self::Cuda(ordinal))
                } else {
                    Err(OcrError::InvalidConfig(format!(
                        "unknown device '{s}'; use 'auto', 'cpu', 'cuda', or 'cuda:N'"
                    )))
                }
            }
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(n) => write!(f, "cuda:{n}"),
        }
    }
}

/// How scaled-dot-product attention is computed in the text decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionBackend {
    /// Fused flash-attention-2 kernels. CUDA only, `flash-attn` feature.
    FlashAttention2,
    /// Plain matmul + softmax.
    Eager,
}

impl fmt::Display for AttentionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlashAttention2 => write!(f, "flash-attention-2"),
            Self::Eager => write!(f, "eager"),
        }
    }
}

/// A resolved inference target: concrete device plus the precision and
/// attention backend that go with it.
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: Device,
    pub dtype: DType,
    pub attention: AttentionBackend,
}

impl DeviceSelection {
    fn from_device(device: Device) -> Self {
        let (dtype, attention) = if device.is_cuda() {
            let attention = if cfg!(feature = "flash-attn") {
                AttentionBackend::FlashAttention2
            } else {
                debug!("flash-attn feature not compiled in; using eager attention on CUDA");
                AttentionBackend::Eager
            };
            (DType::F16, attention)
        } else {
            (DType::F32, AttentionBackend::Eager)
        };
        Self {
            device,
            dtype,
            attention,
        }
    }

    /// One-line human-readable summary, e.g. `cuda:0 (float16, flash-attention-2)`.
    pub fn describe(&self) -> String {
        let location = match self.device.location() {
            DeviceLocation::Cpu => "cpu".to_string(),
            DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
            DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
        };
        let dtype = match self.dtype {
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::BF16 => "bfloat16",
            other => return format!("{location} ({other:?}, {})", self.attention),
        };
        format!("{location} ({dtype}, {})", self.attention)
    }
}

impl DevicePreference {
    /// Resolve the preference into a concrete device, dtype, and attention
    /// backend.
    pub fn resolve(&self) -> Result<DeviceSelection, OcrError> {
        let device = match self {
            Self::Auto => Device::cuda_if_available(0).map_err(|e| {
                OcrError::InvalidConfig(format!("failed to initialise CUDA device 0: {e}"))
            })?,
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => {
                #[cfg(feature = "cuda")]
                {
                    Device::new_cuda(*ordinal).map_err(|e| {
                        OcrError::InvalidConfig(format!(
                            "failed to create CUDA device {ordinal}: {e}"
                        ))
                    })?
                }
                #[cfg(not(feature = "cuda"))]
                {
                    return Err(OcrError::InvalidConfig(format!(
                        "device 'cuda:{ordinal}' requested but CUDA support is not \
                         enabled; compile with --features cuda"
                    )));
                }
            }
        };
        Ok(DeviceSelection::from_device(device))
    }
}
