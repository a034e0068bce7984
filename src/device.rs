//! Device selection for training-side loss computation

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Device preference for loss/head computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    Auto,
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Auto
    }
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Select a device based on preference, falling back to CPU when the
/// requested backend is unavailable.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cuda => {
            #[cfg(feature = "cuda")]
            {
                match Device::new_cuda(0) {
                    Ok(device) => {
                        tracing::info!("CUDA device selected");
                        Ok(device)
                    }
                    Err(e) => {
                        tracing::warn!("CUDA initialization failed: {}, falling back to CPU", e);
                        Ok(Device::Cpu)
                    }
                }
            }
            #[cfg(not(feature = "cuda"))]
            {
                tracing::warn!("CUDA requested but not compiled with 'cuda' feature, using CPU");
                Ok(Device::Cpu)
            }
        }

        DevicePreference::Metal => {
            #[cfg(feature = "metal")]
            {
                match Device::new_metal(0) {
                    Ok(device) => {
                        tracing::info!("Metal device selected");
                        Ok(device)
                    }
                    Err(e) => {
                        tracing::warn!("Metal initialization failed: {}, falling back to CPU", e);
                        Ok(Device::Cpu)
                    }
                }
            }
            #[cfg(not(feature = "metal"))]
            {
                tracing::warn!("Metal requested but not compiled with 'metal' feature, using CPU");
                Ok(Device::Cpu)
            }
        }

        DevicePreference::Cpu => Ok(Device::Cpu),

        DevicePreference::Auto => {
            #[cfg(feature = "cuda")]
            {
                if let Ok(device) = Device::new_cuda(0) {
                    tracing::info!("Auto-selected CUDA device");
                    return Ok(device);
                }
            }

            #[cfg(feature = "metal")]
            {
                if let Ok(device) = Device::new_metal(0) {
                    tracing::info!("Auto-selected Metal device");
                    return Ok(device);
                }
            }

            tracing::info!("Auto-selected CPU device");
            Ok(Device::Cpu)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_from_str() {
        assert_eq!(
            "cuda".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cuda
        );
        assert_eq!(
            "cpu".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cpu
        );
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_always_available() {
        let device = select_device(DevicePreference::Cpu);
        assert!(device.is_ok());
    }
}
