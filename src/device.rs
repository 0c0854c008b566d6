use crate::config::{Config, DevicePreference};
use log::{info, warn};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Gpu(u32),
    Cpu(usize),
}

/// The device every dispatch of a run will use. `fallback` is set when a GPU
/// was requested but none could be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelection {
    pub device: Device,
    pub fallback: bool,
}

impl DeviceSelection {
    pub fn resolve(config: &Config, gpu_available: bool) -> Self {
        match config.device {
            DevicePreference::Gpu if gpu_available && !config.force_cpu => Self {
                device: Device::Gpu(config.gpu_device),
                fallback: false,
            },
            DevicePreference::Gpu => {
                warn!(
                    "GPU {} requested but not available, falling back to {} CPU cores",
                    config.gpu_device,
                    config.effective_cpu_cores()
                );
                Self {
                    device: Device::Cpu(config.effective_cpu_cores()),
                    fallback: true,
                }
            }
            DevicePreference::Cpu => Self {
                device: Device::Cpu(config.effective_cpu_cores()),
                fallback: false,
            },
        }
    }

    pub fn uses_gpu(&self) -> bool {
        matches!(self.device, Device::Gpu(_))
    }

    pub fn args(&self) -> Vec<String> {
        match self.device {
            Device::Gpu(index) => vec!["--device".to_string(), index.to_string()],
            Device::Cpu(cores) => vec!["--cpu".to_string(), cores.to_string()],
        }
    }
}

/// Probe for a usable NVIDIA GPU.
pub async fn gpu_available() -> bool {
    match Command::new("nvidia-smi").arg("-L").output().await {
        Ok(output) if output.status.success() => {
            let listing = String::from_utf8_lossy(&output.stdout);
            let first = listing.lines().next().unwrap_or_default();
            info!("GPU detected: {}", first);
            !first.is_empty()
        }
        Ok(output) => {
            warn!(
                "nvidia-smi exited with {}, using CPU",
                output.status.code().unwrap_or(-1)
            );
            false
        }
        Err(e) => {
            warn!("GPU check failed ({}), using CPU", e);
            false
        }
    }
}
