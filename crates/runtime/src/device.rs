//! Device selection for GPU acceleration.
//!
//! `auto` tries Metal, then CUDA, then falls back to CPU. Only accelerators
//! compiled in through the `metal` / `cuda` features are considered.

use candle_core::Device;
use llama_core::{DeviceConfig, DeviceType, LlamaError, LlamaResult};
use tracing::{info, warn};

/// Parse a device name from the command line.
pub fn parse_device_type(s: &str) -> LlamaResult<DeviceType> {
    match s.to_lowercase().as_str() {
        "auto" => Ok(DeviceType::Auto),
        "cpu" => Ok(DeviceType::Cpu),
        "metal" | "mps" => Ok(DeviceType::Metal),
        "cuda" | "gpu" => Ok(DeviceType::Cuda),
        other => Err(LlamaError::config(format!("unknown device: {other}"))),
    }
}

/// Select a device according to the configuration.
pub fn select_device(config: &DeviceConfig) -> LlamaResult<Device> {
    let index = config.gpu_index.unwrap_or(0);
    match config.device_type {
        DeviceType::Cpu => {
            info!("Using CPU device (forced)");
            Ok(Device::Cpu)
        }
        DeviceType::Metal => select_metal(index),
        DeviceType::Cuda => select_cuda(index),
        DeviceType::Auto => Ok(select_auto(index)),
    }
}

fn select_auto(index: usize) -> Device {
    #[cfg(feature = "metal")]
    {
        match Device::new_metal(index) {
            Ok(device) => {
                info!(index, "Auto-selected Metal GPU");
                return device;
            }
            Err(e) => warn!("Metal GPU not available: {e}"),
        }
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(index) {
            Ok(device) => {
                info!(index, "Auto-selected CUDA GPU");
                return device;
            }
            Err(e) => warn!("CUDA GPU not available: {e}"),
        }
    }

    let _ = index;
    info!("Using CPU device (no GPU available)");
    Device::Cpu
}

#[allow(unused_variables)]
fn select_metal(index: usize) -> LlamaResult<Device> {
    #[cfg(feature = "metal")]
    {
        Device::new_metal(index)
            .map(|device| {
                info!(index, "Using Metal GPU");
                device
            })
            .map_err(|e| LlamaError::config(format!("Metal GPU {index} not available: {e}")))
    }

    #[cfg(not(feature = "metal"))]
    {
        warn!("Metal requested in a build without the 'metal' feature");
        Err(LlamaError::config(
            "Metal GPU requested but 'metal' feature not enabled",
        ))
    }
}

#[allow(unused_variables)]
fn select_cuda(index: usize) -> LlamaResult<Device> {
    #[cfg(feature = "cuda")]
    {
        Device::new_cuda(index)
            .map(|device| {
                info!(index, "Using CUDA GPU");
                device
            })
            .map_err(|e| LlamaError::config(format!("CUDA GPU {index} not available: {e}")))
    }

    #[cfg(not(feature = "cuda"))]
    {
        warn!("CUDA requested in a build without the 'cuda' feature");
        Err(LlamaError::config(
            "CUDA GPU requested but 'cuda' feature not enabled",
        ))
    }
}

/// Get device name for logging/display.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA GPU",
        Device::Metal(_) => "Metal GPU",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_type() {
        assert_eq!(parse_device_type("CPU").unwrap(), DeviceType::Cpu);
        assert_eq!(parse_device_type("mps").unwrap(), DeviceType::Metal);
        assert_eq!(parse_device_type("gpu").unwrap(), DeviceType::Cuda);
        assert_eq!(parse_device_type("auto").unwrap(), DeviceType::Auto);
        assert!(parse_device_type("tpu").is_err());
    }

    #[test]
    fn test_select_cpu() {
        let config = DeviceConfig {
            device_type: DeviceType::Cpu,
            gpu_index: None,
        };
        assert!(matches!(select_device(&config).unwrap(), Device::Cpu));
    }

    #[test]
    fn test_select_auto_always_succeeds() {
        let device = select_device(&DeviceConfig::default()).unwrap();
        assert!(matches!(
            device,
            Device::Cpu | Device::Metal(_) | Device::Cuda(_)
        ));
    }

    #[test]
    fn test_device_name() {
        assert_eq!(device_name(&Device::Cpu), "CPU");
    }
}
