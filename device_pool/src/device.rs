use std::{env, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// An execution device a worker can be bound to.
///
/// Written as `cpu` or `cuda:<ordinal>` in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl Device {
    /// Lists the accelerators visible to this process.
    ///
    /// # Returns
    /// One device per ordinal in `CUDA_VISIBLE_DEVICES`, or a single `Cpu` device when
    /// the variable is unset or names no usable ordinal.
    pub fn discover() -> Vec<Device> {
        Self::from_visible(env::var(VISIBLE_DEVICES_VAR).ok().as_deref())
    }

    fn from_visible(visible: Option<&str>) -> Vec<Device> {
        let devices: Vec<Device> = visible
            .unwrap_or_default()
            .split(',')
            .filter_map(|ordinal| ordinal.trim().parse().ok())
            .map(Device::Cuda)
            .collect();

        if devices.is_empty() {
            vec![Device::Cpu]
        } else {
            devices
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "cpu" => Ok(Device::Cpu),
            Some(("cuda", ordinal)) => ordinal
                .parse()
                .map(Device::Cuda)
                .map_err(|e| format!("invalid cuda ordinal {ordinal:?}: {e}")),
            _ => Err(format!("unknown device {s:?}, expected `cpu` or `cuda:<n>`")),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}
