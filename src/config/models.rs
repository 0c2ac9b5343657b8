//! Model pool and registry settings

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Device a model is loaded onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// Defer to the model's registry hint
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Resolve `Auto` against a fallback hint
    pub fn or(self, hint: Device) -> Device {
        match self {
            Device::Auto => hint,
            other => other,
        }
    }

    /// Get device type ("auto", "cuda" or "cpu")
    pub fn device_type(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" | "" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| anyhow!("unknown device: '{}'", other)),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cuda(id) => write!(f, "cuda:{}", id),
            other => f.write_str(other.device_type()),
        }
    }
}

/// One registry entry as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntryConfig {
    pub name: String,

    /// Weights location, relative paths resolve against `model_dir`
    pub path: PathBuf,

    /// Lower value = more important = evicted later
    #[serde(default = "default_priority_weight")]
    pub priority_weight: u32,

    /// Device hint ("auto", "cpu", "cuda:N")
    #[serde(default = "default_device")]
    pub device: String,

    /// dtype hint (f32, f16, bf16)
    #[serde(default)]
    pub dtype: Option<String>,
}

fn default_priority_weight() -> u32 {
    5
}

fn default_device() -> String {
    "auto".to_string()
}

/// Model pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Upper bound on simultaneously resident models
    #[serde(default = "default_max_loaded")]
    pub max_loaded_models: usize,

    /// Resident models unused for longer than this are reaped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u64,

    /// Reaper tick
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Load the most important models at start-up
    #[serde(default)]
    pub preload_on_startup: bool,

    /// Base directory for relative registry paths
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default)]
    pub registry: Vec<ModelEntryConfig>,
}

fn default_max_loaded() -> usize {
    2
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("./models")
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            max_loaded_models: default_max_loaded(),
            idle_timeout_minutes: default_idle_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            preload_on_startup: false,
            model_dir: default_model_dir(),
            registry: Vec::new(),
        }
    }
}

impl ModelsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}
