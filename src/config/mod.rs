//! Configuration system for berth
//!
//! BerthConfig gathers the queue, model pool, worker, store and control-plane
//! settings. Every section has serde defaults so a config file only needs to
//! name what it changes.

mod models;
mod queue;
mod server;
mod workers;

pub use models::{Device, ModelEntryConfig, ModelsConfig};
pub use queue::QueueConfig;
pub use server::ServerConfig;
pub use workers::WorkerConfig;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "BERTH_CONFIG";

/// Environment variable overriding `models.model_dir`
pub const MODEL_DIR_ENV: &str = "BERTH_MODEL_DIR";

/// Element type hint passed to the model loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    Bf16,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a dtype string into a `DType`.
///
/// Accepts short and long forms: "f32"/"float32", "f16"/"float16", "bf16"/"bfloat16".
pub fn parse_dtype(s: &str) -> Result<DType> {
    match s {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::Bf16),
        other => Err(anyhow!("unknown dtype: '{}'", other)),
    }
}

/// Durable work store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot written after every mutation (None = memory only)
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

/// Top-level berth configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BerthConfig {
    /// Disables the idle reaper so models stay resident while iterating locally
    #[serde(default)]
    pub development_mode: bool,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl BerthConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load from a file chosen by extension, apply env overrides, validate.
    ///
    /// With no explicit path, `BERTH_CONFIG` is consulted; with neither, the
    /// defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let loaded = match path.extension().and_then(|e| e.to_str()) {
                    Some("json") => Self::from_json(&path),
                    _ => Self::from_yaml(&path),
                };
                loaded.with_context(|| format!("loading config from {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(MODEL_DIR_ENV) {
            self.models.model_dir = PathBuf::from(dir);
        }
    }

    /// Reject configurations the managers cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_queue_size == 0 {
            bail!("queue.max_queue_size must be at least 1");
        }
        if self.models.max_loaded_models == 0 {
            bail!("models.max_loaded_models must be at least 1");
        }
        if self.workers.count == 0 {
            bail!("workers.count must be at least 1");
        }

        let mut seen = HashSet::new();
        for entry in &self.models.registry {
            if !seen.insert(entry.name.as_str()) {
                bail!("duplicate model in registry: '{}'", entry.name);
            }
            if let Some(dtype) = &entry.dtype {
                parse_dtype(dtype).with_context(|| format!("model '{}'", entry.name))?;
            }
            entry
                .device
                .parse::<Device>()
                .with_context(|| format!("model '{}'", entry.name))?;
        }

        Ok(())
    }
}
