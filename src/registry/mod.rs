//! Model registry
//!
//! The registry is the static catalog of models berth may load: where their
//! weights live, how important they are, and which device/dtype they prefer.
//! It is built once from configuration and never changes afterwards.

mod detect;

pub use detect::{detect_weights, WeightsFormat, WeightsSource};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{parse_dtype, DType, Device, ModelsConfig};

/// Immutable description of a registered model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    /// Resolved weights location
    pub path: PathBuf,
    /// Lower value = more important = evicted later
    pub priority_weight: u32,
    #[serde(serialize_with = "serialize_display")]
    pub device: Device,
    pub dtype: Option<DType>,
}

fn serialize_display<S: serde::Serializer>(device: &Device, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(device)
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, priority_weight: u32) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            priority_weight,
            device: Device::Auto,
            dtype: None,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }
}

/// Catalog of known models, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        Self {
            models: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), Arc::new(d)))
                .collect(),
        }
    }

    /// Build from the `models` config section, resolving relative paths
    /// against `model_dir`
    pub fn from_config(config: &ModelsConfig) -> Result<Self> {
        let mut descriptors = Vec::with_capacity(config.registry.len());
        for entry in &config.registry {
            let path = if entry.path.is_absolute() {
                entry.path.clone()
            } else {
                config.model_dir.join(&entry.path)
            };
            let device = entry
                .device
                .parse::<Device>()
                .with_context(|| format!("model '{}'", entry.name))?;
            let dtype = entry
                .dtype
                .as_deref()
                .map(parse_dtype)
                .transpose()
                .with_context(|| format!("model '{}'", entry.name))?;

            descriptors.push(ModelDescriptor {
                name: entry.name.clone(),
                path,
                priority_weight: entry.priority_weight,
                device,
                dtype,
            });
        }
        Ok(Self::new(descriptors))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ModelDescriptor>> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.models.values()
    }

    /// Descriptors from most to least important (ascending weight, then name)
    pub fn by_importance(&self) -> Vec<Arc<ModelDescriptor>> {
        let mut models: Vec<_> = self.models.values().cloned().collect();
        models.sort_by(|a, b| {
            a.priority_weight
                .cmp(&b.priority_weight)
                .then_with(|| a.name.cmp(&b.name))
        });
        models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelEntryConfig;

    #[test]
    fn test_from_config_resolves_paths_and_hints() {
        let config = ModelsConfig {
            model_dir: PathBuf::from("/srv/models"),
            registry: vec![
                ModelEntryConfig {
                    name: "llama".into(),
                    path: "llama.gguf".into(),
                    priority_weight: 1,
                    device: "cuda:1".into(),
                    dtype: Some("bfloat16".into()),
                },
                ModelEntryConfig {
                    name: "embed".into(),
                    path: "/opt/embed".into(),
                    priority_weight: 8,
                    device: "auto".into(),
                    dtype: None,
                },
            ],
            ..Default::default()
        };

        let registry = ModelRegistry::from_config(&config).unwrap();
        let llama = registry.get("llama").unwrap();
        assert_eq!(llama.path, PathBuf::from("/srv/models/llama.gguf"));
        assert_eq!(llama.device, Device::Cuda(1));
        assert_eq!(llama.dtype, Some(DType::Bf16));
        assert_eq!(registry.get("embed").unwrap().path, PathBuf::from("/opt/embed"));
        assert!(!registry.contains("mistral"));
    }

    #[test]
    fn test_by_importance() {
        let registry = ModelRegistry::new([
            ModelDescriptor::new("c", "c", 10),
            ModelDescriptor::new("a", "a", 1),
            ModelDescriptor::new("b", "b", 5),
        ]);
        let order: Vec<_> = registry
            .by_importance()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
