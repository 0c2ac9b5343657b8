//! Load/unload capability used by the model manager

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{DType, Device};
use crate::registry::{detect_weights, ModelDescriptor, WeightsSource};

/// Brings a model into memory and releases it again.
///
/// `load` may take seconds to minutes; the manager calls it holding only the
/// model's own lock.
#[async_trait]
pub trait ModelLoader: Send + Sync + 'static {
    /// Resident handle, owned by the manager while the model is loaded
    type Handle: Send + Sync + 'static;

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        device: Device,
        dtype: Option<DType>,
    ) -> Result<Self::Handle>;

    async fn unload(&self, descriptor: &ModelDescriptor, handle: Arc<Self::Handle>) -> Result<()>;
}

/// A model resolved to weights on disk
#[derive(Debug, Clone, Serialize)]
pub struct ResidentModel {
    pub name: String,
    pub source: WeightsSource,
    pub size_bytes: u64,
    #[serde(serialize_with = "serialize_display")]
    pub device: Device,
    pub dtype: Option<DType>,
    pub loaded_at: DateTime<Utc>,
}

fn serialize_display<S: serde::Serializer>(
    device: &Device,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(device)
}

/// Loader that resolves registry paths to SafeTensors/GGUF weights.
///
/// It validates and sizes the weights; the inference backend that consumes
/// the handle does the actual tensor upload.
#[derive(Debug, Clone, Default)]
pub struct FileModelLoader;

#[async_trait]
impl ModelLoader for FileModelLoader {
    type Handle = ResidentModel;

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        device: Device,
        dtype: Option<DType>,
    ) -> Result<ResidentModel> {
        let path = descriptor.path.clone();
        let (source, size_bytes) = tokio::task::spawn_blocking(move || {
            let source = detect_weights(&path)?;
            let size = source.total_bytes();
            anyhow::Ok((source, size))
        })
        .await??;

        tracing::debug!(
            model = %descriptor.name,
            format = %source.format,
            size_mb = size_bytes / (1024 * 1024),
            %device,
            "Resolved model weights"
        );

        Ok(ResidentModel {
            name: descriptor.name.clone(),
            source,
            size_bytes,
            device,
            dtype,
            loaded_at: Utc::now(),
        })
    }

    async fn unload(&self, descriptor: &ModelDescriptor, handle: Arc<ResidentModel>) -> Result<()> {
        tracing::debug!(
            model = %descriptor.name,
            outstanding_refs = Arc::strong_count(&handle) - 1,
            "Releasing model weights"
        );
        drop(handle);
        Ok(())
    }
}
