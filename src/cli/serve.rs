//! Serve command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::config::BerthConfig;
use crate::lifecycle::{FileModelLoader, ModelManager, PoolSettings};
use crate::queue::QueueManager;
use crate::registry::ModelRegistry;
use crate::server::{self, AppState};
use crate::store::{MemoryStore, WorkStore};
use crate::worker::{EchoExecutor, WorkerPool};

/// Run berth until Ctrl-C
pub async fn serve(config_path: Option<PathBuf>, port: Option<u16>, host: Option<String>) -> Result<()> {
    let mut config = BerthConfig::load(config_path.as_deref())?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    let store: Arc<dyn WorkStore> = match &config.store.snapshot_path {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => {
            tracing::warn!("No store.snapshot_path configured; queue state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let (queue, recovery) = QueueManager::start(store, config.queue.clone()).await?;
    let queue = Arc::new(queue);
    if recovery.unreadable > 0 {
        tracing::warn!(count = recovery.unreadable, "Unreadable in-flight entries were left in place");
    }

    let registry = Arc::new(ModelRegistry::from_config(&config.models)?);
    tracing::info!(
        registered = registry.len(),
        max_loaded = config.models.max_loaded_models,
        "Model registry ready"
    );
    let models = ModelManager::new(
        registry,
        FileModelLoader,
        PoolSettings::from_config(&config.models, config.development_mode),
    );

    if config.models.preload_on_startup {
        let loaded = models.preload().await;
        tracing::info!(models = ?loaded, "Preloaded models");
    }
    models.start_reaper();

    let workers = WorkerPool::spawn(
        queue.clone(),
        models.clone(),
        Arc::new(EchoExecutor),
        config.workers.clone(),
    );
    tracing::info!(count = workers.len(), "Workers started");

    let state = Arc::new(AppState::new(queue, models.clone()));
    server::start(state, config.server.clone(), shutdown_signal()).await?;

    tracing::info!("Shutting down: draining workers");
    workers.shutdown().await;
    models.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
