//! Worker loops
//!
//! A worker claims the next request from the queue, leases the model it
//! needs from the [`ModelManager`], runs it through an
//! [`InferenceExecutor`] and records the outcome. Shutdown is only observed
//! between requests, so a claimed request always runs to completion.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{BerthError, Result};
use crate::lifecycle::{LoadOptions, ModelLease, ModelLoader, ModelManager};
use crate::queue::{Outcome, QueueManager, QueuedRequest};

/// Runs a claimed request against a resident model
#[async_trait]
pub trait InferenceExecutor<H: Send + Sync>: Send + Sync + 'static {
    async fn execute(
        &self,
        model_name: &str,
        model: &H,
        request: &QueuedRequest,
    ) -> anyhow::Result<Value>;
}

/// Executor that answers with the request it was given.
/// Used by `berth serve` when no inference backend is attached.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor;

#[async_trait]
impl<H: Send + Sync + 'static> InferenceExecutor<H> for EchoExecutor {
    async fn execute(
        &self,
        model_name: &str,
        _model: &H,
        request: &QueuedRequest,
    ) -> anyhow::Result<Value> {
        Ok(json!({
            "model": model_name,
            "kind": request.kind,
            "echo": request.payload,
        }))
    }
}

/// Failures worth another `get_model` attempt
fn is_retryable(err: &BerthError) -> bool {
    matches!(
        err,
        BerthError::ModelLoad { .. } | BerthError::NoEvictableModel { .. } | BerthError::ModelInUse(_)
    )
}

/// Single worker loop
pub struct Worker<L: ModelLoader, E> {
    id: usize,
    queue: Arc<QueueManager>,
    models: ModelManager<L>,
    executor: Arc<E>,
    config: WorkerConfig,
}

impl<L, E> Worker<L, E>
where
    L: ModelLoader,
    E: InferenceExecutor<L::Handle>,
{
    pub fn new(
        id: usize,
        queue: Arc<QueueManager>,
        models: ModelManager<L>,
        executor: Arc<E>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            queue,
            models,
            executor,
            config,
        }
    }

    /// Model for a request: the payload's `model` field, then the
    /// per-kind mapping, then the configured default
    pub fn resolve_model(&self, request: &QueuedRequest) -> Option<String> {
        request
            .requested_model()
            .map(str::to_string)
            .or_else(|| self.config.kind_models.get(&request.kind).cloned())
            .or_else(|| self.config.default_model.clone())
    }

    /// Process at most one request. Returns false when the queue was empty.
    pub async fn step(&self) -> Result<bool> {
        let Some(mut request) = self.queue.dequeue_next().await? else {
            return Ok(false);
        };

        let outcome = self.process(&mut request).await;
        if let Err(reason) = &outcome {
            warn!(worker = self.id, request_id = %request.id, error = %reason, "Request failed");
        }
        self.queue.complete(&request, outcome).await?;
        Ok(true)
    }

    async fn process(&self, request: &mut QueuedRequest) -> Outcome {
        let Some(model_name) = self.resolve_model(request) else {
            return Err(format!(
                "no model configured for request kind '{}'",
                request.kind
            ));
        };

        let lease = self
            .acquire(&model_name, request)
            .await
            .map_err(|e| e.to_string())?;

        debug!(worker = self.id, request_id = %request.id, model = %model_name, "Executing request");
        self.executor
            .execute(&model_name, &lease, request)
            .await
            .map_err(|e| format!("{:#}", e))
    }

    /// Lease a model, retrying transient failures with exponential backoff
    /// up to `max_retries` times
    async fn acquire(
        &self,
        model: &str,
        request: &mut QueuedRequest,
    ) -> Result<ModelLease<L::Handle>> {
        let max_retries = self.queue.config().max_retries;
        let mut backoff = self.config.retry_backoff();

        loop {
            match self.models.get_model(model, LoadOptions::default()).await {
                Ok(lease) => return Ok(lease),
                Err(e) if is_retryable(&e) && request.retry_count < max_retries => {
                    request.retry_count += 1;
                    warn!(
                        worker = self.id,
                        request_id = %request.id,
                        model,
                        attempt = request.retry_count,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Model unavailable, retrying"
                    );
                    if let Err(e) = self.queue.update_in_flight(request).await {
                        warn!(request_id = %request.id, error = %e, "Could not persist retry count");
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped)
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, "Worker started");
        let poll_interval = self.config.poll_interval();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.step().await {
                Ok(true) => continue,
                Ok(false) => true,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Worker step failed");
                    false
                }
            };

            tokio::select! {
                _ = self.queue.wait_for_work(poll_interval), if idle => {}
                _ = tokio::time::sleep(poll_interval), if !idle => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker = self.id, "Worker stopped");
    }
}

/// A set of worker loops sharing one shutdown signal
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<L, E>(
        queue: Arc<QueueManager>,
        models: ModelManager<L>,
        executor: Arc<E>,
        config: WorkerConfig,
    ) -> Self
    where
        L: ModelLoader,
        E: InferenceExecutor<L::Handle>,
    {
        let (shutdown, rx) = watch::channel(false);
        let handles = (0..config.count.max(1))
            .map(|id| {
                let worker = Worker::new(
                    id,
                    queue.clone(),
                    models.clone(),
                    executor.clone(),
                    config.clone(),
                );
                tokio::spawn(worker.run(rx.clone()))
            })
            .collect();

        Self { shutdown, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker and wait for in-progress requests to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DType, Device, QueueConfig};
    use crate::lifecycle::PoolSettings;
    use crate::queue::{RequestState, Role};
    use crate::registry::{ModelDescriptor, ModelRegistry};
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` loads, then succeeds
    #[derive(Default)]
    struct FlakyLoader {
        failures: AtomicU32,
    }

    #[async_trait]
    impl ModelLoader for Arc<FlakyLoader> {
        type Handle = String;

        async fn load(
            &self,
            descriptor: &ModelDescriptor,
            _device: Device,
            _dtype: Option<DType>,
        ) -> anyhow::Result<String> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("device busy");
            }
            Ok(descriptor.name.clone())
        }

        async fn unload(&self, _: &ModelDescriptor, _: Arc<String>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl InferenceExecutor<String> for FailingExecutor {
        async fn execute(&self, _: &str, _: &String, _: &QueuedRequest) -> anyhow::Result<Value> {
            anyhow::bail!("backend crashed")
        }
    }

    struct Fixture {
        queue: Arc<QueueManager>,
        models: ModelManager<Arc<FlakyLoader>>,
        loader: Arc<FlakyLoader>,
        config: WorkerConfig,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ModelRegistry::new([
            ModelDescriptor::new("llama", "/m/llama", 1),
            ModelDescriptor::new("mistral", "/m/mistral", 5),
        ]));
        let loader = Arc::new(FlakyLoader::default());
        let models = ModelManager::new(
            registry,
            loader.clone(),
            PoolSettings {
                max_loaded_models: 1,
                ..Default::default()
            },
        );
        let queue = Arc::new(QueueManager::new(
            Arc::new(MemoryStore::new()),
            QueueConfig::default(),
        ));
        let config = WorkerConfig {
            poll_interval_ms: 10,
            default_model: Some("llama".into()),
            kind_models: HashMap::from([("report".to_string(), "mistral".to_string())]),
            ..Default::default()
        };
        Fixture {
            queue,
            models,
            loader,
            config,
        }
    }

    impl Fixture {
        fn worker(&self) -> Worker<Arc<FlakyLoader>, EchoExecutor> {
            Worker::new(
                0,
                self.queue.clone(),
                self.models.clone(),
                Arc::new(EchoExecutor),
                self.config.clone(),
            )
        }
    }

    #[test]
    fn test_model_resolution_order() {
        let fx = fixture();
        let worker = fx.worker();

        let explicit = QueuedRequest::new("u", Role::Employee, 50, 1, "report", json!({"model": "llama"}));
        assert_eq!(worker.resolve_model(&explicit).as_deref(), Some("llama"));

        let by_kind = QueuedRequest::new("u", Role::Employee, 50, 2, "report", json!({}));
        assert_eq!(worker.resolve_model(&by_kind).as_deref(), Some("mistral"));

        let fallback = QueuedRequest::new("u", Role::Employee, 50, 3, "chat", json!({"model": 7}));
        assert_eq!(worker.resolve_model(&fallback).as_deref(), Some("llama"));
    }

    #[tokio::test]
    async fn test_step_completes_highest_priority_first() {
        let fx = fixture();
        let worker = fx.worker();

        let low = fx
            .queue
            .enqueue("guest", Role::Guest, "chat", json!({"q": 1}), 0)
            .await
            .unwrap();
        let high = fx
            .queue
            .enqueue("boss", Role::Admin, "chat", json!({"q": 2}), 0)
            .await
            .unwrap();

        assert!(worker.step().await.unwrap());
        let done = fx.queue.get_status(high).await.unwrap();
        assert_eq!(done.request.status, RequestState::Completed);
        let result = done.request.result.unwrap();
        assert_eq!(result["model"], "llama");
        assert_eq!(result["echo"]["q"], 2);
        assert_eq!(
            fx.queue.get_status(low).await.unwrap().request.status,
            RequestState::Queued
        );

        assert!(worker.step().await.unwrap());
        assert!(!worker.step().await.unwrap());
        assert_eq!(fx.queue.get_queue_stats().await.unwrap().total_completed, 2);
    }

    #[tokio::test]
    async fn test_no_model_fails_request() {
        let mut fx = fixture();
        fx.config.default_model = None;
        let worker = fx.worker();

        let id = fx
            .queue
            .enqueue("u", Role::Employee, "chat", json!({}), 0)
            .await
            .unwrap();
        worker.step().await.unwrap();

        let status = fx.queue.get_status(id).await.unwrap().request;
        assert_eq!(status.status, RequestState::Failed);
        assert!(status.error.unwrap().contains("no model configured"));
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_retried() {
        let fx = fixture();
        let worker = fx.worker();

        let id = fx
            .queue
            .enqueue("u", Role::Employee, "chat", json!({"model": "gpt-9"}), 0)
            .await
            .unwrap();
        worker.step().await.unwrap();

        let status = fx.queue.get_status(id).await.unwrap().request;
        assert_eq!(status.status, RequestState::Failed);
        assert_eq!(status.retry_count, 0);
        assert!(status.error.unwrap().contains("gpt-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_load_failure_is_retried() {
        let fx = fixture();
        fx.loader.failures.store(2, Ordering::SeqCst);
        let worker = fx.worker();

        let id = fx
            .queue
            .enqueue("u", Role::Manager, "chat", json!({}), 0)
            .await
            .unwrap();
        worker.step().await.unwrap();

        let status = fx.queue.get_status(id).await.unwrap().request;
        assert_eq!(status.status, RequestState::Completed);
        assert_eq!(status.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let fx = fixture();
        fx.loader.failures.store(100, Ordering::SeqCst);
        let worker = fx.worker();

        let id = fx
            .queue
            .enqueue("u", Role::Manager, "chat", json!({}), 0)
            .await
            .unwrap();
        worker.step().await.unwrap();

        let status = fx.queue.get_status(id).await.unwrap().request;
        assert_eq!(status.status, RequestState::Failed);
        assert_eq!(status.retry_count, fx.queue.config().max_retries);
        assert!(status.error.unwrap().contains("device busy"));

        // the first attempt plus max_retries retries
        let attempts = 100 - fx.loader.failures.load(Ordering::SeqCst);
        assert_eq!(attempts, fx.queue.config().max_retries + 1);
    }

    #[tokio::test]
    async fn test_executor_error_fails_request() {
        let fx = fixture();
        let worker = Worker::new(
            0,
            fx.queue.clone(),
            fx.models.clone(),
            Arc::new(FailingExecutor),
            fx.config.clone(),
        );

        let id = fx
            .queue
            .enqueue("u", Role::Employee, "chat", json!({}), 0)
            .await
            .unwrap();
        worker.step().await.unwrap();

        let status = fx.queue.get_status(id).await.unwrap().request;
        assert_eq!(status.status, RequestState::Failed);
        assert_eq!(status.error.as_deref(), Some("backend crashed"));
        // The lease was returned even though execution failed
        assert_eq!(fx.models.get_loaded_models()["llama"].in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_drains_queue_and_shuts_down() {
        let fx = fixture();
        let pool = WorkerPool::spawn(
            fx.queue.clone(),
            fx.models.clone(),
            Arc::new(EchoExecutor),
            WorkerConfig {
                count: 3,
                ..fx.config.clone()
            },
        );
        assert_eq!(pool.len(), 3);

        for i in 0..6 {
            fx.queue
                .enqueue("u", Role::Employee, "chat", json!({ "n": i }), 0)
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if fx.queue.get_queue_stats().await.unwrap().total_completed == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stats = fx.queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.total_completed, 6);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.in_flight, 0);

        pool.shutdown().await;
    }
}
