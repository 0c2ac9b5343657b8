//! HTTP control plane tests driven through the router with `oneshot`

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use berth::config::{DType, Device, QueueConfig, ServerConfig};
use berth::lifecycle::{ModelLoader, ModelManager, PoolSettings};
use berth::queue::QueueManager;
use berth::registry::{ModelDescriptor, ModelRegistry};
use berth::server::{router, AppState};
use berth::store::MemoryStore;

struct NameLoader;

#[async_trait]
impl ModelLoader for NameLoader {
    type Handle = String;

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        device: Device,
        _dtype: Option<DType>,
    ) -> anyhow::Result<String> {
        if descriptor.name == "broken" {
            anyhow::bail!("corrupt weights");
        }
        Ok(format!("{}@{}", descriptor.name, device))
    }

    async fn unload(&self, _: &ModelDescriptor, _: Arc<String>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Harness {
    app: Router,
    queue: Arc<QueueManager>,
    models: ModelManager<NameLoader>,
}

fn harness(max_queue_size: usize) -> Harness {
    let queue = Arc::new(QueueManager::new(
        Arc::new(MemoryStore::new()),
        QueueConfig {
            max_queue_size,
            ..Default::default()
        },
    ));
    let registry = Arc::new(ModelRegistry::new([
        ModelDescriptor::new("llama", "/m/llama", 1),
        ModelDescriptor::new("broken", "/m/broken", 5),
    ]));
    let models = ModelManager::new(
        registry,
        NameLoader,
        PoolSettings {
            max_loaded_models: 1,
            ..Default::default()
        },
    );
    let state = Arc::new(AppState::new(queue.clone(), models.clone()));
    Harness {
        app: router(state, &ServerConfig::default()),
        queue,
        models,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn submission(submitter: &str, role: &str) -> Value {
    json!({
        "submitter_id": submitter,
        "role": role,
        "kind": "chat",
        "payload": { "prompt": "hi" }
    })
}

#[tokio::test]
async fn health_is_ok() {
    let h = harness(10);
    let (status, _) = send(&h.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn submit_and_query_request() {
    let h = harness(10);

    let (status, body) = send(&h.app, "POST", "/v1/requests", Some(submission("ann", "guest"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["position"], 1);
    let guest_id = body["id"].as_str().unwrap().to_string();

    let (_, body) = send(&h.app, "POST", "/v1/requests", Some(submission("bob", "admin"))).await;
    assert_eq!(body["position"], 1);

    let (status, body) = send(&h.app, "GET", &format!("/v1/requests/{}", guest_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["submitter_id"], "ann");
    assert_eq!(body["role"], "guest");
    assert_eq!(body["position"], 2);

    let (status, body) = send(
        &h.app,
        "GET",
        &format!("/v1/requests/{}/position", guest_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["position"], 2);
}

#[tokio::test]
async fn unknown_role_is_admitted_as_guest() {
    let h = harness(10);
    let (status, body) = send(&h.app, "POST", "/v1/requests", Some(submission("c", "contractor"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let id = body["id"].as_str().unwrap();
    let (_, body) = send(&h.app, "GET", &format!("/v1/requests/{}", id), None).await;
    assert_eq!(body["role"], "guest");
}

#[tokio::test]
async fn full_queue_is_503() {
    let h = harness(1);
    send(&h.app, "POST", "/v1/requests", Some(submission("a", "admin"))).await;

    let (status, body) = send(&h.app, "POST", "/v1/requests", Some(submission("b", "admin"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "queue_full");
}

#[tokio::test]
async fn cancel_queued_then_conflict() {
    let h = harness(10);
    let (_, body) = send(&h.app, "POST", "/v1/requests", Some(submission("a", "employee"))).await;
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(&h.app, "DELETE", &format!("/v1/requests/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let (status, _) = send(&h.app, "DELETE", &format!("/v1/requests/{}", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(&h.app, "GET", &format!("/v1/requests/{}", id), None).await;
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn in_flight_request_cannot_be_cancelled() {
    let h = harness(10);
    let (_, body) = send(&h.app, "POST", "/v1/requests", Some(submission("a", "manager"))).await;
    let id = body["id"].as_str().unwrap().to_string();

    let claimed = h.queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(claimed.id.to_string(), id);

    let (status, _) = send(&h.app, "DELETE", &format!("/v1/requests/{}", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(&h.app, "GET", &format!("/v1/requests/{}/position", id), None).await;
    assert_eq!(body["position"], Value::Null);

    let (_, body) = send(&h.app, "GET", &format!("/v1/requests/{}", id), None).await;
    assert_eq!(body["status"], "processing");
    assert!(body["elapsed_secs"].is_number());
}

#[tokio::test]
async fn unknown_request_is_404() {
    let h = harness(10);
    let id = uuid::Uuid::new_v4();
    let (status, body) = send(&h.app, "GET", &format!("/v1/requests/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "request_not_found");
}

#[tokio::test]
async fn queue_stats_reflect_submissions() {
    let h = harness(10);
    for role in ["admin", "guest", "employee"] {
        send(&h.app, "POST", "/v1/requests", Some(submission("x", role))).await;
    }

    let (status, body) = send(&h.app, "GET", "/v1/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue_depth"], 3);
    assert_eq!(body["total_queued"], 3);
    assert_eq!(body["max_queue_size"], 10);
}

#[tokio::test]
async fn model_load_list_unload() {
    let h = harness(10);

    let (status, body) = send(&h.app, "POST", "/v1/models/llama/load?device=cpu", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["loaded"], true);
    assert!(h.models.is_loaded("llama"));

    let (_, body) = send(&h.app, "GET", "/v1/models", None).await;
    let llama = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == "llama")
        .unwrap();
    assert_eq!(llama["state"], "loaded");
    assert_eq!(body["loaded"]["llama"]["device"], "cpu");

    let (status, body) = send(&h.app, "DELETE", "/v1/models/llama", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unloaded"], true);
    assert!(!h.models.is_loaded("llama"));

    // Already gone: still OK, but nothing was unloaded
    let (status, body) = send(&h.app, "DELETE", "/v1/models/llama", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "llama");
    assert_eq!(body["unloaded"], false);
}

#[tokio::test]
async fn model_errors_map_to_status_codes() {
    let h = harness(10);

    let (status, body) = send(&h.app, "POST", "/v1/models/ghost/load", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "unknown_model");

    let (status, body) = send(&h.app, "POST", "/v1/models/broken/load", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["type"], "model_load_error");

    let (status, _) = send(&h.app, "POST", "/v1/models/llama/load?device=tpu", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A leased model can be neither unloaded nor evicted
    let lease = h
        .models
        .get_model("llama", Default::default())
        .await
        .unwrap();
    let (status, body) = send(&h.app, "DELETE", "/v1/models/llama", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "model_in_use");
    drop(lease);
}
