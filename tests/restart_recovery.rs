//! Queue state across a simulated crash, using the snapshot-backed store

use std::sync::Arc;

use serde_json::json;

use berth::config::QueueConfig;
use berth::queue::{QueueManager, RequestState, Role};
use berth::store::{MemoryStore, WorkStore};

#[tokio::test]
async fn queued_requests_survive_restart_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let (guest, admin) = {
        let store = Arc::new(MemoryStore::open(&path).unwrap());
        let (queue, _) = QueueManager::start(store, QueueConfig::default()).await.unwrap();
        let guest = queue
            .enqueue("g", Role::Guest, "chat", json!({}), 0)
            .await
            .unwrap();
        let admin = queue
            .enqueue("a", Role::Admin, "chat", json!({}), 0)
            .await
            .unwrap();
        (guest, admin)
    };

    let store = Arc::new(MemoryStore::open(&path).unwrap());
    let (queue, report) = QueueManager::start(store, QueueConfig::default()).await.unwrap();
    assert_eq!(report.requeued, 0);

    assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, admin);
    assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, guest);

    // Sequence numbers keep increasing after a restart
    let later = queue
        .enqueue("g2", Role::Guest, "chat", json!({}), 0)
        .await
        .unwrap();
    let status = queue.get_status(later).await.unwrap();
    assert_eq!(status.request.sequence, 3);
}

#[tokio::test]
async fn stale_in_flight_work_times_out_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = QueueConfig {
        request_timeout_secs: 0,
        ..Default::default()
    };

    let id = {
        let store = Arc::new(MemoryStore::open(&path).unwrap());
        let queue = QueueManager::new(store, config.clone());
        let id = queue
            .enqueue("u", Role::Employee, "report", json!({}), 0)
            .await
            .unwrap();
        // Claimed, then the process dies before completing it
        queue.dequeue_next().await.unwrap().unwrap();
        id
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let store = Arc::new(MemoryStore::open(&path).unwrap());
    let (queue, report) = QueueManager::start(store.clone(), config).await.unwrap();
    assert_eq!(report.timed_out, 1);
    assert_eq!(store.in_flight_len().await.unwrap(), 0);

    let status = queue.get_status(id).await.unwrap();
    assert_eq!(status.request.status, RequestState::Timeout);
    assert!(status.request.completed_at.is_some());
    assert_eq!(queue.get_queue_stats().await.unwrap().total_timeout, 1);
}

#[tokio::test]
async fn recent_in_flight_work_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let id = {
        let store = Arc::new(MemoryStore::open(&path).unwrap());
        let queue = QueueManager::new(store, QueueConfig::default());
        let id = queue
            .enqueue("u", Role::Manager, "chat", json!({}), 0)
            .await
            .unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        id
    };

    let store = Arc::new(MemoryStore::open(&path).unwrap());
    let (queue, report) = QueueManager::start(store, QueueConfig::default()).await.unwrap();
    assert_eq!(report.still_in_flight, 1);
    assert_eq!(
        queue.get_status(id).await.unwrap().request.status,
        RequestState::Processing
    );
}
