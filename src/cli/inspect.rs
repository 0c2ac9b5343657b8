//! Inspect command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;

use crate::config::BerthConfig;
use crate::queue::{QueueManager, QueueStats, QueuedRequest};
use crate::store::MemoryStore;

#[derive(Serialize)]
struct Inspection {
    stats: QueueStats,
    in_flight: Vec<QueuedRequest>,
    queued: Vec<QueuedRequest>,
}

/// Print queue state from the snapshot file without running recovery
pub async fn inspect(config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let config = BerthConfig::load(config_path.as_deref())?;
    let Some(path) = config.store.snapshot_path.clone() else {
        bail!("store.snapshot_path is not configured; nothing to inspect");
    };
    if !path.exists() {
        println!("No snapshot at {} yet.", path.display());
        return Ok(());
    }

    let store = Arc::new(MemoryStore::open(&path)?);
    let queue = QueueManager::new(store, config.queue.clone());
    let inspection = Inspection {
        stats: queue.get_queue_stats().await?,
        in_flight: queue.in_flight().await?,
        queued: queue.queued().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
        return Ok(());
    }

    let stats = &inspection.stats;
    println!("Queue ({}):", path.display());
    println!(
        "  Depth: {}/{} ({:.0}%)",
        stats.queue_depth,
        stats.max_queue_size,
        stats.utilization() * 100.0
    );
    println!("  In flight: {}", stats.in_flight);
    println!(
        "  Totals: queued {}, completed {}, failed {}, cancelled {}, timed out {}",
        stats.total_queued,
        stats.total_completed,
        stats.total_failed,
        stats.total_cancelled,
        stats.total_timeout
    );
    println!("  Avg processing: {:.1} ms", stats.avg_processing_ms);

    if !inspection.in_flight.is_empty() {
        println!("\nIn flight:");
        let now = Utc::now();
        for request in &inspection.in_flight {
            let running = request
                .started_at
                .map(|started| format!("{}s", (now - started).num_seconds()))
                .unwrap_or_else(|| "not started".to_string());
            println!(
                "  {} {} [{}] priority {} running {} retries {}",
                request.id, request.kind, request.role, request.priority, running, request.retry_count
            );
        }
    }

    if !inspection.queued.is_empty() {
        println!("\nQueued:");
        for (index, request) in inspection.queued.iter().enumerate() {
            println!(
                "  {:>3}. {} {} [{}] priority {}",
                index + 1,
                request.id,
                request.kind,
                request.role,
                request.priority
            );
        }
    }

    Ok(())
}
