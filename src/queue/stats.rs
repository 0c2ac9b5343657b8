//! Queue statistics derived from store counters

use std::collections::BTreeMap;

use serde::Serialize;

use crate::store::counters;

/// Snapshot of queue depth and lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub max_queue_size: usize,
    pub total_queued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_timeout: u64,
    /// Mean processing time over completed and failed requests
    pub avg_processing_ms: f64,
}

impl QueueStats {
    pub(crate) fn from_counters(
        counter_map: &BTreeMap<String, i64>,
        queue_depth: usize,
        in_flight: usize,
        max_queue_size: usize,
    ) -> Self {
        let get = |name: &str| counter_map.get(name).copied().unwrap_or(0).max(0) as u64;

        let total_completed = get(counters::COMPLETED);
        let total_failed = get(counters::FAILED);
        let finished = total_completed + total_failed;
        let avg_processing_ms = if finished > 0 {
            get(counters::PROCESSING_MS) as f64 / finished as f64
        } else {
            0.0
        };

        Self {
            queue_depth,
            in_flight,
            max_queue_size,
            total_queued: get(counters::QUEUED),
            total_completed,
            total_failed,
            total_cancelled: get(counters::CANCELLED),
            total_timeout: get(counters::TIMED_OUT),
            avg_processing_ms,
        }
    }

    /// Fraction of queue capacity in use
    pub fn utilization(&self) -> f64 {
        if self.max_queue_size == 0 {
            return 0.0;
        }
        self.queue_depth as f64 / self.max_queue_size as f64
    }
}
