//! Durable work store abstraction
//!
//! The queue manager never touches storage directly. It talks to a
//! [`WorkStore`], which exposes the handful of sorted-set, hash and
//! expiring-key operations the request lifecycle needs. Every method that
//! moves a request between representations (queue, in-flight, terminal
//! record) is a single atomic store operation, so a request id is never
//! visible in two places at once.

mod memory;

pub use memory::MemoryStore;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Counter names kept under the `metrics` key
pub mod counters {
    pub const QUEUED: &str = "total_queued";
    pub const COMPLETED: &str = "total_completed";
    pub const FAILED: &str = "total_failed";
    pub const CANCELLED: &str = "total_cancelled";
    pub const TIMED_OUT: &str = "total_timeout";
    pub const PROCESSING_MS: &str = "total_processing_ms";
}

/// Ordering key of a queued request.
///
/// Higher `priority` sorts first; within a priority, lower `sequence`
/// (earlier arrival) sorts first. The sequence comes from the store's own
/// monotonic counter, so ordering survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub priority: i64,
    pub sequence: u64,
}

impl QueueKey {
    pub fn new(priority: i64, sequence: u64) -> Self {
        Self { priority, sequence }
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A serialized request sitting in the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: QueueKey,
    pub id: String,
    pub body: String,
}

/// Counter increments applied in the same operation as a move
pub type CounterDeltas<'a> = &'a [(&'a str, i64)];

/// Backend holding the queue, the in-flight set, terminal records and counters.
///
/// The moving operations take the counter increments that go with them, so
/// a move and its bookkeeping land (or fail) together.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Next value of the arrival counter
    async fn next_sequence(&self) -> Result<u64>;

    /// Insert into the queue unless it already holds `max_len` entries.
    /// Returns false when rejected, in which case no counter moves.
    async fn push_bounded(
        &self,
        entry: QueueEntry,
        max_len: usize,
        counters: CounterDeltas<'_>,
    ) -> Result<bool>;

    async fn queue_len(&self) -> Result<usize>;

    /// Look up a queued entry by request id
    async fn queue_get(&self, id: &str) -> Result<Option<QueueEntry>>;

    /// All queued entries, head first
    async fn queue_entries(&self) -> Result<Vec<QueueEntry>>;

    /// Pop the head of the queue and file it under `in_flight`, unchanged.
    async fn claim_next(&self) -> Result<Option<QueueEntry>>;

    /// Remove `id` from the queue and write its terminal record, only if it
    /// is still queued.
    async fn cancel_queued(
        &self,
        id: &str,
        record: String,
        ttl: Duration,
        counters: CounterDeltas<'_>,
    ) -> Result<bool>;

    async fn in_flight_get(&self, id: &str) -> Result<Option<String>>;

    /// Overwrite the body of an existing in-flight entry. Returns false if
    /// `id` is not in flight.
    async fn in_flight_update(&self, id: &str, body: String) -> Result<bool>;

    async fn in_flight_entries(&self) -> Result<Vec<(String, String)>>;

    async fn in_flight_len(&self) -> Result<usize>;

    /// Move an in-flight entry to its terminal record.
    async fn resolve_in_flight(
        &self,
        id: &str,
        record: String,
        ttl: Duration,
        counters: CounterDeltas<'_>,
    ) -> Result<bool>;

    /// Move an in-flight entry back into the queue.
    async fn requeue_in_flight(&self, entry: QueueEntry) -> Result<bool>;

    /// Terminal record for `id`, if present and not expired
    async fn record_get(&self, id: &str) -> Result<Option<String>>;

    async fn counters(&self) -> Result<BTreeMap<String, i64>>;
}
