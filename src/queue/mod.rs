//! Admission queue and request lifecycle tracking
//!
//! [`QueueManager`] admits requests under a role-based priority policy,
//! hands them to workers in priority order, and records their terminal
//! outcome. Priority strictly dominates arrival time: a newly submitted
//! high-priority request overtakes every older lower-priority one. There is
//! no aging, so sustained high-priority load can starve lower classes.
//!
//! Timeouts are only enforced by [`QueueManager::recover_stale`] when the
//! manager starts; a request that hangs while the process stays up remains
//! in flight until the next restart.

mod request;
mod stats;

pub use request::{QueuedRequest, RequestId, RequestState, Role, StatusReport};
pub use stats::QueueStats;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{BerthError, Result};
use crate::store::{counters, QueueEntry, WorkStore};

/// What a worker reports back for a request
pub type Outcome = std::result::Result<Value, String>;

/// Summary of a start-up recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Claimed requests older than the timeout, now terminal
    pub timed_out: usize,
    /// Entries that were never started, back in the queue
    pub requeued: usize,
    /// Started recently enough to be left in flight
    pub still_in_flight: usize,
    /// Entries whose body could not be parsed; left untouched
    pub unreadable: usize,
}

/// Request admission queue and lifecycle tracker
pub struct QueueManager {
    store: Arc<dyn WorkStore>,
    config: QueueConfig,
    work_available: Notify,
}

impl QueueManager {
    /// Create a manager without running recovery
    pub fn new(store: Arc<dyn WorkStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            work_available: Notify::new(),
        }
    }

    /// Create a manager and resolve in-flight state left by a previous process
    pub async fn start(
        store: Arc<dyn WorkStore>,
        config: QueueConfig,
    ) -> Result<(Self, RecoveryReport)> {
        let manager = Self::new(store, config);
        let report = manager.recover_stale().await?;
        Ok((manager, report))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admit a request.
    ///
    /// The request's priority is the role priority plus `priority_boost`.
    /// Fails with `QueueFull` when the queue already holds `max_queue_size`
    /// requests.
    pub async fn enqueue(
        &self,
        submitter_id: &str,
        role: Role,
        kind: &str,
        payload: Value,
        priority_boost: i64,
    ) -> Result<RequestId> {
        let max = self.config.max_queue_size;
        if self.store.queue_len().await? >= max {
            return Err(BerthError::QueueFull { max });
        }

        let priority = self.config.priority_for(role).saturating_add(priority_boost);
        let sequence = self.store.next_sequence().await?;
        let request = QueuedRequest::new(submitter_id, role, priority, sequence, kind, payload);

        let entry = QueueEntry {
            key: request.key(),
            id: request.id.to_string(),
            body: request.to_json()?,
        };
        if !self
            .store
            .push_bounded(entry, max, &[(counters::QUEUED, 1)])
            .await?
        {
            return Err(BerthError::QueueFull { max });
        }

        info!(
            request_id = %request.id,
            submitter = submitter_id,
            role = %role,
            kind,
            priority,
            "Request queued"
        );
        self.work_available.notify_one();
        Ok(request.id)
    }

    /// Claim the highest-priority, oldest request.
    ///
    /// The store moves the entry into the in-flight set atomically, so two
    /// workers never claim the same request. The claim is then stamped with
    /// `started_at` and status `processing`.
    pub async fn dequeue_next(&self) -> Result<Option<QueuedRequest>> {
        let Some(entry) = self.store.claim_next().await? else {
            return Ok(None);
        };

        let mut request = QueuedRequest::from_json(&entry.body)?;
        if let Err(e) = request.advance(RequestState::Processing) {
            // left in flight; start-up recovery resolves it
            warn!(request_id = %entry.id, error = %e, "Claimed entry was not queued");
            return Err(e);
        }
        self.store
            .in_flight_update(&entry.id, request.to_json()?)
            .await?;

        debug!(request_id = %request.id, kind = %request.kind, "Request claimed");
        Ok(Some(request))
    }

    /// Persist progress on an in-flight request (e.g. a bumped retry count)
    pub async fn update_in_flight(&self, request: &QueuedRequest) -> Result<()> {
        let id = request.id.to_string();
        if self.store.in_flight_update(&id, request.to_json()?).await? {
            Ok(())
        } else {
            Err(BerthError::RequestNotFound(request.id))
        }
    }

    /// Record the outcome of an in-flight request and retire it.
    ///
    /// The request must be `processing`; anything else is an
    /// `InvalidTransition` and nothing is written. The terminal record and
    /// its counters are stored in one operation.
    pub async fn complete(&self, request: &QueuedRequest, outcome: Outcome) -> Result<()> {
        let mut record = request.clone();
        let counter = match outcome {
            Ok(result) => {
                record.advance(RequestState::Completed)?;
                record.result = Some(result);
                counters::COMPLETED
            }
            Err(message) => {
                record.advance(RequestState::Failed)?;
                record.error = Some(message);
                counters::FAILED
            }
        };
        let deltas = [
            (counter, 1),
            (counters::PROCESSING_MS, record.processing_ms().unwrap_or(0)),
        ];

        let id = request.id.to_string();
        let resolved = self
            .store
            .resolve_in_flight(&id, record.to_json()?, self.config.completed_ttl(), &deltas)
            .await?;
        if !resolved {
            warn!(request_id = %request.id, "Completion for a request that is not in flight");
            return Err(BerthError::RequestNotFound(request.id));
        }

        info!(
            request_id = %request.id,
            status = ?record.status,
            processing_ms = record.processing_ms().unwrap_or(0),
            "Request finished"
        );
        Ok(())
    }

    /// Current status of a request.
    ///
    /// Checks terminal records, then the in-flight set, then the queue. The
    /// queue lookup scans every queued entry to compute the position, which
    /// is O(n) in queue depth and acceptable up to `max_queue_size`.
    pub async fn get_status(&self, id: RequestId) -> Result<StatusReport> {
        let key = id.to_string();

        if let Some(body) = self.store.record_get(&key).await? {
            return Ok(StatusReport {
                request: QueuedRequest::from_json(&body)?,
                position: None,
                elapsed_secs: None,
            });
        }

        if let Some(body) = self.store.in_flight_get(&key).await? {
            let request = QueuedRequest::from_json(&body)?;
            let elapsed_secs = request
                .started_at
                .map(|started| (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0);
            return Ok(StatusReport {
                request,
                position: None,
                elapsed_secs,
            });
        }

        let queued = self.store.queue_entries().await?;
        if let Some((index, entry)) = queued.iter().enumerate().find(|(_, e)| e.id == key) {
            return Ok(StatusReport {
                request: QueuedRequest::from_json(&entry.body)?,
                position: Some(index + 1),
                elapsed_secs: None,
            });
        }

        Err(BerthError::RequestNotFound(id))
    }

    /// 1-based queue position, or None once the request has left the queue
    pub async fn get_queue_position(&self, id: RequestId) -> Result<Option<usize>> {
        let key = id.to_string();
        let queued = self.store.queue_entries().await?;
        if let Some(index) = queued.iter().position(|e| e.id == key) {
            return Ok(Some(index + 1));
        }

        if self.store.in_flight_get(&key).await?.is_some()
            || self.store.record_get(&key).await?.is_some()
        {
            return Ok(None);
        }
        Err(BerthError::RequestNotFound(id))
    }

    /// Cancel a request that is still waiting.
    ///
    /// Returns false if it is already in flight or finished; in-flight work
    /// always runs to completion.
    pub async fn cancel(&self, id: RequestId) -> Result<bool> {
        let key = id.to_string();

        if let Some(entry) = self.store.queue_get(&key).await? {
            let mut record = QueuedRequest::from_json(&entry.body)?;
            record.advance(RequestState::Cancelled)?;
            let cancelled = self
                .store
                .cancel_queued(
                    &key,
                    record.to_json()?,
                    self.config.completed_ttl(),
                    &[(counters::CANCELLED, 1)],
                )
                .await?;
            if cancelled {
                info!(request_id = %id, "Request cancelled");
                return Ok(true);
            }
            // claimed by a worker between the lookup and the removal
        }

        if self.store.in_flight_get(&key).await?.is_some()
            || self.store.record_get(&key).await?.is_some()
        {
            return Ok(false);
        }
        Err(BerthError::RequestNotFound(id))
    }

    /// Resolve in-flight entries left over from a previous process.
    ///
    /// Entries started longer ago than `request_timeout` become `timeout`
    /// records. Entries that were never stamped with `started_at` go back
    /// into the queue at their original key.
    pub async fn recover_stale(&self) -> Result<RecoveryReport> {
        let timeout = chrono::Duration::from_std(self.config.request_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for (id, body) in self.store.in_flight_entries().await? {
            let mut request = match QueuedRequest::from_json(&body) {
                Ok(request) => request,
                Err(e) => {
                    warn!(request_id = %id, error = %e, "Unreadable in-flight entry left in place");
                    report.unreadable += 1;
                    continue;
                }
            };

            match request.started_at {
                Some(started) if now - started > timeout => {
                    request.status = RequestState::Timeout;
                    request.completed_at = Some(now);
                    request.error = Some(format!(
                        "timed out after {}s in flight (recovered at start-up)",
                        self.config.request_timeout_secs
                    ));
                    let moved = self
                        .store
                        .resolve_in_flight(
                            &id,
                            request.to_json()?,
                            self.config.completed_ttl(),
                            &[(counters::TIMED_OUT, 1)],
                        )
                        .await?;
                    if moved {
                        warn!(request_id = %id, "Stale in-flight request timed out");
                        report.timed_out += 1;
                    }
                }
                Some(_) => report.still_in_flight += 1,
                None => {
                    request.status = RequestState::Queued;
                    let entry = QueueEntry {
                        key: request.key(),
                        id: id.clone(),
                        body: request.to_json()?,
                    };
                    if self.store.requeue_in_flight(entry).await? {
                        info!(request_id = %id, "Unstarted in-flight request re-queued");
                        report.requeued += 1;
                    }
                }
            }
        }

        if report.requeued > 0 {
            self.work_available.notify_waiters();
        }
        info!(
            timed_out = report.timed_out,
            requeued = report.requeued,
            still_in_flight = report.still_in_flight,
            "Start-up recovery finished"
        );
        Ok(report)
    }

    /// Depth, in-flight count and lifetime counters
    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let counter_map = self.store.counters().await?;
        Ok(QueueStats::from_counters(
            &counter_map,
            self.store.queue_len().await?,
            self.store.in_flight_len().await?,
            self.config.max_queue_size,
        ))
    }

    /// Requests currently claimed by workers
    pub async fn in_flight(&self) -> Result<Vec<QueuedRequest>> {
        let mut requests = Vec::new();
        for (_, body) in self.store.in_flight_entries().await? {
            requests.push(QueuedRequest::from_json(&body)?);
        }
        Ok(requests)
    }

    /// Waiting requests in dequeue order
    pub async fn queued(&self) -> Result<Vec<QueuedRequest>> {
        let mut requests = Vec::new();
        for entry in self.store.queue_entries().await? {
            requests.push(QueuedRequest::from_json(&entry.body)?);
        }
        Ok(requests)
    }

    /// Wait until something is enqueued or `timeout` passes
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.work_available.notified()).await;
    }
}
