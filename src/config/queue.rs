//! Admission queue settings

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::Role;

/// Queue and request lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of requests waiting for a worker
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Age after which an in-flight request is timed out by start-up recovery
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retries after the first failed model acquisition before the request
    /// fails; a worker makes at most `max_retries + 1` attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Retention of completed/failed/cancelled records
    #[serde(default = "default_completed_ttl")]
    pub completed_ttl_secs: u64,

    /// Per-role priority overrides (higher = dequeued first)
    #[serde(default)]
    pub role_priorities: BTreeMap<Role, i64>,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_request_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_retries() -> u32 {
    3
}

fn default_completed_ttl() -> u64 {
    3600 // 1 hour
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            completed_ttl_secs: default_completed_ttl(),
            role_priorities: BTreeMap::new(),
        }
    }
}

impl QueueConfig {
    /// Priority for a role, falling back to the role's built-in value
    pub fn priority_for(&self, role: Role) -> i64 {
        self.role_priorities
            .get(&role)
            .copied()
            .unwrap_or_else(|| role.default_priority())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }
}
