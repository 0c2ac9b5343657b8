//! Worker loop settings

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops
    #[serde(default = "default_count")]
    pub count: usize,

    /// How long an idle worker sleeps before polling the queue again
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Model used when neither the payload nor `kind_models` names one
    #[serde(default)]
    pub default_model: Option<String>,

    /// Request kind -> model name
    #[serde(default)]
    pub kind_models: HashMap<String, String>,

    /// First backoff between model acquisition retries (doubles each attempt)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_count() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    500
}

fn default_retry_backoff() -> u64 {
    250
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            poll_interval_ms: default_poll_interval(),
            default_model: None,
            kind_models: HashMap::new(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
