//! Request records and the role priority table

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::QueueKey;

/// Unique identifier for a queued request
pub type RequestId = Uuid;

/// Submitter role. Each role maps to a priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Employee,
    Guest,
}

impl Role {
    /// Built-in priority, used unless the config overrides it
    pub fn default_priority(&self) -> i64 {
        match self {
            Role::Admin => 100,
            Role::Manager => 75,
            Role::Employee => 50,
            Role::Guest => 10,
        }
    }

    /// Parse a role name, admitting anything unrecognised as `Guest`
    /// (the lowest class).
    pub fn lenient(name: &str) -> Role {
        name.parse().unwrap_or_else(|_| {
            tracing::debug!(role = name, "Unknown role, admitting as guest");
            Role::Guest
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Employee => "employee",
            Role::Guest => "guest",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "employee" | "user" => Ok(Role::Employee),
            "guest" => Ok(Role::Guest),
            other => Err(format!("unknown role: '{}'", other)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a request.
///
/// `queued -> processing -> {completed | failed | timeout}` or
/// `queued -> cancelled`. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Failed
                | RequestState::Timeout
                | RequestState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        match (self, next) {
            (RequestState::Queued, RequestState::Processing)
            | (RequestState::Queued, RequestState::Cancelled) => true,
            (RequestState::Processing, next) => {
                matches!(
                    next,
                    RequestState::Completed | RequestState::Failed | RequestState::Timeout
                )
            }
            _ => false,
        }
    }
}

/// A unit of work as persisted in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub submitter_id: String,
    pub role: Role,
    /// Role priority plus any boost supplied at submission
    pub priority: i64,
    /// Arrival order assigned by the store
    pub sequence: u64,
    /// Free-form tag such as "chat" or "report"
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RequestState,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl QueuedRequest {
    pub fn new(
        submitter_id: impl Into<String>,
        role: Role,
        priority: i64,
        sequence: u64,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter_id: submitter_id.into(),
            role,
            priority,
            sequence,
            kind: kind.into(),
            payload,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: RequestState::Queued,
            retry_count: 0,
            error: None,
            result: None,
        }
    }

    /// Position key in the queue
    pub fn key(&self) -> QueueKey {
        QueueKey::new(self.priority, self.sequence)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }

    /// Model explicitly requested in the payload, if any
    pub fn requested_model(&self) -> Option<&str> {
        self.payload.get("model").and_then(Value::as_str)
    }

    /// Milliseconds between claim and completion
    pub fn processing_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }

    /// Apply a state transition, stamping the matching timestamp.
    /// Illegal transitions leave the request untouched and return false.
    #[must_use]
    pub fn transition(&mut self, next: RequestState) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            RequestState::Processing => self.started_at = Some(now),
            _ => self.completed_at = Some(now),
        }
        self.status = next;
        true
    }

    /// Like [`transition`](Self::transition), but an illegal move is an error
    pub fn advance(&mut self, next: RequestState) -> crate::error::Result<()> {
        let from = self.status;
        if self.transition(next) {
            Ok(())
        } else {
            Err(crate::error::BerthError::InvalidTransition {
                id: self.id,
                from,
                to: next,
            })
        }
    }
}

/// Answer to a status query
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub request: QueuedRequest,
    /// 1-based position while queued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Seconds spent processing so far while in flight
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_parse() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("user".parse::<Role>().unwrap(), Role::Employee);
        assert!("root".parse::<Role>().is_err());
        assert_eq!(Role::lenient("root"), Role::Guest);
    }

    #[test]
    fn test_role_priorities_are_ordered() {
        assert!(Role::Admin.default_priority() > Role::Manager.default_priority());
        assert!(Role::Manager.default_priority() > Role::Employee.default_priority());
        assert!(Role::Employee.default_priority() > Role::Guest.default_priority());
    }

    #[test]
    fn test_state_machine() {
        let mut request = QueuedRequest::new("u1", Role::Guest, 10, 1, "chat", json!({}));
        assert!(!request.transition(RequestState::Completed));
        assert!(request.transition(RequestState::Processing));
        assert!(request.started_at.is_some());
        assert!(!request.transition(RequestState::Cancelled));
        assert!(request.transition(RequestState::Failed));
        assert!(request.status.is_terminal());
        assert!(!request.transition(RequestState::Processing));
        assert_eq!(request.status, RequestState::Failed);
    }

    #[test]
    fn test_advance_rejects_illegal_moves() {
        let mut request = QueuedRequest::new("u1", Role::Guest, 10, 1, "chat", json!({}));
        let err = request.advance(RequestState::Completed).unwrap_err();
        assert!(matches!(
            err,
            crate::error::BerthError::InvalidTransition {
                from: RequestState::Queued,
                to: RequestState::Completed,
                ..
            }
        ));
        assert_eq!(request.status, RequestState::Queued);
        assert!(request.completed_at.is_none());

        request.advance(RequestState::Processing).unwrap();
        assert_eq!(request.status, RequestState::Processing);
    }

    #[test]
    fn test_durable_form_round_trip() {
        let request = QueuedRequest::new(
            "u7",
            Role::Manager,
            80,
            42,
            "report",
            json!({"model": "mistral", "sections": ["a", "b"]}),
        );
        let body = request.to_json().unwrap();
        let parsed = QueuedRequest::from_json(&body).unwrap();

        assert_eq!(parsed.id, request.id);
        assert_eq!(parsed.payload, request.payload);
        assert_eq!(parsed.key(), request.key());
        assert_eq!(parsed.requested_model(), Some("mistral"));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let body = json!({
            "id": Uuid::nil(),
            "submitter_id": "u1",
            "role": "guest",
            "priority": 10,
            "sequence": 3,
            "kind": "chat",
            "payload": null,
            "created_at": "2026-01-01T00:00:00Z",
            "status": "processing"
        })
        .to_string();
        let parsed = QueuedRequest::from_json(&body).unwrap();
        assert!(parsed.started_at.is_none());
        assert_eq!(parsed.retry_count, 0);
    }
}
