//! Error taxonomy shared by the queue and the model lifecycle manager.

use thiserror::Error;
use uuid::Uuid;

use crate::queue::RequestState;

/// Result alias used by the core managers
pub type Result<T> = std::result::Result<T, BerthError>;

/// Errors surfaced by berth's managers
#[derive(Debug, Error)]
pub enum BerthError {
    /// Admission rejected: the queue is at its configured depth
    #[error("queue is full ({max} requests waiting)")]
    QueueFull { max: usize },

    /// Model name missing from the registry
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Underlying load failed; the model stays unloaded
    #[error("failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    /// Model is leased or mid-load and cannot be unloaded right now
    #[error("model '{0}' is in use")]
    ModelInUse(String),

    /// Every resident model is leased, so no slot can be freed
    #[error("no evictable model for '{requested}': all {capacity} slots are in use")]
    NoEvictableModel { requested: String, capacity: usize },

    #[error("request not found: {0}")]
    RequestNotFound(Uuid),

    /// The request's state machine forbids the move
    #[error("request {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: RequestState,
        to: RequestState,
    },

    /// Durable backend unreachable or failed an operation
    #[error("work store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BerthError {
    /// HTTP status code used by the control plane
    pub fn status_code(&self) -> u16 {
        match self {
            BerthError::QueueFull { .. } => 503,
            BerthError::UnknownModel(_) | BerthError::RequestNotFound(_) => 404,
            BerthError::ModelInUse(_)
            | BerthError::NoEvictableModel { .. }
            | BerthError::InvalidTransition { .. } => 409,
            BerthError::StoreUnavailable(_) => 503,
            BerthError::ModelLoad { .. } | BerthError::Serialization(_) => 500,
        }
    }

    /// Short machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            BerthError::QueueFull { .. } => "queue_full",
            BerthError::UnknownModel(_) => "unknown_model",
            BerthError::ModelLoad { .. } => "model_load_error",
            BerthError::ModelInUse(_) => "model_in_use",
            BerthError::NoEvictableModel { .. } => "no_evictable_model",
            BerthError::RequestNotFound(_) => "request_not_found",
            BerthError::InvalidTransition { .. } => "invalid_transition",
            BerthError::StoreUnavailable(_) => "store_unavailable",
            BerthError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<std::io::Error> for BerthError {
    fn from(err: std::io::Error) -> Self {
        BerthError::StoreUnavailable(err.to_string())
    }
}
