//! Berth - priority admission and model residency for inference backends
//!
//! Berth sits in front of a GPU-constrained inference backend and decides
//! two things: which request runs next, and which models stay in memory.
//!
//! # Architecture
//!
//! - **queue**: role-prioritized admission queue with a durable request
//!   lifecycle (queued, processing, terminal) and start-up recovery
//! - **store**: the durable work store the queue runs on
//! - **lifecycle**: fixed-capacity model pool with priority/LRU eviction,
//!   leases and an idle reaper
//! - **worker**: loops that join the two, plus the executor seam
//! - **server** / **cli**: HTTP control plane and the `berth` binary
//!
//! # Example
//!
//! ```bash
//! # Run workers and the control plane
//! berth serve --config berth.yaml
//!
//! # Check registered models
//! berth models --verbose
//!
//! # Look at a stopped instance's queue
//! berth inspect --config berth.yaml
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod server;
pub mod store;
pub mod worker;

// Re-export key types
pub use config::{BerthConfig, ServerConfig};
pub use error::{BerthError, Result};
pub use lifecycle::{LoadOptions, ModelLease, ModelLoader, ModelManager, PoolSettings};
pub use queue::{QueueManager, QueuedRequest, RequestState, Role};
pub use registry::{ModelDescriptor, ModelRegistry};
pub use store::{MemoryStore, WorkStore};
pub use worker::{InferenceExecutor, Worker, WorkerPool};
