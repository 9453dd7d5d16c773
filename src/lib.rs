//! # Tasker
//!
//! A Redis-backed distributed task queue. Producers enqueue named tasks with
//! JSON arguments; any number of worker processes pull them and run the
//! handlers registered for each task type.
//!
//! ## Features
//!
//! - Regular and prioritized enqueueing on one shared list
//! - Delayed tasks coalesced by a unique identifier
//! - Worker heartbeats with eviction of dead peers
//! - Named distributed locks
//! - Idle/active reporting with per-period throughput
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde::Deserialize;
//! use tasker::{Engine, EngineConfig, HandlerRegistry, RedisBackend, StoreConfig};
//!
//! #[derive(Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! # async fn run() -> tasker::TaskResult<()> {
//! let store = StoreConfig::from_env()?;
//! let backend = Arc::new(RedisBackend::connect(&store).await?);
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register_fn("send_email", |args: SendEmail| async move {
//!     println!("sending to {}", args.to);
//!     Ok(())
//! });
//!
//! let engine = Engine::new(backend, store, handlers, EngineConfig::default()).await?;
//! engine.run_until_ctrl_c().await
//! # }
//! ```

pub mod activity;
pub mod backend;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod keys;
pub mod lock;
pub mod memory;
pub mod queue;
pub mod redis_backend;
pub mod scheduler;
pub mod task;
pub mod workers;

// Re-export commonly used types
pub use activity::{ActivePeriod, ActivityState, ActivityTracker};
pub use backend::{Backend, CompareDelete};
pub use client::TaskClient;
pub use config::StoreConfig;
pub use engine::{Engine, EngineConfig, ShutdownHandle};
pub use error::{TaskError, TaskResult};
pub use handler::{DispatchReport, FailurePolicy, HandlerRegistry, HandlerResult, TaskHandler};
pub use keys::KeyNamespace;
pub use lock::{LockConfig, LockManager, LockToken};
pub use memory::MemoryBackend;
pub use queue::TaskQueue;
pub use redis_backend::RedisBackend;
pub use scheduler::{DelayedScheduler, PromoteOutcome};
pub use task::{TaskData, TaskEnvelope, TaskKey};
pub use workers::{WorkerId, WorkerRegistry, WorkerSignature};

/// Version of the tasker library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
