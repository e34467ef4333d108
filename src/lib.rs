//! linemq - topic/line message queue engine.
//!
//! Producers push payloads to named topics. Each topic has any number of
//! independent consumer groups ("lines") that pop messages with
//! at-least-once delivery: a popped message that is not confirmed within the
//! line's recycle duration is handed out again.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Front ends (HTTP, memcached, redis)             │
//! │            create │ push │ pop "topic/line" │ confirm            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          QueueEngine                            │
//! │    Topics (id counter) │ Lines (cursor, in-flight, retry)      │
//! │    Recycle scheduler   │ Cluster coordinator handle             │
//! └─────────────────────────────────────────────────────────────────┘
//!                 │                                 │
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │     KvStore                   │ │     CoordinationService       │
//! │  LogStore (WAL) │ MemoryStore │ │  etcd │ in-memory             │
//! └───────────────────────────────┘ └───────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core`] - configuration, errors, time and the node runtime
//! - [`storage`] - ordered key-value contract and its two backends
//! - [`queue`] - topics, lines, recycle scheduler and [`queue::QueueEngine`]
//! - [`cluster`] - node registration and peer discovery
//! - [`cli`] - command-line interface
//!
//! # Example
//!
//! ```no_run
//! use linemq::queue::{ConfirmRequest, CreateRequest, EngineOptions, QueueEngine};
//! use linemq::storage::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let engine = QueueEngine::open(Arc::new(MemoryStore::new()), EngineOptions::default())?;
//! engine.start_recycler()?;
//! engine.create(&CreateRequest::topic("orders"))?;
//! engine.create(&CreateRequest::line("orders", "billing", Duration::from_secs(30)))?;
//!
//! engine.push("orders", b"order #1")?;
//! let message = engine.pop("orders/billing")?;
//! engine.confirm(&ConfirmRequest::new("orders", "billing", message.id))?;
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod cluster;
pub mod core;
pub mod queue;
pub mod storage;

pub use self::core::{config, error, runtime, time};
pub use queue::{ConfirmRequest, CreateRequest, Message, QueueEngine};
