//! vetsync-core: offline-first medication administration sync
//!
//! Recording a dose must never wait on the network. The client side queues
//! every action durably and drains it when connectivity allows; the server
//! side applies each action at most once and protects a connection-limited
//! store from reconnection bursts.
//!
//! # Architecture
//!
//! ```text
//! UI action → MutationQueueStore (KvStore) → SyncEngine ──transport──┐
//!                    ↑                           ↑                  │
//!              status badge            ConnectivityMonitor          │
//!                                                                   ↓
//!   POST /v1/mutations → RateLimiter → CircuitBreaker → Admission → Ledger + BackingStore
//! ```
//!
//! # Modules
//!
//! - `mutation`: mutation kinds, typed payloads, queued records
//! - `kv_store`: durable key-value interface (memory and SQLite)
//! - `mutation_queue`: ordered, reload-surviving queue
//! - `connectivity`: online/offline signal
//! - `retry`: backoff policy
//! - `transport`: HTTP and in-process delivery
//! - `sync_engine`: the drain loop
//! - `ledger`: idempotency ledger
//! - `backing_store`: administrations and inventory
//! - `circuit_breaker`, `token_bucket`, `rate_limiter`, `admission`,
//!   `priority`, `resilience`: the server resilience layer
//! - `service`: submission pipeline
//! - `web`: axum HTTP surface
//! - `wire`: JSON contract
//! - `config`, `logging`, `error`: ambient stack
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod admission;
pub mod backing_store;
pub mod circuit_breaker;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod kv_store;
pub mod ledger;
pub mod logging;
pub mod mutation;
pub mod mutation_queue;
pub mod priority;
pub mod rate_limiter;
pub mod resilience;
pub mod retry;
pub mod service;
pub mod sync_engine;
pub mod token_bucket;
pub mod transport;
pub mod web;
pub mod wire;

pub use error::{Error, Result};

/// Version of the vetsync-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
