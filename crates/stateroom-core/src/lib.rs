//! stateroom-core: stateful session-instance container
//!
//! This crate manages the lifecycle of stateful, conversational server-side
//! components identified by a per-client session key. Each session is bound
//! to exactly one component instance across calls; the container tracks
//! which instances are checked out for in-flight calls, evicts idle
//! instances under memory pressure (with reversible serialization), honors
//! per-session idle timeouts, and respects transactional affinity.
//!
//! # Architecture
//!
//! ```text
//! transport (out of tree)
//!        ↓
//!   Dispatcher ──── TransactionPolicy ──── TransactionCoordinator
//!        ↓
//!   InstancePool ── eviction queue (LRU, bulk passivation)
//!        ↓
//!   PassivationStore (memory / JSON files / embedder-provided)
//! ```
//!
//! # Modules
//!
//! - `session`: session keys and the component lifecycle contract
//! - `pool`: the bounded instance pool and its eviction state machine
//! - `passivation`: persist/restore bridge for evicted sessions
//! - `transaction`: coordinator surface and the invocation policies
//! - `dispatch`: call sequencing and the client-facing fault surface
//! - `config`: container tuning knobs (TOML-loadable)
//! - `logging`: opt-in tracing subscriber setup
//! - `error`: the error taxonomy
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stateroom_core::config::ContainerConfig;
//! use stateroom_core::dispatch::Dispatcher;
//! use stateroom_core::passivation::MemoryStore;
//! use stateroom_core::pool::InstancePool;
//! use stateroom_core::session::SessionComponent;
//! use stateroom_core::transaction::NullPolicy;
//!
//! #[derive(Default)]
//! struct Counter {
//!     hits: u64,
//! }
//! impl SessionComponent for Counter {}
//!
//! let pool = Arc::new(InstancePool::new(
//!     ContainerConfig::default(),
//!     MemoryStore::new(),
//! ));
//! let dispatcher = Dispatcher::new(pool, Counter::default, Box::new(NullPolicy));
//!
//! let (key, _) = dispatcher.create(|_| Ok::<_, String>(())).unwrap();
//! let hits = dispatcher
//!     .invoke(&key, |counter| {
//!         counter.hits += 1;
//!         Ok::<_, String>(counter.hits)
//!     })
//!     .unwrap();
//! assert_eq!(hits, 1);
//! ```
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod passivation;
pub mod pool;
pub mod session;
pub mod transaction;

pub use config::ContainerConfig;
pub use dispatch::Dispatcher;
pub use error::{CallbackError, Error, Fault, PoolError, Result, StoreError, TxError};
pub use passivation::{JsonFileStore, MemoryStore, PassivatedSession, PassivationStore};
pub use pool::{AncillaryAccess, AncillaryState, InstancePool, PoolStats, SharedInstance};
pub use session::{ComponentFactory, SessionComponent, SessionKey};
pub use transaction::{
    BeanManagedPolicy, ContainerManagedPolicy, LocalCoordinator, NullPolicy,
    TransactionCoordinator, TransactionHandle, TransactionPolicy, TxStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
