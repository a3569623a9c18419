//! # Trust Relay
//!
//! A change-event subscription and delivery engine for a trust graph.
//! Clients subscribe to streams of identities, trust edges, or score values
//! and receive an initial consistent snapshot followed by a strictly ordered
//! sequence of incremental change events.
//!
//! ## Core Concepts
//!
//! - **Streams**: identities, trusts, and scores; one subscription per
//!   stream per client
//! - **Snapshots**: `Begin(v)` / `Changed*` / `End(v)` blocks carrying a
//!   version id for mark-and-sweep reconciliation on the client
//! - **Queues**: one durable, index-ordered notification queue per client,
//!   preserving causal order across stream types
//! - **Deployment**: a ticker-scheduled worker flushes queues over a
//!   synchronous transport, one committed transaction per notification,
//!   with a retry budget and forced disconnect
//!
//! ## Example
//!
//! ```ignore
//! use trust_relay::{CancelToken, EngineConfig, StreamType, SubscriptionEngine, TransportId};
//!
//! let engine = Arc::new(SubscriptionEngine::new(
//!     EngineConfig { path: Some("./relay".into()), ..Default::default() },
//!     graph,
//!     transport,
//! )?);
//! engine.start()?;
//!
//! // A client subscribes and gets a full snapshot plus live updates.
//! let subscription = engine.subscribe(client_id, StreamType::Identities, &CancelToken::new())?;
//!
//! // The producer feeds change events under its write lock.
//! let mut graph = engine.graph().write();
//! let old = graph.put_identity(updated.clone());
//! let mut batch = engine.change_batch();
//! batch.identity_changed(old.as_ref(), Some(&updated))?;
//! batch.commit()?;
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod repo;
pub mod testing;
pub mod transport;
pub mod types;

// Re-exports
pub use engine::{
    ChangeBatch, EngineConfig, EngineStats, SubscriptionEngine, Ticker,
    DISCONNECT_AFTER_FAILURES, PROCESS_DELAY,
};
pub use error::{RelayError, Result};
pub use graph::{EventSource, GraphReader, Identity, Score, Trust};
pub use repo::{
    ClientRecord, NotificationBody, NotificationRecord, Repository, SubscriptionRecord,
};
pub use transport::{CancelToken, SyncKind, Transport, TransportError};
pub use types::{StreamType, SubscriptionId, TransportId, VersionId};
