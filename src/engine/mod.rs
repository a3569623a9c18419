//! The subscription engine: ingest, snapshots, deployment, scheduling.

mod deploy;
mod manager;
mod ticker;

pub use manager::{
    ChangeBatch, EngineConfig, EngineStats, SubscriptionEngine, DISCONNECT_AFTER_FAILURES,
    PROCESS_DELAY,
};
pub use ticker::Ticker;
