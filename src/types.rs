//! Core identifier types for the relay engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque handle of a client's outbound channel.
///
/// Unique across connected clients. Handles are ephemeral: a restart of the
/// engine invalidates all of them, which is why startup wipes every persisted
/// client.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportId(pub Uuid);

impl TransportId {
    pub fn random() -> Self {
        TransportId(Uuid::new_v4())
    }
}

impl fmt::Debug for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportId({})", self.0)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier of a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn random() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version stamp minted per snapshot.
///
/// Every entity clone inside one snapshot carries the same version id, as do
/// the enclosing `Begin`/`End` markers. Clients use it for mark-and-sweep
/// reconciliation: after `End(v)`, any locally cached object whose stored
/// version differs from `v` is obsolete.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId(pub Uuid);

impl VersionId {
    pub fn random() -> Self {
        VersionId(Uuid::new_v4())
    }
}

impl fmt::Debug for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionId({})", self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The class of entity a subscription observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Identities,
    Trusts,
    Scores,
}

impl StreamType {
    /// All stream types, in causal emission order.
    pub const ALL: [StreamType; 3] = [
        StreamType::Identities,
        StreamType::Trusts,
        StreamType::Scores,
    ];
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamType::Identities => "identities",
            StreamType::Trusts => "trusts",
            StreamType::Scores => "scores",
        };
        write!(f, "{}", name)
    }
}
