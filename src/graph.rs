//! Trust-graph entities and the producer-side read interface.
//!
//! The trust-graph store itself lives outside this crate. The engine only
//! needs three things from it: the ability to list every current entity of a
//! stream (for snapshots), cheap deep copies of entities, and a version-id
//! slot on each copy. Entities serialize to self-contained byte payloads so
//! queued notifications never reference live graph state.

use crate::error::{RelayError, Result};
use crate::types::VersionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An entity that can be observed through a subscription.
///
/// `id()` is stable across the entity's lifetime; the version id changes with
/// every snapshot the entity appears in and is never set on the producer's
/// own instance, only on clones.
pub trait EventSource: Clone + Serialize + DeserializeOwned {
    /// Permanent unique identifier of this entity within its stream.
    fn id(&self) -> String;

    /// Version stamp of the snapshot this copy belongs to, if any.
    fn version_id(&self) -> Option<VersionId>;

    /// Binds this copy to a snapshot.
    fn set_version_id(&mut self, version: VersionId);
}

/// A participant in the trust graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique identity id (derived from its public key by the producer).
    pub id: String,
    /// Human-readable name, not necessarily unique.
    pub nickname: String,
    /// Whether this identity publishes a trust list of its own.
    pub publishes_trust_list: bool,
    /// Snapshot version stamp. `None` outside snapshots.
    pub version_id: Option<VersionId>,
}

impl EventSource for Identity {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn version_id(&self) -> Option<VersionId> {
        self.version_id
    }

    fn set_version_id(&mut self, version: VersionId) {
        self.version_id = Some(version);
    }
}

/// A directed trust edge between two identities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trust {
    /// Identity id of the truster.
    pub truster: String,
    /// Identity id of the trustee.
    pub trustee: String,
    /// Trust value in `-100..=100`.
    pub value: i8,
    /// Free-form comment attached by the truster.
    pub comment: String,
    /// Snapshot version stamp. `None` outside snapshots.
    pub version_id: Option<VersionId>,
}

impl EventSource for Trust {
    fn id(&self) -> String {
        format!("{}@{}", self.truster, self.trustee)
    }

    fn version_id(&self) -> Option<VersionId> {
        self.version_id
    }

    fn set_version_id(&mut self, version: VersionId) {
        self.version_id = Some(version);
    }
}

/// A computed score of a trustee from the perspective of a truster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    /// Identity id of the own identity whose view this score represents.
    pub truster: String,
    /// Identity id of the rated identity.
    pub trustee: String,
    /// Computed score value.
    pub value: i32,
    /// Distance from the truster in trust steps.
    pub rank: i32,
    /// How much weight the trustee's own trust list carries.
    pub capacity: i32,
    /// Snapshot version stamp. `None` outside snapshots.
    pub version_id: Option<VersionId>,
}

impl EventSource for Score {
    fn id(&self) -> String {
        format!("{}@{}", self.truster, self.trustee)
    }

    fn version_id(&self) -> Option<VersionId> {
        self.version_id
    }

    fn set_version_id(&mut self, version: VersionId) {
        self.version_id = Some(version);
    }
}

/// Read interface of the trust-graph producer.
///
/// Callers of the engine's subscribe path must not hold the producer lock
/// themselves; the engine acquires it (read side) for the duration of the
/// snapshot. The returned sequences are copies and safe to iterate without
/// the lock.
pub trait GraphReader {
    fn identities(&self) -> Vec<Identity>;
    fn trusts(&self) -> Vec<Trust>;
    fn scores(&self) -> Vec<Score>;
}

/// Serialize an entity into a self-contained notification payload.
pub fn encode_payload<E: EventSource>(entity: &E) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(entity)?)
}

/// Decode a notification payload back into its entity.
///
/// Payloads are written by this crate, so a decode failure means the queue is
/// corrupt and is surfaced as a bug rather than a transport problem.
pub fn decode_payload<E: EventSource>(bytes: &[u8]) -> Result<E> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| RelayError::Bug(format!("undecodable notification payload: {}", e)))
}
