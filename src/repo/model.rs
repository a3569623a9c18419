//! Persistent records: clients, subscriptions, queued notifications.

use crate::types::{StreamType, SubscriptionId, TransportId, VersionId};
use serde::{Deserialize, Serialize};

/// A connected subscriber.
///
/// Created on first subscription of a transport handle, deleted when its last
/// subscription goes away or when the failure budget is exhausted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Outbound channel handle. Unique across clients.
    pub transport: TransportId,
    /// Next free notification index. Monotonically non-decreasing; advanced
    /// only by allocating an index to a newly stored notification.
    pub next_index: u64,
    /// Consecutive delivery failures. Reset to 0 by a successful delivery.
    pub failures: u8,
}

impl ClientRecord {
    pub fn new(transport: TransportId) -> Self {
        Self {
            transport,
            next_index: 0,
            failures: 0,
        }
    }

    /// Allocate the next notification index, advancing the counter.
    pub fn take_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

/// Which client observes which stream.
///
/// A client holds at most one subscription per stream type: events of one
/// stream can depend on events of another (a trust edge references the
/// identities it connects), so the queue is kept per client rather than per
/// subscription and duplicate streams would duplicate queue entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    /// Owning client, by transport handle.
    pub client: TransportId,
    pub stream: StreamType,
}

/// One queued delivery for one client.
///
/// Identified by `(client, index)`. The payloads inside `body` are serialized
/// entity clones; deploying a notification never touches the producer store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Cached owning client; always equals the subscription's client.
    pub client: TransportId,
    pub subscription: SubscriptionId,
    /// Position in the client's delivery queue.
    pub index: u64,
    pub body: NotificationBody,
}

/// What a notification tells the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationBody {
    /// Opens a snapshot block. Every `Changed` payload up to the matching
    /// `End` carries this version id.
    Begin { version: VersionId },

    /// Closes a snapshot block.
    End { version: VersionId },

    /// An entity changed. Absent `old` on a live event means creation,
    /// absent `new` means deletion; inside a snapshot block `old` is always
    /// absent and carries no creation meaning.
    Changed {
        old: Option<Vec<u8>>,
        new: Option<Vec<u8>>,
    },
}

impl NotificationBody {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            NotificationBody::Begin { .. } => "begin",
            NotificationBody::End { .. } => "end",
            NotificationBody::Changed { .. } => "changed",
        }
    }
}
