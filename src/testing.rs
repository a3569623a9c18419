//! Test doubles for the producer and the transport.
//!
//! Used by the crate's own tests, the integration tests, and the benches.
//! [`MemGraph`] is a minimal in-memory trust graph whose mutators hand back
//! the previous entity version, ready to feed into a change batch.
//! [`RecordingTransport`] records every outbound call and can be scripted to
//! fail, so delivery, retry, and disconnect paths are all drivable.

use crate::graph::{GraphReader, Identity, Score, Trust};
use crate::transport::{CancelToken, SyncKind, Transport, TransportError};
use crate::types::{StreamType, SubscriptionId, TransportId, VersionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// In-memory trust graph.
#[derive(Debug, Default)]
pub struct MemGraph {
    identities: BTreeMap<String, Identity>,
    trusts: BTreeMap<String, Trust>,
    scores: BTreeMap<String, Score>,
}

impl MemGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an identity, returning the previous version.
    pub fn put_identity(&mut self, identity: Identity) -> Option<Identity> {
        self.identities.insert(identity.id.clone(), identity)
    }

    pub fn remove_identity(&mut self, id: &str) -> Option<Identity> {
        self.identities.remove(id)
    }

    pub fn put_trust(&mut self, trust: Trust) -> Option<Trust> {
        let key = format!("{}@{}", trust.truster, trust.trustee);
        self.trusts.insert(key, trust)
    }

    pub fn remove_trust(&mut self, truster: &str, trustee: &str) -> Option<Trust> {
        self.trusts.remove(&format!("{}@{}", truster, trustee))
    }

    pub fn put_score(&mut self, score: Score) -> Option<Score> {
        let key = format!("{}@{}", score.truster, score.trustee);
        self.scores.insert(key, score)
    }

    pub fn remove_score(&mut self, truster: &str, trustee: &str) -> Option<Score> {
        self.scores.remove(&format!("{}@{}", truster, trustee))
    }
}

impl GraphReader for MemGraph {
    fn identities(&self) -> Vec<Identity> {
        self.identities.values().cloned().collect()
    }

    fn trusts(&self) -> Vec<Trust> {
        self.trusts.values().cloned().collect()
    }

    fn scores(&self) -> Vec<Score> {
        self.scores.values().cloned().collect()
    }
}

/// Shorthand identity fixture.
pub fn identity(id: &str) -> Identity {
    Identity {
        id: id.to_string(),
        nickname: id.to_string(),
        publishes_trust_list: true,
        version_id: None,
    }
}

/// Shorthand trust fixture.
pub fn trust(truster: &str, trustee: &str, value: i8) -> Trust {
    Trust {
        truster: truster.to_string(),
        trustee: trustee.to_string(),
        value,
        comment: String::new(),
        version_id: None,
    }
}

/// Shorthand score fixture.
pub fn score(truster: &str, trustee: &str, value: i32) -> Score {
    Score {
        truster: truster.to_string(),
        trustee: trustee.to_string(),
        value,
        rank: 1,
        capacity: 40,
        version_id: None,
    }
}

/// Everything a [`RecordingTransport`] saw go out.
#[derive(Clone, Debug, PartialEq)]
pub enum Sent {
    IdentityChanged {
        client: TransportId,
        old: Option<Identity>,
        new: Option<Identity>,
    },
    TrustChanged {
        client: TransportId,
        old: Option<Trust>,
        new: Option<Trust>,
    },
    ScoreChanged {
        client: TransportId,
        old: Option<Score>,
        new: Option<Score>,
    },
    SyncMarker {
        client: TransportId,
        subscription: SubscriptionId,
        version: VersionId,
        kind: SyncKind,
        stream: StreamType,
    },
    Unsubscribed {
        client: TransportId,
        stream: StreamType,
        subscription: SubscriptionId,
    },
}

impl Sent {
    pub fn client(&self) -> TransportId {
        match self {
            Sent::IdentityChanged { client, .. }
            | Sent::TrustChanged { client, .. }
            | Sent::ScoreChanged { client, .. }
            | Sent::SyncMarker { client, .. }
            | Sent::Unsubscribed { client, .. } => *client,
        }
    }
}

/// Transport double that records every call.
///
/// Delivery calls succeed unless an outcome was scripted with
/// [`RecordingTransport::push_failures`]; scripted outcomes are consumed
/// front-first, one per delivery attempt. Attempts are recorded whether they
/// succeed or not. `send_unsubscribed` is recorded but never scripted.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    /// When set, delivery calls park until the cancel token fires, then
    /// report cancellation. Models a slow transfer interrupted by shutdown.
    block_until_cancelled: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `n` delivery attempts to fail with `error`.
    pub fn push_failures(&self, n: usize, error: TransportError) {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(Err(error.clone()));
        }
    }

    /// Script the next `n` delivery attempts to succeed (useful ahead of
    /// scripted failures).
    pub fn push_successes(&self, n: usize) {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(Ok(()));
        }
    }

    /// Make delivery calls park until cancelled.
    pub fn set_block_until_cancelled(&self, block: bool) {
        self.block_until_cancelled.store(block, Ordering::SeqCst);
    }

    /// Every call recorded so far, in send order.
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Every call recorded for one client, in send order.
    pub fn sent_to(&self, client: TransportId) -> Vec<Sent> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.client() == client)
            .cloned()
            .collect()
    }

    fn deliver(&self, record: Sent, cancel: &CancelToken) -> Result<(), TransportError> {
        self.sent.lock().push(record);

        if self.block_until_cancelled.load(Ordering::SeqCst) {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            return Err(TransportError::Cancelled);
        }

        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}

impl Transport for RecordingTransport {
    fn send_identity_changed(
        &self,
        client: TransportId,
        old: Option<Identity>,
        new: Option<Identity>,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        self.deliver(Sent::IdentityChanged { client, old, new }, cancel)
    }

    fn send_trust_changed(
        &self,
        client: TransportId,
        old: Option<Trust>,
        new: Option<Trust>,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        self.deliver(Sent::TrustChanged { client, old, new }, cancel)
    }

    fn send_score_changed(
        &self,
        client: TransportId,
        old: Option<Score>,
        new: Option<Score>,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        self.deliver(Sent::ScoreChanged { client, old, new }, cancel)
    }

    fn send_sync_marker(
        &self,
        client: TransportId,
        subscription: SubscriptionId,
        version: VersionId,
        kind: SyncKind,
        stream: StreamType,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        self.deliver(
            Sent::SyncMarker {
                client,
                subscription,
                version,
                kind,
                stream,
            },
            cancel,
        )
    }

    fn send_unsubscribed(
        &self,
        client: TransportId,
        stream: StreamType,
        subscription: SubscriptionId,
    ) -> Result<(), TransportError> {
        self.sent.lock().push(Sent::Unsubscribed {
            client,
            stream,
            subscription,
        });
        Ok(())
    }
}
