//! Outbound transport interface and cooperative cancellation.
//!
//! The transport performs synchronous request/response with a remote client:
//! a call returns only once the client has confirmed processing (or failed).
//! Synchronous confirmation is what makes per-notification commit possible,
//! and it preserves ordering at the client without any sequence numbers on
//! the wire.

use crate::graph::{Identity, Score, Trust};
use crate::types::{StreamType, SubscriptionId, TransportId, VersionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Whether a synchronization marker opens or closes a snapshot block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncKind {
    Begin,
    End,
}

/// Failure modes of a transport call.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The client received the notification but reported a processing
    /// failure on its side. The same notification will be retried.
    #[error("client reported processing failure: {0}")]
    ClientFailure(String),

    /// The outbound channel is gone. The client cannot be reached again.
    #[error("client disconnected")]
    Disconnected,

    /// The channel failed mid-transfer. Treated like a disconnect.
    #[error("transport I/O failure: {0}")]
    Io(String),

    /// The engine's cancel signal fired during the transfer.
    #[error("transfer cancelled")]
    Cancelled,

    /// Unexpected internal failure in the transport implementation.
    #[error("internal transport error: {0}")]
    Internal(String),
}

/// Shared cancellation flag, checked cooperatively.
///
/// Long transfers and snapshot builds poll this between units of work; the
/// transport is expected to convert a fired token into aborting the
/// in-flight call with [`TransportError::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Sticky until [`CancelToken::reset`].
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the token. Only the engine lifecycle does this, between a
    /// completed `stop()` and the next `start()`.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Outbound wire interface towards subscribed clients.
///
/// Implementations own their I/O timeouts; the engine relies solely on the
/// cancel token for bounded shutdown latency. All calls are synchronous and
/// must not return success before the client confirmed processing.
pub trait Transport: Send + Sync {
    /// Deliver an identity change. `old`/`new` follow the changed-pair
    /// contract: at most one side absent, absent `old` on a live event means
    /// creation, absent `new` means deletion.
    fn send_identity_changed(
        &self,
        client: TransportId,
        old: Option<Identity>,
        new: Option<Identity>,
        cancel: &CancelToken,
    ) -> Result<(), TransportError>;

    /// Deliver a trust-edge change.
    fn send_trust_changed(
        &self,
        client: TransportId,
        old: Option<Trust>,
        new: Option<Trust>,
        cancel: &CancelToken,
    ) -> Result<(), TransportError>;

    /// Deliver a score change.
    fn send_score_changed(
        &self,
        client: TransportId,
        old: Option<Score>,
        new: Option<Score>,
        cancel: &CancelToken,
    ) -> Result<(), TransportError>;

    /// Deliver a snapshot framing marker.
    fn send_sync_marker(
        &self,
        client: TransportId,
        subscription: SubscriptionId,
        version: VersionId,
        kind: SyncKind,
        stream: StreamType,
        cancel: &CancelToken,
    ) -> Result<(), TransportError>;

    /// Tell a client that a subscription was forcefully terminated, so it can
    /// re-subscribe. Best effort: the engine swallows any error.
    fn send_unsubscribed(
        &self,
        client: TransportId,
        stream: StreamType,
        subscription: SubscriptionId,
    ) -> Result<(), TransportError>;
}
