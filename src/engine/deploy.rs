//! The deployment pass: flush each client's queue to the transport.

use crate::engine::manager::{purge_subscription, SubscriptionEngine};
use crate::error::{RelayError, Result};
use crate::graph::{decode_payload, EventSource, Identity, Score, Trust};
use crate::repo::{ClientRecord, NotificationBody, NotificationRecord, SubscriptionRecord};
use crate::transport::{CancelToken, SyncKind, Transport, TransportError};
use crate::types::{StreamType, TransportId};

/// How flushing one client's queue ended.
enum Flush {
    /// Queue drained completely.
    Completed,
    /// A delivery failed; the queue keeps its remaining entries and a retry
    /// run is scheduled.
    Halted,
    /// The client must be removed (disconnected, or failure budget spent).
    Remove,
}

/// One deployment pass over every client.
///
/// Runs under the core lock only: notifications are self-contained, so the
/// producer stays unlocked and free to mutate the graph while transfers are
/// in flight. Cancellation is honored between clients, between
/// notifications, and inside transfers (via the transport's token); it
/// surfaces as [`RelayError::Cancelled`] with the in-flight notification
/// still queued.
pub(crate) fn run_pass<G>(engine: &SubscriptionEngine<G>, cancel: &CancelToken) -> Result<()> {
    let _core = engine.core_lock.lock();
    tracing::debug!("deployment pass starting");

    let clients = engine.repo.begin().clients();
    for client in clients {
        if cancel.is_cancelled() || engine.shutdown.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        match flush_client(engine, &client, cancel) {
            Ok(Flush::Completed) | Ok(Flush::Halted) => {}
            Ok(Flush::Remove) => {
                if let Err(e) = remove_client(engine, client.transport) {
                    tracing::error!(
                        client = %client.transport,
                        error = %e,
                        "failed to remove client"
                    );
                }
            }
            Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
            Err(e) => {
                // Transaction already disposed; skip to the next client.
                tracing::error!(client = %client.transport, error = %e, "client flush failed");
            }
        }
    }

    tracing::debug!("deployment pass finished");
    Ok(())
}

/// Deliver one client's queue in index order.
///
/// Each notification's send-and-delete is one committed transaction, so a
/// crash can at worst repeat the newest confirmed notification, never skip
/// or reorder one.
fn flush_client<G>(
    engine: &SubscriptionEngine<G>,
    client: &ClientRecord,
    cancel: &CancelToken,
) -> Result<Flush> {
    let queue = engine.repo.begin().notifications_of(client.transport);
    if queue.is_empty() {
        return Ok(Flush::Completed);
    }
    tracing::debug!(client = %client.transport, pending = queue.len(), "flushing queue");

    for notification in queue {
        if cancel.is_cancelled() || engine.shutdown.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let mut txn = engine.repo.begin();
        let subscription = txn.subscription(notification.subscription).ok_or_else(|| {
            RelayError::Bug(format!(
                "queued notification {} references missing subscription {}",
                notification.index, notification.subscription
            ))
        })?;

        match dispatch(engine.transport.as_ref(), &subscription, &notification, cancel) {
            Ok(()) => {
                txn.delete_notification(notification.client, notification.index);
                let mut record = txn
                    .client(notification.client)
                    .ok_or_else(|| RelayError::Bug("client vanished mid-flush".into()))?;
                if record.failures != 0 {
                    record.failures = 0;
                    txn.put_client(record);
                }
                txn.commit()?;
            }
            Err(TransportError::Cancelled) => {
                drop(txn);
                return Err(RelayError::Cancelled);
            }
            Err(e) => {
                drop(txn);
                let failures = bump_failure_counter(engine, client.transport)?;

                if matches!(e, TransportError::Disconnected | TransportError::Io(_)) {
                    tracing::warn!(
                        client = %client.transport,
                        failures,
                        error = %e,
                        "client unreachable, disconnecting"
                    );
                    return Ok(Flush::Remove);
                }

                tracing::warn!(
                    client = %client.transport,
                    failures,
                    index = notification.index,
                    kind = notification.body.label(),
                    error = %e,
                    "delivery failed"
                );
                if failures >= engine.config.disconnect_after_failures {
                    return Ok(Flush::Remove);
                }
                engine.schedule_deployment();
                return Ok(Flush::Halted);
            }
        }
    }

    Ok(Flush::Completed)
}

/// Send one notification over the wire, decoding its payloads per the
/// subscription's stream type.
fn dispatch(
    transport: &dyn Transport,
    subscription: &SubscriptionRecord,
    notification: &NotificationRecord,
    cancel: &CancelToken,
) -> std::result::Result<(), TransportError> {
    let client = notification.client;
    match &notification.body {
        NotificationBody::Begin { version } => transport.send_sync_marker(
            client,
            subscription.id,
            *version,
            SyncKind::Begin,
            subscription.stream,
            cancel,
        ),
        NotificationBody::End { version } => transport.send_sync_marker(
            client,
            subscription.id,
            *version,
            SyncKind::End,
            subscription.stream,
            cancel,
        ),
        NotificationBody::Changed { old, new } => match subscription.stream {
            StreamType::Identities => {
                transport.send_identity_changed(client, decode::<Identity>(old)?, decode(new)?, cancel)
            }
            StreamType::Trusts => {
                transport.send_trust_changed(client, decode::<Trust>(old)?, decode(new)?, cancel)
            }
            StreamType::Scores => {
                transport.send_score_changed(client, decode::<Score>(old)?, decode(new)?, cancel)
            }
        },
    }
}

/// Decode an optional payload. Payloads were written by this crate, so a
/// failure here is internal, not the client's.
fn decode<E: EventSource>(
    bytes: &Option<Vec<u8>>,
) -> std::result::Result<Option<E>, TransportError> {
    bytes
        .as_ref()
        .map(|b| decode_payload(b).map_err(|e| TransportError::Internal(e.to_string())))
        .transpose()
}

/// Record one more failure against the client, in its own committed
/// transaction so the counter survives whatever happens next.
fn bump_failure_counter<G>(engine: &SubscriptionEngine<G>, client: TransportId) -> Result<u8> {
    let mut txn = engine.repo.begin();
    let mut record = txn
        .client(client)
        .ok_or(RelayError::UnknownClient(client))?;
    record.failures = record.failures.saturating_add(1);
    let failures = record.failures;
    txn.put_client(record);
    txn.commit()?;
    Ok(failures)
}

/// Delete a client with all its subscriptions and notifications, then tell
/// the client about each terminated subscription so it can re-subscribe.
/// The notices are best effort; the removal is already committed.
fn remove_client<G>(engine: &SubscriptionEngine<G>, client: TransportId) -> Result<()> {
    let subscriptions = {
        let mut txn = engine.repo.begin();
        let subscriptions = txn.subscriptions_of(client);
        for subscription in &subscriptions {
            purge_subscription(&mut txn, subscription);
        }
        txn.delete_client(client);
        txn.commit()?;
        subscriptions
    };

    tracing::warn!(client = %client, subscriptions = subscriptions.len(), "client removed");

    for subscription in subscriptions {
        if let Err(e) =
            engine
                .transport
                .send_unsubscribed(client, subscription.stream, subscription.id)
        {
            tracing::debug!(
                client = %client,
                subscription = %subscription.id,
                error = %e,
                "unsubscribed notice failed"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::testing::{identity, trust, MemGraph, RecordingTransport, Sent};
    use parking_lot::RwLock;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn fixture(
        graph: MemGraph,
    ) -> (SubscriptionEngine<MemGraph>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let engine = SubscriptionEngine::new(
            EngineConfig::default(),
            Arc::new(RwLock::new(graph)),
            transport.clone(),
        )
        .unwrap();
        (engine, transport)
    }

    fn failures_of(engine: &SubscriptionEngine<MemGraph>, client: TransportId) -> u8 {
        engine.repo.begin().client(client).unwrap().failures
    }

    #[test]
    fn test_flush_delivers_snapshot_in_order_and_empties_queue() {
        let mut graph = MemGraph::new();
        graph.put_identity(identity("alice"));
        graph.put_identity(identity("bob"));
        let (engine, transport) = fixture(graph);

        let client = TransportId::random();
        engine
            .subscribe(client, StreamType::Identities, &CancelToken::new())
            .unwrap();
        engine.deploy_pending(&CancelToken::new()).unwrap();

        let sent = transport.sent_to(client);
        assert_eq!(sent.len(), 4);

        let version = match &sent[0] {
            Sent::SyncMarker {
                kind: SyncKind::Begin,
                version,
                stream: StreamType::Identities,
                ..
            } => *version,
            other => panic!("expected begin marker, got {:?}", other),
        };
        for (position, expected_id) in [(1, "alice"), (2, "bob")] {
            match &sent[position] {
                Sent::IdentityChanged {
                    old: None,
                    new: Some(identity),
                    ..
                } => {
                    assert_eq!(identity.id, expected_id);
                    assert_eq!(identity.version_id, Some(version));
                }
                other => panic!("expected identity change, got {:?}", other),
            }
        }
        assert!(matches!(
            &sent[3],
            Sent::SyncMarker { kind: SyncKind::End, version: v, .. } if *v == version
        ));

        assert_eq!(engine.stats().pending_notifications, 0);
        assert_eq!(engine.stats().clients, 1);
    }

    #[test]
    fn test_failure_halts_queue_and_keeps_it_intact() {
        let mut graph = MemGraph::new();
        graph.put_identity(identity("alice"));
        let (engine, transport) = fixture(graph);

        let client = TransportId::random();
        engine
            .subscribe(client, StreamType::Identities, &CancelToken::new())
            .unwrap();
        let queued = engine.stats().pending_notifications;

        transport.push_failures(1, TransportError::ClientFailure("busy".into()));
        engine.deploy_pending(&CancelToken::new()).unwrap();

        assert_eq!(engine.stats().pending_notifications, queued);
        assert_eq!(failures_of(&engine, client), 1);

        // The retry delivers everything and heals the counter.
        engine.deploy_pending(&CancelToken::new()).unwrap();
        assert_eq!(engine.stats().pending_notifications, 0);
        assert_eq!(failures_of(&engine, client), 0);
    }

    #[test]
    fn test_internal_error_is_retried_like_client_failure() {
        let (engine, transport) = fixture(MemGraph::new());
        let client = TransportId::random();
        engine
            .subscribe(client, StreamType::Scores, &CancelToken::new())
            .unwrap();

        transport.push_failures(1, TransportError::Internal("broken pipe state".into()));
        engine.deploy_pending(&CancelToken::new()).unwrap();

        assert_eq!(engine.stats().clients, 1);
        assert_eq!(failures_of(&engine, client), 1);
    }

    #[test]
    fn test_failure_budget_exhaustion_removes_client() {
        let mut graph = MemGraph::new();
        graph.put_trust(trust("alice", "bob", 50));
        let (engine, transport) = fixture(graph);

        let client = TransportId::random();
        let subscription = engine
            .subscribe(client, StreamType::Trusts, &CancelToken::new())
            .unwrap();

        transport.push_failures(5, TransportError::ClientFailure("rejected".into()));
        for run in 1..=5 {
            engine.deploy_pending(&CancelToken::new()).unwrap();
            if run < 5 {
                assert_eq!(failures_of(&engine, client), run);
            }
        }

        let stats = engine.stats();
        assert_eq!(stats.clients, 0);
        assert_eq!(stats.subscriptions, 0);
        assert_eq!(stats.pending_notifications, 0);

        let notices: Vec<_> = transport
            .sent_to(client)
            .into_iter()
            .filter(|s| matches!(s, Sent::Unsubscribed { .. }))
            .collect();
        assert_eq!(
            notices,
            vec![Sent::Unsubscribed {
                client,
                stream: StreamType::Trusts,
                subscription,
            }]
        );
    }

    #[test]
    fn test_success_between_failures_resets_the_budget() {
        let (engine, transport) = fixture(MemGraph::new());
        let client = TransportId::random();
        engine
            .subscribe(client, StreamType::Identities, &CancelToken::new())
            .unwrap();

        // Four failures on the begin marker, then it goes through.
        transport.push_failures(4, TransportError::ClientFailure("busy".into()));
        for _ in 0..4 {
            engine.deploy_pending(&CancelToken::new()).unwrap();
        }
        assert_eq!(failures_of(&engine, client), 4);

        engine.deploy_pending(&CancelToken::new()).unwrap();
        assert_eq!(failures_of(&engine, client), 0);
        assert_eq!(engine.stats().clients, 1);
    }

    #[test]
    fn test_disconnect_removes_client_immediately() {
        let (engine, transport) = fixture(MemGraph::new());
        let client = TransportId::random();
        engine
            .subscribe(client, StreamType::Identities, &CancelToken::new())
            .unwrap();

        transport.push_failures(1, TransportError::Disconnected);
        engine.deploy_pending(&CancelToken::new()).unwrap();

        assert_eq!(engine.stats().clients, 0);
        assert!(transport
            .sent_to(client)
            .iter()
            .any(|s| matches!(s, Sent::Unsubscribed { .. })));
    }

    #[test]
    fn test_io_error_is_treated_as_disconnect() {
        let (engine, transport) = fixture(MemGraph::new());
        let client = TransportId::random();
        engine
            .subscribe(client, StreamType::Trusts, &CancelToken::new())
            .unwrap();

        transport.push_failures(1, TransportError::Io("connection reset".into()));
        engine.deploy_pending(&CancelToken::new()).unwrap();

        assert_eq!(engine.stats().clients, 0);
    }

    #[test]
    fn test_cancellation_mid_transfer_leaves_notification_queued() {
        let (engine, transport) = fixture(MemGraph::new());
        let engine = Arc::new(engine);
        let client = TransportId::random();
        engine
            .subscribe(client, StreamType::Identities, &CancelToken::new())
            .unwrap();
        let queued = engine.stats().pending_notifications;

        transport.set_block_until_cancelled(true);
        let cancel = CancelToken::new();
        let worker = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            thread::spawn(move || engine.deploy_pending(&cancel))
        };

        thread::sleep(Duration::from_millis(30));
        let cancelled_at = Instant::now();
        cancel.cancel();
        let result = worker.join().unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(5));

        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert_eq!(engine.stats().pending_notifications, queued);
        assert_eq!(failures_of(&engine, client), 0);
    }

    #[test]
    fn test_two_healthy_clients_both_flush() {
        let (engine, transport) = fixture(MemGraph::new());
        let first = TransportId::random();
        let second = TransportId::random();
        engine
            .subscribe(first, StreamType::Identities, &CancelToken::new())
            .unwrap();
        engine
            .subscribe(second, StreamType::Identities, &CancelToken::new())
            .unwrap();

        let mut batch = engine.change_batch();
        batch.identity_changed(None, Some(&identity("x"))).unwrap();
        batch.commit().unwrap();

        engine.deploy_pending(&CancelToken::new()).unwrap();

        assert_eq!(engine.stats().pending_notifications, 0);
        assert_eq!(transport.sent_to(first).len(), 3);
        assert_eq!(transport.sent_to(second).len(), 3);
    }
}
