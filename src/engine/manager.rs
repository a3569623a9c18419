//! The subscription engine: event ingest, subscribe/unsubscribe, snapshots,
//! and lifecycle.
//!
//! Lock order, required globally to prevent deadlock:
//!
//! ```text
//! producer lock (graph RwLock) -> core lock -> repository transaction
//! ```
//!
//! Not every operation takes all three, but any operation taking several
//! takes them in this order. The ticker's own mutex is a leaf and may be
//! taken while holding any of the above.

use crate::engine::deploy;
use crate::engine::ticker::Ticker;
use crate::error::{RelayError, Result};
use crate::graph::{encode_payload, EventSource, GraphReader, Identity, Score, Trust};
use crate::repo::{
    ClientRecord, NotificationBody, NotificationRecord, Repository, SubscriptionRecord,
    Transaction,
};
use crate::transport::{CancelToken, Transport};
use crate::types::{StreamType, SubscriptionId, TransportId, VersionId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Delay between an enqueue and the deployment run it schedules. Gives event
/// bursts a window to ride the same run, and doubles as the minimum retry
/// back-off after a failed delivery.
pub const PROCESS_DELAY: Duration = Duration::from_secs(60);

/// Consecutive delivery failures after which a client is forcefully
/// disconnected.
pub const DISCONNECT_AFTER_FAILURES: u8 = 5;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Repository directory. `None` keeps queue state in memory only.
    pub path: Option<PathBuf>,

    /// Delay between an enqueue and the deployment run it triggers.
    pub process_delay: Duration,

    /// Failure budget before a client is disconnected.
    pub disconnect_after_failures: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: None,
            process_delay: PROCESS_DELAY,
            disconnect_after_failures: DISCONNECT_AFTER_FAILURES,
        }
    }
}

/// Counts of the engine's persisted state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub clients: usize,
    pub subscriptions: usize,
    pub pending_notifications: usize,
    /// Sum of all index allocators: every notification ever enqueued for the
    /// currently connected clients, delivered or not.
    pub total_notifications_enqueued: u64,
}

/// Change-event subscription and delivery engine.
///
/// `G` is the trust-graph producer; the engine holds its lock (the producer
/// lock) and acquires the read side for snapshots. Producers acquire the
/// write side themselves around mutations and feed the resulting change
/// events in through a [`ChangeBatch`].
pub struct SubscriptionEngine<G> {
    pub(crate) config: EngineConfig,
    graph: Arc<RwLock<G>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) repo: Repository,
    /// Core lock: serializes compound queue operations across transactions.
    pub(crate) core_lock: Mutex<()>,
    /// The scheduler, present while the engine is started. Guarded by its
    /// own small mutex to keep it out of the main lock order.
    ticker: Mutex<Option<Ticker>>,
    /// Engine-wide shutdown signal; checked by snapshots, the deployment
    /// worker, and in-flight transport calls.
    pub(crate) shutdown: CancelToken,
}

impl<G> SubscriptionEngine<G> {
    /// Create an engine over the given producer and transport.
    ///
    /// Opens (or creates) the repository if the config names a directory.
    /// The engine is inert until [`SubscriptionEngine::start`].
    pub fn new(
        config: EngineConfig,
        graph: Arc<RwLock<G>>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let repo = match &config.path {
            Some(dir) => Repository::open(dir)?,
            None => Repository::in_memory(),
        };

        Ok(Self {
            config,
            graph,
            transport,
            repo,
            core_lock: Mutex::new(()),
            ticker: Mutex::new(None),
            shutdown: CancelToken::new(),
        })
    }

    /// The shared producer. Mutating callers take the write side, emit their
    /// change events through [`SubscriptionEngine::change_batch`], and only
    /// then release it.
    pub fn graph(&self) -> &Arc<RwLock<G>> {
        &self.graph
    }

    // --- Lifecycle ---

    /// Start the engine: discard every persisted client and begin scheduling.
    ///
    /// Transport handles do not survive a restart, so any clients from a
    /// previous run are unreachable and are wiped along with their
    /// subscriptions and queued notifications.
    pub fn start(self: &Arc<Self>) -> Result<()>
    where
        G: Send + Sync + 'static,
    {
        if self.ticker.lock().is_some() {
            return Err(RelayError::Bug("engine already started".into()));
        }

        {
            let _core = self.core_lock.lock();
            let mut txn = self.repo.begin();
            let stale = txn.client_count();
            txn.clear();
            txn.commit()?;
            if stale > 0 {
                tracing::info!(clients = stale, "discarded clients from previous run");
            }
        }

        self.shutdown.reset();

        let weak = Arc::downgrade(self);
        let ticker = Ticker::spawn(
            self.config.process_delay,
            self.shutdown.clone(),
            move |cancel| {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                match deploy::run_pass(&engine, cancel) {
                    Ok(()) => {}
                    Err(RelayError::Cancelled) => {
                        tracing::debug!("deployment run cancelled");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "deployment run failed");
                    }
                }
            },
        )?;
        *self.ticker.lock() = Some(ticker);

        tracing::info!("engine started");
        Ok(())
    }

    /// Stop the engine promptly, even mid-transfer.
    ///
    /// Blocks further scheduling, drops a queued-but-not-running deployment,
    /// signals a running one to cancel at its next notification boundary (or
    /// inside the transfer, via the transport's token), and joins the worker
    /// thread. Safe against a deployment that starts concurrently, and
    /// idempotent.
    pub fn stop(&self) {
        let ticker = self.ticker.lock().take();
        self.shutdown.cancel();
        if let Some(ticker) = ticker {
            ticker.stop();
            tracing::info!("engine stopped");
        }
    }

    // --- Subscribing ---

    /// Subscribe a client to a stream.
    ///
    /// Finds or creates the client for `transport_id`, then enqueues a full
    /// snapshot of the stream's current entities framed by `Begin`/`End`
    /// markers, as one contiguous block: holding the producer lock keeps
    /// concurrent change events out of the middle of it.
    ///
    /// The snapshot can be large; `cancel` (or engine shutdown) aborts it
    /// with [`RelayError::Cancelled`] and the transaction rolls back
    /// wholesale, persisting nothing.
    pub fn subscribe(
        &self,
        transport_id: TransportId,
        stream: StreamType,
        cancel: &CancelToken,
    ) -> Result<SubscriptionId>
    where
        G: GraphReader,
    {
        let subscription_id = {
            let graph = self.graph.read();
            let _core = self.core_lock.lock();
            let mut txn = self.repo.begin();

            if let Some(existing) = txn
                .subscriptions_of(transport_id)
                .into_iter()
                .find(|s| s.stream == stream)
            {
                return Err(RelayError::SubscriptionExists {
                    stream,
                    existing: existing.id,
                });
            }

            let mut client = txn
                .client(transport_id)
                .unwrap_or_else(|| ClientRecord::new(transport_id));
            let subscription = SubscriptionRecord {
                id: SubscriptionId::random(),
                client: transport_id,
                stream,
            };

            self.build_snapshot(&mut txn, &mut client, &subscription, &*graph, cancel)?;

            txn.put_client(client);
            txn.put_subscription(subscription.clone());
            txn.commit()?;

            tracing::info!(
                client = %transport_id,
                stream = %stream,
                subscription = %subscription.id,
                "subscribed"
            );
            subscription.id
        };

        self.schedule_deployment();
        Ok(subscription_id)
    }

    /// Remove a subscription and its queued notifications. Deletes the
    /// client too if this was its last subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<StreamType> {
        let _core = self.core_lock.lock();
        let mut txn = self.repo.begin();

        let subscription = txn
            .subscription(id)
            .ok_or(RelayError::UnknownSubscription(id))?;

        purge_subscription(&mut txn, &subscription);
        if txn.subscriptions_of(subscription.client).is_empty() {
            tracing::info!(client = %subscription.client, "last subscription removed, deleting client");
            txn.delete_client(subscription.client);
        }
        txn.commit()?;

        tracing::info!(subscription = %id, stream = %subscription.stream, "unsubscribed");
        Ok(subscription.stream)
    }

    /// Materialize the `Begin`, `Changed*`, `End` snapshot block onto the
    /// client's queue.
    fn build_snapshot(
        &self,
        txn: &mut Transaction<'_>,
        client: &mut ClientRecord,
        subscription: &SubscriptionRecord,
        graph: &G,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        G: GraphReader,
    {
        if cancel.is_cancelled() || self.shutdown.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let version = VersionId::random();
        enqueue(txn, client, subscription, NotificationBody::Begin { version })?;

        match subscription.stream {
            StreamType::Identities => {
                self.snapshot_entities(txn, client, subscription, graph.identities(), version, cancel)?
            }
            StreamType::Trusts => {
                self.snapshot_entities(txn, client, subscription, graph.trusts(), version, cancel)?
            }
            StreamType::Scores => {
                self.snapshot_entities(txn, client, subscription, graph.scores(), version, cancel)?
            }
        }

        enqueue(txn, client, subscription, NotificationBody::End { version })?;
        Ok(())
    }

    fn snapshot_entities<E: EventSource>(
        &self,
        txn: &mut Transaction<'_>,
        client: &mut ClientRecord,
        subscription: &SubscriptionRecord,
        entities: Vec<E>,
        version: VersionId,
        cancel: &CancelToken,
    ) -> Result<()> {
        for mut copy in entities {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            copy.set_version_id(version);
            enqueue(
                txn,
                client,
                subscription,
                NotificationBody::Changed {
                    old: None,
                    new: Some(encode_payload(&copy)?),
                },
            )?;
        }
        Ok(())
    }

    // --- Event ingest ---

    /// Open a change batch.
    ///
    /// The producer must already hold its write lock (see
    /// [`SubscriptionEngine::graph`]); the batch takes the core lock and a
    /// repository transaction and holds both until committed or dropped.
    /// This mirrors the engine's delivery guarantee: either every change of
    /// the producer's mutation is queued, or none is.
    pub fn change_batch(&self) -> ChangeBatch<'_, G> {
        let core = self.core_lock.lock();
        let txn = self.repo.begin();
        ChangeBatch {
            engine: self,
            _core: core,
            txn,
            enqueued: 0,
        }
    }

    // --- Introspection ---

    /// Counts of persisted clients, subscriptions, and queued notifications.
    pub fn stats(&self) -> EngineStats {
        let _core = self.core_lock.lock();
        let txn = self.repo.begin();
        EngineStats {
            clients: txn.client_count(),
            subscriptions: txn.subscription_count(),
            pending_notifications: txn.notification_count(),
            total_notifications_enqueued: txn.clients().iter().map(|c| c.next_index).sum(),
        }
    }

    /// One client's pending queue, ascending by index.
    pub fn queued_notifications(&self, client: TransportId) -> Vec<NotificationRecord> {
        let _core = self.core_lock.lock();
        self.repo.begin().notifications_of(client)
    }

    /// All connected clients, ordered by transport id.
    pub fn clients(&self) -> Vec<ClientRecord> {
        let _core = self.core_lock.lock();
        self.repo.begin().clients()
    }

    /// One client's subscriptions.
    pub fn subscriptions_of(&self, client: TransportId) -> Vec<SubscriptionRecord> {
        let _core = self.core_lock.lock();
        self.repo.begin().subscriptions_of(client)
    }

    /// Verify the repository's structural invariants.
    pub fn check_integrity(&self) -> Result<()> {
        let _core = self.core_lock.lock();
        self.repo
            .begin()
            .check_integrity(self.config.disconnect_after_failures)
    }

    /// Run one deployment pass on the calling thread, without the ticker.
    ///
    /// This is how embedders and tests drive delivery deterministically; the
    /// started engine runs the same pass from the ticker thread.
    pub fn deploy_pending(&self, cancel: &CancelToken) -> Result<()> {
        deploy::run_pass(self, cancel)
    }

    /// Idempotently queue a deployment run at `process_delay`. A no-op when
    /// the engine is not started.
    pub(crate) fn schedule_deployment(&self) {
        if let Some(ticker) = self.ticker.lock().as_ref() {
            ticker.schedule();
        }
    }
}

/// Allocate the next index on `client` and enqueue `body` under it.
fn enqueue(
    txn: &mut Transaction<'_>,
    client: &mut ClientRecord,
    subscription: &SubscriptionRecord,
    body: NotificationBody,
) -> Result<()> {
    let index = client.take_index();
    txn.put_notification(NotificationRecord {
        client: client.transport,
        subscription: subscription.id,
        index,
        body,
    })
}

/// Delete a subscription and every notification it queued.
pub(crate) fn purge_subscription(txn: &mut Transaction<'_>, subscription: &SubscriptionRecord) {
    let queued: Vec<u64> = txn
        .notifications_of(subscription.client)
        .into_iter()
        .filter(|n| n.subscription == subscription.id)
        .map(|n| n.index)
        .collect();
    for index in queued {
        txn.delete_notification(subscription.client, index);
    }
    txn.delete_subscription(subscription.id);
}

/// An open ingest batch: the Rust face of "the producer's transaction".
///
/// Every `*_changed` call appends to the queue of each client subscribed to
/// that stream, in call order, preserving whatever causal order the producer
/// emitted under its lock. Dropping the batch without committing rolls all
/// of it back.
pub struct ChangeBatch<'a, G> {
    engine: &'a SubscriptionEngine<G>,
    _core: MutexGuard<'a, ()>,
    txn: Transaction<'a>,
    enqueued: usize,
}

impl<G> ChangeBatch<'_, G> {
    /// Queue an identity change for every identities subscriber.
    pub fn identity_changed(&mut self, old: Option<&Identity>, new: Option<&Identity>) -> Result<()> {
        self.changed(StreamType::Identities, old, new)
    }

    /// Queue a trust-edge change for every trusts subscriber.
    pub fn trust_changed(&mut self, old: Option<&Trust>, new: Option<&Trust>) -> Result<()> {
        self.changed(StreamType::Trusts, old, new)
    }

    /// Queue a score change for every scores subscriber.
    pub fn score_changed(&mut self, old: Option<&Score>, new: Option<&Score>) -> Result<()> {
        self.changed(StreamType::Scores, old, new)
    }

    fn changed<E: EventSource>(
        &mut self,
        stream: StreamType,
        old: Option<&E>,
        new: Option<&E>,
    ) -> Result<()> {
        match (old, new) {
            (None, None) => {
                return Err(RelayError::Bug("change event with neither version".into()));
            }
            (Some(o), Some(n)) if o.id() != n.id() => {
                return Err(RelayError::Bug(format!(
                    "change event pairs different entities: {} vs {}",
                    o.id(),
                    n.id()
                )));
            }
            _ => {}
        }

        let old_bytes = old.map(encode_payload).transpose()?;
        let new_bytes = new.map(encode_payload).transpose()?;

        for subscription in self.txn.subscriptions_for_stream(stream) {
            let mut client = self.txn.client(subscription.client).ok_or_else(|| {
                RelayError::Bug(format!(
                    "subscription {} references missing client {}",
                    subscription.id, subscription.client
                ))
            })?;
            let index = client.take_index();
            self.txn.put_notification(NotificationRecord {
                client: client.transport,
                subscription: subscription.id,
                index,
                body: NotificationBody::Changed {
                    old: old_bytes.clone(),
                    new: new_bytes.clone(),
                },
            })?;
            self.txn.put_client(client);
            self.enqueued += 1;
        }

        Ok(())
    }

    /// Commit the batch and, if anything was enqueued, schedule delivery.
    pub fn commit(self) -> Result<()> {
        let ChangeBatch {
            engine,
            _core,
            txn,
            enqueued,
        } = self;

        txn.commit()?;
        drop(_core);

        if enqueued > 0 {
            engine.schedule_deployment();
        }
        Ok(())
    }
}
