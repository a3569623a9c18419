//! Durable repository for clients, subscriptions, and queued notifications.
//!
//! State lives in indexed in-memory maps; durability comes from the commit
//! journal. Mutations happen inside a [`Transaction`]: each write records its
//! inverse, commit appends the redo batch to the journal, and dropping the
//! guard without committing rolls everything back in reverse order. The
//! repository's own mutex is the transaction lock and is the innermost lock
//! of the engine's documented ordering.

use crate::error::{RelayError, Result};
use crate::repo::journal::{Journal, RepoOp};
use crate::repo::model::{ClientRecord, NotificationBody, NotificationRecord, SubscriptionRecord};
use crate::types::{StreamType, SubscriptionId, TransportId};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::mem;
use std::path::Path;

/// In-memory repository state. All lookups the engine needs are index scans
/// over these maps; per-client notification order falls out of the
/// `(client, index)` key.
#[derive(Clone, Debug, Default)]
struct RepoState {
    clients: BTreeMap<TransportId, ClientRecord>,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionRecord>,
    notifications: BTreeMap<(TransportId, u64), NotificationRecord>,
}

impl RepoState {
    /// Apply one journaled operation. Used for replay; the live write path
    /// goes through [`Transaction`] so it can record undo information.
    fn apply(&mut self, op: &RepoOp) {
        match op {
            RepoOp::PutClient(c) => {
                self.clients.insert(c.transport, c.clone());
            }
            RepoOp::DeleteClient(id) => {
                self.clients.remove(id);
            }
            RepoOp::PutSubscription(s) => {
                self.subscriptions.insert(s.id, s.clone());
            }
            RepoOp::DeleteSubscription(id) => {
                self.subscriptions.remove(id);
            }
            RepoOp::PutNotification(n) => {
                self.notifications.insert((n.client, n.index), n.clone());
            }
            RepoOp::DeleteNotification { client, index } => {
                self.notifications.remove(&(*client, *index));
            }
            RepoOp::Clear => {
                self.clients.clear();
                self.subscriptions.clear();
                self.notifications.clear();
            }
        }
    }

    /// Full contents as journal operations (checkpoint for compaction).
    fn checkpoint(&self) -> Vec<RepoOp> {
        let mut ops = Vec::new();
        ops.extend(self.clients.values().cloned().map(RepoOp::PutClient));
        ops.extend(
            self.subscriptions
                .values()
                .cloned()
                .map(RepoOp::PutSubscription),
        );
        ops.extend(
            self.notifications
                .values()
                .cloned()
                .map(RepoOp::PutNotification),
        );
        ops
    }
}

/// Persistent store for the engine's queue state.
#[derive(Debug)]
pub struct Repository {
    state: Mutex<RepoState>,
    journal: Option<Journal>,
    /// Exclusive lock on the repository directory.
    _lock_file: Option<File>,
}

impl Repository {
    /// Open (or create) a repository directory, replaying the commit journal.
    ///
    /// After replay the journal is compacted to one checkpoint entry so it
    /// does not accumulate the full mutation history across runs.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let lock_file = Self::acquire_lock(dir)?;
        let journal = Journal::open(dir.join("commits.trj"))?;

        let mut state = RepoState::default();
        for entry in journal.replay()? {
            for op in &entry.ops {
                state.apply(op);
            }
        }
        journal.rewrite(state.checkpoint())?;

        Ok(Self {
            state: Mutex::new(state),
            journal: Some(journal),
            _lock_file: Some(lock_file),
        })
    }

    /// Ephemeral repository without a backing journal.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(RepoState::default()),
            journal: None,
            _lock_file: None,
        }
    }

    /// Begin a transaction, taking the transaction lock.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            state: self.state.lock(),
            journal: self.journal.as_ref(),
            undo: Vec::new(),
            redo: Vec::new(),
            committed: false,
        }
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.join("lock"))?;
        file.try_lock_exclusive().map_err(|_| RelayError::Locked)?;
        Ok(file)
    }
}

/// Inverse of one applied mutation.
#[derive(Debug)]
enum UndoOp {
    RestoreClient(ClientRecord),
    RemoveClient(TransportId),
    RestoreSubscription(SubscriptionRecord),
    RemoveSubscription(SubscriptionId),
    RestoreNotification(NotificationRecord),
    RemoveNotification(TransportId, u64),
    RestoreAll(RepoState),
}

/// A repository transaction.
///
/// Holds the transaction lock for its whole lifetime. Commit is explicit;
/// dropping the guard without committing restores the pre-transaction state.
pub struct Transaction<'a> {
    state: MutexGuard<'a, RepoState>,
    journal: Option<&'a Journal>,
    undo: Vec<UndoOp>,
    redo: Vec<RepoOp>,
    committed: bool,
}

impl Transaction<'_> {
    // --- Reads ---

    pub fn client(&self, transport: TransportId) -> Option<ClientRecord> {
        self.state.clients.get(&transport).cloned()
    }

    /// All clients, ordered by transport id.
    pub fn clients(&self) -> Vec<ClientRecord> {
        self.state.clients.values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.len()
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionRecord> {
        self.state.subscriptions.get(&id).cloned()
    }

    /// All subscriptions of one client.
    pub fn subscriptions_of(&self, client: TransportId) -> Vec<SubscriptionRecord> {
        self.state
            .subscriptions
            .values()
            .filter(|s| s.client == client)
            .cloned()
            .collect()
    }

    /// All subscriptions observing one stream type.
    pub fn subscriptions_for_stream(&self, stream: StreamType) -> Vec<SubscriptionRecord> {
        self.state
            .subscriptions
            .values()
            .filter(|s| s.stream == stream)
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.len()
    }

    /// One client's queue, ascending by index.
    pub fn notifications_of(&self, client: TransportId) -> Vec<NotificationRecord> {
        self.state
            .notifications
            .range((client, 0)..=(client, u64::MAX))
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn notification_count(&self) -> usize {
        self.state.notifications.len()
    }

    // --- Writes ---

    /// Insert or update a client.
    pub fn put_client(&mut self, client: ClientRecord) {
        let undo = match self.state.clients.insert(client.transport, client.clone()) {
            Some(prev) => UndoOp::RestoreClient(prev),
            None => UndoOp::RemoveClient(client.transport),
        };
        self.undo.push(undo);
        self.redo.push(RepoOp::PutClient(client));
    }

    /// Delete a client record. Does not cascade; callers delete the client's
    /// subscriptions and notifications explicitly.
    pub fn delete_client(&mut self, transport: TransportId) {
        if let Some(prev) = self.state.clients.remove(&transport) {
            self.undo.push(UndoOp::RestoreClient(prev));
            self.redo.push(RepoOp::DeleteClient(transport));
        }
    }

    pub fn put_subscription(&mut self, subscription: SubscriptionRecord) {
        let undo = match self
            .state
            .subscriptions
            .insert(subscription.id, subscription.clone())
        {
            Some(prev) => UndoOp::RestoreSubscription(prev),
            None => UndoOp::RemoveSubscription(subscription.id),
        };
        self.undo.push(undo);
        self.redo.push(RepoOp::PutSubscription(subscription));
    }

    pub fn delete_subscription(&mut self, id: SubscriptionId) {
        if let Some(prev) = self.state.subscriptions.remove(&id) {
            self.undo.push(UndoOp::RestoreSubscription(prev));
            self.redo.push(RepoOp::DeleteSubscription(id));
        }
    }

    /// Enqueue a notification. Its `(client, index)` slot must be free;
    /// colliding indices mean the index allocator was bypassed.
    pub fn put_notification(&mut self, notification: NotificationRecord) -> Result<()> {
        let key = (notification.client, notification.index);
        if self.state.notifications.contains_key(&key) {
            return Err(RelayError::Duplicate(format!(
                "notification index {} already queued for client {}",
                notification.index, notification.client
            )));
        }

        self.state.notifications.insert(key, notification.clone());
        self.undo.push(UndoOp::RemoveNotification(key.0, key.1));
        self.redo.push(RepoOp::PutNotification(notification));
        Ok(())
    }

    pub fn delete_notification(&mut self, client: TransportId, index: u64) {
        if let Some(prev) = self.state.notifications.remove(&(client, index)) {
            self.undo.push(UndoOp::RestoreNotification(prev));
            self.redo.push(RepoOp::DeleteNotification { client, index });
        }
    }

    /// Delete every client, subscription, and notification.
    pub fn clear(&mut self) {
        let prev = mem::take(&mut *self.state);
        self.undo.push(UndoOp::RestoreAll(prev));
        self.redo.push(RepoOp::Clear);
    }

    // --- Lifecycle ---

    /// Commit the transaction, making its effects durable.
    ///
    /// If the journal append fails the in-memory state is rolled back and the
    /// error surfaces: a transaction is only committed once its journal entry
    /// is on disk.
    pub fn commit(mut self) -> Result<()> {
        if let Some(journal) = self.journal {
            let redo = mem::take(&mut self.redo);
            if redo.iter().any(|op| matches!(op, RepoOp::Clear)) {
                // A wipe makes prior history redundant; checkpoint instead of
                // appending so the journal shrinks with the data.
                if let Err(e) = journal.rewrite(self.state.checkpoint()) {
                    self.rollback();
                    self.committed = true;
                    return Err(e);
                }
            } else if !redo.is_empty() {
                if let Err(e) = journal.append(redo) {
                    self.rollback();
                    self.committed = true;
                    return Err(e);
                }
            }
        }

        self.committed = true;
        Ok(())
    }

    fn rollback(&mut self) {
        for undo in mem::take(&mut self.undo).into_iter().rev() {
            match undo {
                UndoOp::RestoreClient(c) => {
                    self.state.clients.insert(c.transport, c);
                }
                UndoOp::RemoveClient(id) => {
                    self.state.clients.remove(&id);
                }
                UndoOp::RestoreSubscription(s) => {
                    self.state.subscriptions.insert(s.id, s);
                }
                UndoOp::RemoveSubscription(id) => {
                    self.state.subscriptions.remove(&id);
                }
                UndoOp::RestoreNotification(n) => {
                    self.state.notifications.insert((n.client, n.index), n);
                }
                UndoOp::RemoveNotification(client, index) => {
                    self.state.notifications.remove(&(client, index));
                }
                UndoOp::RestoreAll(prev) => {
                    *self.state = prev;
                }
            }
        }
    }

    /// Verify the structural invariants of the stored state.
    ///
    /// `failure_budget` bounds the per-client failure counter.
    pub fn check_integrity(&self, failure_budget: u8) -> Result<()> {
        let mut seen_streams = HashSet::new();
        for subscription in self.state.subscriptions.values() {
            if !self.state.clients.contains_key(&subscription.client) {
                return Err(RelayError::Bug(format!(
                    "subscription {} references missing client {}",
                    subscription.id, subscription.client
                )));
            }
            if !seen_streams.insert((subscription.client, subscription.stream)) {
                return Err(RelayError::Bug(format!(
                    "client {} holds two {} subscriptions",
                    subscription.client, subscription.stream
                )));
            }
        }

        for client in self.state.clients.values() {
            if client.failures > failure_budget {
                return Err(RelayError::Bug(format!(
                    "client {} failure counter {} exceeds budget {}",
                    client.transport, client.failures, failure_budget
                )));
            }
        }

        for ((key_client, key_index), notification) in &self.state.notifications {
            if *key_client != notification.client || *key_index != notification.index {
                return Err(RelayError::Bug("notification key/record mismatch".into()));
            }

            let client = self.state.clients.get(&notification.client).ok_or_else(|| {
                RelayError::Bug(format!(
                    "notification {} references missing client {}",
                    notification.index, notification.client
                ))
            })?;
            if notification.index >= client.next_index {
                return Err(RelayError::Bug(format!(
                    "notification index {} beyond allocator {} for client {}",
                    notification.index, client.next_index, client.transport
                )));
            }

            let subscription = self
                .state
                .subscriptions
                .get(&notification.subscription)
                .ok_or_else(|| {
                    RelayError::Bug(format!(
                        "notification {} references missing subscription {}",
                        notification.index, notification.subscription
                    ))
                })?;
            if subscription.client != notification.client {
                return Err(RelayError::Bug(format!(
                    "notification {} cached client {} but subscription belongs to {}",
                    notification.index, notification.client, subscription.client
                )));
            }

            if let NotificationBody::Changed { old: None, new: None } = &notification.body {
                return Err(RelayError::Bug(
                    "changed notification with neither payload".into(),
                ));
            }
        }

        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn changed(client: TransportId, subscription: SubscriptionId, index: u64) -> NotificationRecord {
        NotificationRecord {
            client,
            subscription,
            index,
            body: NotificationBody::Changed {
                old: None,
                new: Some(vec![1, 2, 3]),
            },
        }
    }

    #[test]
    fn test_commit_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let transport = TransportId::random();
        let sub_id = SubscriptionId::random();

        {
            let repo = Repository::open(dir.path().join("repo")).unwrap();
            let mut txn = repo.begin();
            let mut client = ClientRecord::new(transport);
            let index = client.take_index();
            txn.put_client(client);
            txn.put_subscription(SubscriptionRecord {
                id: sub_id,
                client: transport,
                stream: StreamType::Identities,
            });
            txn.put_notification(changed(transport, sub_id, index)).unwrap();
            txn.commit().unwrap();
        }

        let repo = Repository::open(dir.path().join("repo")).unwrap();
        let txn = repo.begin();
        assert_eq!(txn.client_count(), 1);
        assert_eq!(txn.subscription_count(), 1);
        assert_eq!(txn.notifications_of(transport).len(), 1);
        assert_eq!(txn.client(transport).unwrap().next_index, 1);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let repo = Repository::in_memory();
        let transport = TransportId::random();

        {
            let mut txn = repo.begin();
            txn.put_client(ClientRecord::new(transport));
            // No commit.
        }

        let txn = repo.begin();
        assert_eq!(txn.client_count(), 0);
    }

    #[test]
    fn test_rollback_restores_overwritten_values() {
        let repo = Repository::in_memory();
        let transport = TransportId::random();

        let mut txn = repo.begin();
        let mut client = ClientRecord::new(transport);
        client.failures = 2;
        txn.put_client(client);
        txn.commit().unwrap();

        {
            let mut txn = repo.begin();
            let mut client = txn.client(transport).unwrap();
            client.failures = 4;
            txn.put_client(client);
            txn.delete_client(transport);
            // No commit.
        }

        let txn = repo.begin();
        assert_eq!(txn.client(transport).unwrap().failures, 2);
    }

    #[test]
    fn test_duplicate_notification_index_rejected() {
        let repo = Repository::in_memory();
        let transport = TransportId::random();
        let sub_id = SubscriptionId::random();

        let mut txn = repo.begin();
        txn.put_notification(changed(transport, sub_id, 0)).unwrap();
        let err = txn.put_notification(changed(transport, sub_id, 0)).unwrap_err();
        assert!(matches!(err, RelayError::Duplicate(_)));
    }

    #[test]
    fn test_queue_scan_is_index_ordered_per_client() {
        let repo = Repository::in_memory();
        let a = TransportId::random();
        let b = TransportId::random();
        let sub_id = SubscriptionId::random();

        let mut txn = repo.begin();
        txn.put_notification(changed(a, sub_id, 2)).unwrap();
        txn.put_notification(changed(b, sub_id, 0)).unwrap();
        txn.put_notification(changed(a, sub_id, 0)).unwrap();
        txn.put_notification(changed(a, sub_id, 1)).unwrap();
        txn.commit().unwrap();

        let txn = repo.begin();
        let queue: Vec<u64> = txn.notifications_of(a).iter().map(|n| n.index).collect();
        assert_eq!(queue, vec![0, 1, 2]);
        assert_eq!(txn.notifications_of(b).len(), 1);
    }

    #[test]
    fn test_clear_wipes_everything_and_compacts_journal() {
        let dir = TempDir::new().unwrap();

        {
            let repo = Repository::open(dir.path().join("repo")).unwrap();
            let mut txn = repo.begin();
            for _ in 0..10 {
                txn.put_client(ClientRecord::new(TransportId::random()));
            }
            txn.commit().unwrap();

            let mut txn = repo.begin();
            txn.clear();
            txn.commit().unwrap();
        }

        let repo = Repository::open(dir.path().join("repo")).unwrap();
        let txn = repo.begin();
        assert_eq!(txn.client_count(), 0);
        assert_eq!(txn.notification_count(), 0);
    }

    #[test]
    fn test_second_open_of_same_dir_is_locked() {
        let dir = TempDir::new().unwrap();
        let _repo = Repository::open(dir.path().join("repo")).unwrap();
        let err = Repository::open(dir.path().join("repo")).unwrap_err();
        assert!(matches!(err, RelayError::Locked));
    }

    #[test]
    fn test_integrity_accepts_consistent_state() {
        let repo = Repository::in_memory();
        let transport = TransportId::random();
        let sub_id = SubscriptionId::random();

        let mut txn = repo.begin();
        let mut client = ClientRecord::new(transport);
        let index = client.take_index();
        txn.put_client(client);
        txn.put_subscription(SubscriptionRecord {
            id: sub_id,
            client: transport,
            stream: StreamType::Trusts,
        });
        txn.put_notification(changed(transport, sub_id, index)).unwrap();

        txn.check_integrity(5).unwrap();
    }

    #[test]
    fn test_integrity_catches_dangling_subscription() {
        let repo = Repository::in_memory();

        let mut txn = repo.begin();
        txn.put_subscription(SubscriptionRecord {
            id: SubscriptionId::random(),
            client: TransportId::random(),
            stream: StreamType::Scores,
        });

        assert!(matches!(txn.check_integrity(5), Err(RelayError::Bug(_))));
    }

    #[test]
    fn test_integrity_catches_index_beyond_allocator() {
        let repo = Repository::in_memory();
        let transport = TransportId::random();
        let sub_id = SubscriptionId::random();

        let mut txn = repo.begin();
        txn.put_client(ClientRecord::new(transport));
        txn.put_subscription(SubscriptionRecord {
            id: sub_id,
            client: transport,
            stream: StreamType::Identities,
        });
        // Index 3 was never allocated: next_index is still 0.
        txn.put_notification(changed(transport, sub_id, 3)).unwrap();

        assert!(matches!(txn.check_integrity(5), Err(RelayError::Bug(_))));
    }
}
