// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use splitbill::application::{
    AggregateStream, FeedConfig, Ledger, LiveAggregate, MergedView, Notification, Notifier,
    NotifyError, StaticIdentity, User,
};
use splitbill::domain::{Bill, BillId, NewBill, Participant};
use splitbill::storage::{BillPatch, BillQuery, BillStore, SnapshotStream, SqliteStore, StoreError};
use tempfile::TempDir;
use tokio::sync::watch;

pub type TestLedger = Ledger<SqliteStore, SqliteStore, SqliteStore>;

/// How long a test waits for a live update before failing.
pub const WAIT: Duration = Duration::from_secs(5);

/// Helper to create a store backed by a temporary database
pub async fn test_store() -> Result<(Arc<SqliteStore>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let db_url = format!("sqlite:{}?mode=rwc", db_path.to_str().unwrap());
    let store = SqliteStore::init(&db_url).await?;
    Ok((Arc::new(store), temp_dir))
}

/// Feeds that retry quickly so degraded-path tests stay short
pub fn fast_feeds() -> FeedConfig {
    FeedConfig {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

pub fn identity(user_id: &str) -> Arc<StaticIdentity> {
    Arc::new(StaticIdentity::signed_in(User::new(
        user_id,
        user_id.to_uppercase(),
    )))
}

/// A ledger signed in as `user_id`, sharing the given store with other users
pub fn ledger_for(store: &Arc<SqliteStore>, user_id: &str) -> TestLedger {
    Ledger::new(store.clone(), store.clone(), store.clone(), identity(user_id))
        .with_feed_config(fast_feeds())
}

pub fn participants(ids: &[&str]) -> Vec<Participant> {
    ids.iter()
        .map(|id| Participant::new(*id, id.to_uppercase()))
        .collect()
}

/// Wait until the merged view satisfies the predicate
pub async fn wait_for_view(
    view: &mut watch::Receiver<MergedView>,
    predicate: impl FnMut(&MergedView) -> bool,
) -> MergedView {
    let matched = tokio::time::timeout(WAIT, view.wait_for(predicate))
        .await
        .expect("timed out waiting for merged view")
        .expect("feeds stopped")
        .clone();
    matched
}

pub fn contains(view: &MergedView, bill_id: BillId) -> bool {
    view.bills.iter().any(|b| b.id == bill_id)
}

/// Wait for the next aggregate matching the predicate, skipping others
pub async fn next_aggregate(
    stream: &mut AggregateStream,
    mut predicate: impl FnMut(&LiveAggregate) -> bool,
) -> LiveAggregate {
    tokio::time::timeout(WAIT, async {
        loop {
            let next = stream.next().await.expect("aggregate stream ended");
            if predicate(&next) {
                return next;
            }
        }
    })
    .await
    .expect("timed out waiting for aggregate")
}

/// Notifier that keeps every notification in memory
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Notifier whose deliveries always fail
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Dispatch {
            recipient: notification.recipient_id.clone(),
            reason: "inbox offline".to_string(),
        })
    }
}

/// Store whose "split to" subscriptions fail while switched offline
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    split_to_offline: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            split_to_offline: AtomicBool::new(true),
        }
    }

    pub fn set_split_to_offline(&self, offline: bool) {
        self.split_to_offline.store(offline, Ordering::SeqCst);
    }
}

impl BillStore for FlakyStore {
    async fn insert(&self, bill: NewBill) -> Result<Bill, StoreError> {
        self.inner.insert(bill).await
    }

    async fn update(&self, id: BillId, patch: BillPatch) -> Result<Option<Bill>, StoreError> {
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: BillId) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn get(&self, id: BillId) -> Result<Option<Bill>, StoreError> {
        self.inner.get(id).await
    }

    async fn query(&self, query: &BillQuery) -> Result<Vec<Bill>, StoreError> {
        self.inner.query(query).await
    }

    fn subscribe(&self, query: BillQuery) -> SnapshotStream {
        if matches!(query, BillQuery::SplitTo(_)) && self.split_to_offline.load(Ordering::SeqCst) {
            let (tx, stream) = SnapshotStream::channel();
            let _ = tx.try_send(Err(StoreError::Unavailable("connection refused".into())));
            return stream;
        }
        self.inner.subscribe(query)
    }
}
