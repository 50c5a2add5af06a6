mod sqlite;

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{Bill, BillId, BillStatus, NewBill, UserId};

pub use sqlite::*;

/// SQL migration for initial schema
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// Buffered snapshots per subscription before the producer waits on the consumer.
const SNAPSHOT_BUFFER: usize = 8;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Connectivity or availability problem; the operation may succeed if retried.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// The two partition-scoped predicates a subscription can match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BillQuery {
    /// Bills recorded by the user
    CreatedBy(UserId),
    /// Bills where the user is a split participant (never the creator)
    SplitTo(UserId),
}

/// A field-level change to a stored bill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillPatch {
    SetStatus(BillStatus),
    /// Add to `paid_participants`; ignored unless the id is on the split list
    MarkParticipantPaid(UserId),
    /// Remove from `paid_participants`
    MarkParticipantUnpaid(UserId),
}

pub type Snapshot = Result<Vec<Bill>, StoreError>;

/// Live result set of a subscription.
///
/// Every item is the full current set of matching bills, never a delta.
/// Dropping the stream unsubscribes.
#[derive(Debug)]
pub struct SnapshotStream {
    rx: mpsc::Receiver<Snapshot>,
}

impl SnapshotStream {
    /// Create a stream together with the sender a store uses to push snapshots.
    pub fn channel() -> (mpsc::Sender<Snapshot>, Self) {
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        (tx, Self { rx })
    }

    /// Wait for the next snapshot. `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }
}

/// Durable bill storage with change notification.
///
/// Writes are last-write-wins per field. Subscriptions re-deliver the whole
/// matching set on every change, ordered by `created_at` descending.
pub trait BillStore: Send + Sync + 'static {
    /// Persist a validated bill; the store assigns `id`, `created_at` and `updated_at`.
    fn insert(&self, bill: NewBill) -> impl Future<Output = Result<Bill, StoreError>> + Send;

    /// Apply a field-level change. `None` if the bill does not exist.
    fn update(
        &self,
        id: BillId,
        patch: BillPatch,
    ) -> impl Future<Output = Result<Option<Bill>, StoreError>> + Send;

    /// Remove a bill. Returns false if it did not exist.
    fn delete(&self, id: BillId) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn get(&self, id: BillId) -> impl Future<Output = Result<Option<Bill>, StoreError>> + Send;

    fn query(&self, query: &BillQuery)
    -> impl Future<Output = Result<Vec<Bill>, StoreError>> + Send;

    /// Start a live subscription. The first snapshot is the current result set.
    fn subscribe(&self, query: BillQuery) -> SnapshotStream;
}
