//! Merging the two partition feeds into one ordered view of a user's bills.
//!
//! Each partition is a map keyed by bill id that is overwritten wholesale by
//! every snapshot; the merged view is a read-only projection over both maps.
//! The store never orders deliveries across partitions, so each partition's
//! latest snapshot is trusted on its own.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::domain::{Bill, BillId, UserId};
use crate::storage::{BillStore, SnapshotStream};

use super::{BillRepository, Partition};

/// Health of one partition feed as seen by observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedStatus {
    /// No snapshot received yet
    #[default]
    Loading,
    Live,
    /// Subscription failed; the last known snapshot is still served
    Degraded,
}

/// The deduplicated union of both partitions, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedView {
    pub bills: Vec<Bill>,
    pub created_by_me: FeedStatus,
    pub split_to_me: FeedStatus,
}

impl MergedView {
    pub fn status(&self, partition: Partition) -> FeedStatus {
        match partition {
            Partition::CreatedByMe => self.created_by_me,
            Partition::SplitToMe => self.split_to_me,
        }
    }

    /// Both partitions are live, so figures derived from the view are complete.
    pub fn is_complete(&self) -> bool {
        self.created_by_me == FeedStatus::Live && self.split_to_me == FeedStatus::Live
    }

    /// Every partition has either delivered or failed at least once.
    pub fn is_settled(&self) -> bool {
        self.created_by_me != FeedStatus::Loading && self.split_to_me != FeedStatus::Loading
    }

    pub fn degraded(&self) -> Vec<Partition> {
        [Partition::CreatedByMe, Partition::SplitToMe]
            .into_iter()
            .filter(|p| self.status(*p) == FeedStatus::Degraded)
            .collect()
    }
}

#[derive(Debug, Default)]
struct PartitionState {
    bills: HashMap<BillId, Bill>,
    status: FeedStatus,
}

/// In-memory merge state for one user session. Holds no authoritative data:
/// feeding it the same snapshots always rebuilds the same view.
#[derive(Debug, Default)]
pub struct FeedMerger {
    created_by_me: PartitionState,
    split_to_me: PartitionState,
}

impl FeedMerger {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut PartitionState {
        match partition {
            Partition::CreatedByMe => &mut self.created_by_me,
            Partition::SplitToMe => &mut self.split_to_me,
        }
    }

    /// Replace a partition with a freshly delivered snapshot.
    pub fn apply_snapshot(&mut self, partition: Partition, bills: Vec<Bill>) {
        let state = self.partition_mut(partition);
        state.bills = bills.into_iter().map(|b| (b.id, b)).collect();
        state.status = FeedStatus::Live;
    }

    /// Keep serving the partition's last snapshot but flag it.
    pub fn mark_degraded(&mut self, partition: Partition) {
        self.partition_mut(partition).status = FeedStatus::Degraded;
    }

    /// Project both partitions into one list: unique by id, sorted by
    /// `created_at` descending with ties broken by id ascending.
    pub fn view(&self) -> MergedView {
        let mut merged: HashMap<BillId, &Bill> = self
            .created_by_me
            .bills
            .iter()
            .map(|(id, b)| (*id, b))
            .collect();

        for (id, bill) in &self.split_to_me.bills {
            // Disjoint by invariant; if both carry a bill, keep the newer write
            // so the outcome does not depend on delivery order.
            match merged.get(id) {
                Some(existing) if existing.updated_at >= bill.updated_at => {}
                _ => {
                    merged.insert(*id, bill);
                }
            }
        }

        let mut bills: Vec<Bill> = merged.into_values().cloned().collect();
        bills.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        MergedView {
            bills,
            created_by_me: self.created_by_me.status,
            split_to_me: self.split_to_me.status,
        }
    }
}

/// Reconnection policy for partition feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl FeedConfig {
    /// Delay before the given reconnection attempt (0-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

enum FeedEvent {
    Snapshot(Vec<Bill>),
    Failed(String),
}

/// One partition subscription that resubscribes with backoff after a failure.
struct PartitionFeed<S> {
    partition: Partition,
    user_id: UserId,
    bills: BillRepository<S>,
    config: FeedConfig,
    stream: Option<SnapshotStream>,
    retry_at: Option<Instant>,
    attempt: u32,
}

impl<S: BillStore> PartitionFeed<S> {
    fn new(partition: Partition, user_id: UserId, bills: BillRepository<S>, config: FeedConfig) -> Self {
        Self {
            partition,
            user_id,
            bills,
            config,
            stream: None,
            retry_at: None,
            attempt: 0,
        }
    }

    /// Wait for the next delivery or failure. Safe to cancel: the pending
    /// retry deadline and the open stream survive a dropped call.
    async fn next(&mut self) -> FeedEvent {
        loop {
            if let Some(stream) = self.stream.as_mut() {
                return match stream.next().await {
                    Some(Ok(bills)) => {
                        if self.attempt > 0 {
                            info!(partition = %self.partition, "feed recovered");
                        }
                        self.attempt = 0;
                        FeedEvent::Snapshot(bills)
                    }
                    Some(Err(err)) => {
                        self.schedule_retry();
                        FeedEvent::Failed(err.to_string())
                    }
                    None => {
                        self.schedule_retry();
                        FeedEvent::Failed("subscription ended".to_string())
                    }
                };
            }

            if let Some(deadline) = self.retry_at {
                sleep_until(deadline).await;
            }
            self.retry_at = None;
            debug!(partition = %self.partition, user = %self.user_id, "subscribing");
            self.stream = Some(self.bills.subscribe(self.partition, &self.user_id));
        }
    }

    fn schedule_retry(&mut self) {
        self.stream = None;
        let delay = self.config.backoff(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.retry_at = Some(Instant::now() + delay);
    }
}

/// Running pair of partition feeds for one signed-in user.
///
/// Both subscriptions live in a single task, so they always stop together.
/// Dropping the handle ends the session.
#[derive(Debug)]
pub struct FeedHandle {
    view: watch::Receiver<MergedView>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    /// Subscribe to both partitions for the user and start merging.
    pub fn spawn<S: BillStore>(bills: BillRepository<S>, user_id: UserId, config: FeedConfig) -> Self {
        let (view_tx, view_rx) = watch::channel(MergedView::default());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let mut created = PartitionFeed::new(
            Partition::CreatedByMe,
            user_id.clone(),
            bills.clone(),
            config,
        );
        let mut split = PartitionFeed::new(Partition::SplitToMe, user_id.clone(), bills, config);
        let task_user = user_id;

        let task = tokio::spawn(async move {
            let mut merger = FeedMerger::new();
            info!(user = %task_user, "feeds started");

            loop {
                let (partition, event) = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = created.next() => (Partition::CreatedByMe, event),
                    event = split.next() => (Partition::SplitToMe, event),
                };

                match event {
                    FeedEvent::Snapshot(bills) => {
                        debug!(%partition, count = bills.len(), "snapshot delivered");
                        merger.apply_snapshot(partition, bills);
                    }
                    FeedEvent::Failed(reason) => {
                        warn!(%partition, user = %task_user, %reason, "feed degraded, resubscribing");
                        merger.mark_degraded(partition);
                    }
                }

                let view = merger.view();
                view_tx.send_if_modified(|current| {
                    if *current == view {
                        false
                    } else {
                        *current = view;
                        true
                    }
                });
            }

            info!(user = %task_user, "feeds stopped");
        });

        Self {
            view: view_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// A receiver notified whenever the merged view changes.
    pub fn subscribe(&self) -> watch::Receiver<MergedView> {
        self.view.clone()
    }

    /// Stop both feeds and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
