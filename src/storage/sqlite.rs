use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::{
    Friend, FriendDirectory, InboxEntry, Notification, Notifier, NotifyError,
};
use crate::domain::{Bill, BillId, BillStatus, NewBill, Participant};

use super::{BillPatch, BillQuery, BillStore, MIGRATION_001_INITIAL, SnapshotStream, StoreError};

/// Pending change signals kept for slow subscribers. Overflow only means a
/// subscriber re-queries once for several writes.
const CHANGE_BUFFER: usize = 64;

const BILL_COLUMNS: &str = "id, creator_id, amount, description, status, created_at, updated_at";

/// SQLite-backed bill store with in-process change notification.
///
/// Every committed write pings a broadcast channel; each live subscription
/// re-runs its query on a ping and pushes the full result set.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    changes: broadcast::Sender<()>,
    /// Last assigned write timestamp, in microseconds since the epoch
    last_write: Arc<AtomicI64>,
}

impl SqliteStore {
    /// Create a new store with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            pool,
            changes,
            last_write: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Connect to an existing SQLite database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        let store = Self::new(pool);
        store.seed_clock().await?;
        Ok(store)
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        let store = Self::new(pool);
        store.migrate().await?;
        store.seed_clock().await?;
        info!(database_url, "database initialized");
        Ok(store)
    }

    /// Continue write timestamps after the newest one already stored, so
    /// ordering holds across processes sharing the file.
    async fn seed_clock(&self) -> Result<()> {
        let row = sqlx::query("SELECT MAX(updated_at) as last_write FROM bills")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read last write time (is the database initialized?)")?;

        let last: Option<String> = row.get("last_write");
        if let Some(last) = last {
            let last = parse_time(&last, "last write")?;
            self.last_write
                .fetch_max(last.timestamp_micros(), Ordering::SeqCst);
        }
        Ok(())
    }

    /// Strictly increasing timestamp for the next write.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let previous = self
            .last_write
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        DateTime::from_timestamp_micros(now.max(previous + 1)).unwrap_or_else(Utc::now)
    }

    fn notify_change(&self) {
        // No receivers just means nobody is subscribed
        let _ = self.changes.send(());
    }

    // ========================
    // Bill operations
    // ========================

    async fn insert_bill(&self, bill: NewBill) -> Result<Bill, StoreError> {
        let now = self.next_timestamp();
        let id = Uuid::new_v4();
        let id_str = id.to_string();
        let now_str = format_time(now);

        let mut tx = self
            .pool
            .begin()
            .await
            .store_context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO bills (id, creator_id, amount, description, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id_str)
        .bind(&bill.creator_id)
        .bind(bill.amount.to_string())
        .bind(&bill.description)
        .bind(BillStatus::Pending.as_str())
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *tx)
        .await
        .store_context("Failed to save bill")?;

        for (position, participant) in bill.split_participants.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO bill_participants (bill_id, position, participant_id, participant_name)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&id_str)
            .bind(position as i64)
            .bind(&participant.participant_id)
            .bind(&participant.participant_name)
            .execute(&mut *tx)
            .await
            .store_context("Failed to save bill participant")?;
        }

        tx.commit().await.store_context("Failed to commit bill")?;
        self.notify_change();

        Ok(Bill {
            id,
            creator_id: bill.creator_id,
            amount: bill.amount,
            description: bill.description,
            split_participants: bill.split_participants,
            paid_participants: BTreeSet::new(),
            status: BillStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_bill(&self, id: BillId, patch: BillPatch) -> Result<Option<Bill>, StoreError> {
        let id_str = id.to_string();
        let now_str = format_time(self.next_timestamp());

        let mut tx = self
            .pool
            .begin()
            .await
            .store_context("Failed to begin transaction")?;

        let touched = sqlx::query("UPDATE bills SET updated_at = ? WHERE id = ?")
            .bind(&now_str)
            .bind(&id_str)
            .execute(&mut *tx)
            .await
            .store_context("Failed to touch bill")?
            .rows_affected();
        if touched == 0 {
            return Ok(None);
        }

        match &patch {
            BillPatch::SetStatus(status) => {
                sqlx::query("UPDATE bills SET status = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(&id_str)
                    .execute(&mut *tx)
                    .await
                    .store_context("Failed to update bill status")?;
            }
            BillPatch::MarkParticipantPaid(participant_id) => {
                // Only split participants can be marked paid
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO bill_paid_participants (bill_id, participant_id)
                    SELECT bill_id, participant_id
                    FROM bill_participants
                    WHERE bill_id = ? AND participant_id = ?
                    "#,
                )
                .bind(&id_str)
                .bind(participant_id)
                .execute(&mut *tx)
                .await
                .store_context("Failed to mark participant paid")?;
            }
            BillPatch::MarkParticipantUnpaid(participant_id) => {
                sqlx::query(
                    "DELETE FROM bill_paid_participants WHERE bill_id = ? AND participant_id = ?",
                )
                .bind(&id_str)
                .bind(participant_id)
                .execute(&mut *tx)
                .await
                .store_context("Failed to mark participant unpaid")?;
            }
        }

        tx.commit().await.store_context("Failed to commit bill update")?;
        self.notify_change();
        debug!(bill_id = %id, ?patch, "bill updated");

        self.get_bill(id).await
    }

    async fn delete_bill(&self, id: BillId) -> Result<bool, StoreError> {
        let id_str = id.to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .store_context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM bill_paid_participants WHERE bill_id = ?")
            .bind(&id_str)
            .execute(&mut *tx)
            .await
            .store_context("Failed to delete paid participants")?;
        sqlx::query("DELETE FROM bill_participants WHERE bill_id = ?")
            .bind(&id_str)
            .execute(&mut *tx)
            .await
            .store_context("Failed to delete bill participants")?;
        let deleted = sqlx::query("DELETE FROM bills WHERE id = ?")
            .bind(&id_str)
            .execute(&mut *tx)
            .await
            .store_context("Failed to delete bill")?
            .rows_affected();

        tx.commit().await.store_context("Failed to commit bill deletion")?;

        if deleted > 0 {
            self.notify_change();
        }
        Ok(deleted > 0)
    }

    async fn get_bill(&self, id: BillId) -> Result<Option<Bill>, StoreError> {
        let mut bills = self.load_bills("id = ?", &id.to_string()).await?;
        Ok(bills.pop())
    }

    async fn query_bills(&self, query: &BillQuery) -> Result<Vec<Bill>, StoreError> {
        match query {
            BillQuery::CreatedBy(user_id) => self.load_bills("creator_id = ?", user_id).await,
            BillQuery::SplitTo(user_id) => {
                self.load_bills(
                    "id IN (SELECT bill_id FROM bill_participants WHERE participant_id = ?)",
                    user_id,
                )
                .await
            }
        }
    }

    /// Load bills matching a single-parameter filter, newest first, with
    /// their participants and payments read in the same transaction.
    async fn load_bills(&self, filter: &str, value: &str) -> Result<Vec<Bill>, StoreError> {
        let bills_sql = format!(
            "SELECT {BILL_COLUMNS} FROM bills WHERE {filter} ORDER BY created_at DESC, id ASC"
        );
        let participants_sql = format!(
            "SELECT bill_id, participant_id, participant_name FROM bill_participants \
             WHERE bill_id IN (SELECT id FROM bills WHERE {filter}) ORDER BY bill_id, position"
        );
        let paid_sql = format!(
            "SELECT bill_id, participant_id FROM bill_paid_participants \
             WHERE bill_id IN (SELECT id FROM bills WHERE {filter})"
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .store_context("Failed to begin transaction")?;

        let bill_rows = sqlx::query(&bills_sql)
            .bind(value)
            .fetch_all(&mut *tx)
            .await
            .store_context("Failed to list bills")?;
        let participant_rows = sqlx::query(&participants_sql)
            .bind(value)
            .fetch_all(&mut *tx)
            .await
            .store_context("Failed to list bill participants")?;
        let paid_rows = sqlx::query(&paid_sql)
            .bind(value)
            .fetch_all(&mut *tx)
            .await
            .store_context("Failed to list paid participants")?;

        tx.commit().await.store_context("Failed to finish read")?;

        let mut participants: HashMap<String, Vec<Participant>> = HashMap::new();
        for row in &participant_rows {
            participants
                .entry(row.get("bill_id"))
                .or_default()
                .push(Participant::new(
                    row.get::<String, _>("participant_id"),
                    row.get::<String, _>("participant_name"),
                ));
        }

        let mut paid: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in &paid_rows {
            paid.entry(row.get("bill_id"))
                .or_default()
                .insert(row.get("participant_id"));
        }

        bill_rows
            .iter()
            .map(|row| {
                let id: String = row.get("id");
                Self::row_to_bill(
                    row,
                    participants.remove(&id).unwrap_or_default(),
                    paid.remove(&id).unwrap_or_default(),
                )
                .map_err(StoreError::Backend)
            })
            .collect()
    }

    fn row_to_bill(
        row: &SqliteRow,
        split_participants: Vec<Participant>,
        paid_participants: BTreeSet<String>,
    ) -> Result<Bill> {
        let id_str: String = row.get("id");
        let amount_str: String = row.get("amount");
        let status_str: String = row.get("status");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Bill {
            id: Uuid::parse_str(&id_str).context("Invalid bill ID")?,
            creator_id: row.get("creator_id"),
            amount: Decimal::from_str(&amount_str)
                .with_context(|| format!("Invalid bill amount: {}", amount_str))?,
            description: row.get("description"),
            split_participants,
            paid_participants,
            status: BillStatus::from_str(&status_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid bill status: {}", status_str))?,
            created_at: parse_time(&created_at_str, "created_at")?,
            updated_at: parse_time(&updated_at_str, "updated_at")?,
        })
    }

    // ========================
    // Friend operations
    // ========================

    /// Add a friend, or rename an existing one.
    pub async fn add_friend(&self, user_id: &str, friend_id: &str, friend_name: &str) -> Result<Friend> {
        sqlx::query(
            r#"
            INSERT INTO friends (user_id, friend_id, friend_name, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id, friend_id) DO UPDATE SET friend_name = excluded.friend_name
            "#,
        )
        .bind(user_id)
        .bind(friend_id)
        .bind(friend_name)
        .bind(format_time(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to save friend")?;

        Ok(Friend {
            id: friend_id.to_string(),
            name: friend_name.to_string(),
        })
    }

    // ========================
    // Inbox operations
    // ========================

    /// List notifications delivered to a user, newest first.
    pub async fn list_inbox(&self, recipient_id: &str) -> Result<Vec<InboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, recipient_id, sender_id, message, metadata, created_at
            FROM notifications
            WHERE recipient_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list notifications")?;

        rows.iter().map(Self::row_to_inbox_entry).collect()
    }

    fn row_to_inbox_entry(row: &SqliteRow) -> Result<InboxEntry> {
        let id_str: String = row.get("id");
        let metadata_json: String = row.get("metadata");
        let created_at_str: String = row.get("created_at");

        Ok(InboxEntry {
            id: Uuid::parse_str(&id_str).context("Invalid notification ID")?,
            notification: Notification {
                recipient_id: row.get("recipient_id"),
                sender_id: row.get("sender_id"),
                message: row.get("message"),
                metadata: serde_json::from_str(&metadata_json)
                    .context("Invalid notification metadata")?,
            },
            created_at: parse_time(&created_at_str, "created_at")?,
        })
    }
}

impl BillStore for SqliteStore {
    async fn insert(&self, bill: NewBill) -> Result<Bill, StoreError> {
        self.insert_bill(bill).await
    }

    async fn update(&self, id: BillId, patch: BillPatch) -> Result<Option<Bill>, StoreError> {
        self.update_bill(id, patch).await
    }

    async fn delete(&self, id: BillId) -> Result<bool, StoreError> {
        self.delete_bill(id).await
    }

    async fn get(&self, id: BillId) -> Result<Option<Bill>, StoreError> {
        self.get_bill(id).await
    }

    async fn query(&self, query: &BillQuery) -> Result<Vec<Bill>, StoreError> {
        self.query_bills(query).await
    }

    fn subscribe(&self, query: BillQuery) -> SnapshotStream {
        let (tx, stream) = SnapshotStream::channel();
        let store = self.clone();
        // Register before the first read so no write can slip between them
        let mut changes = self.changes.subscribe();

        tokio::spawn(async move {
            debug!(?query, "subscription started");
            loop {
                let snapshot = store.query_bills(&query).await;
                let failed = snapshot.is_err();
                if tx.send(snapshot).await.is_err() || failed {
                    break;
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    changed = changes.recv() => match changed {
                        Ok(()) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(?query, "subscription ended");
        });

        stream
    }
}

impl FriendDirectory for SqliteStore {
    async fn list_friends(&self, user_id: &str) -> Result<Vec<Friend>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT friend_id, friend_name
            FROM friends
            WHERE user_id = ?
            ORDER BY friend_name, friend_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .store_context("Failed to list friends")?;

        Ok(rows
            .iter()
            .map(|row| Friend {
                id: row.get("friend_id"),
                name: row.get("friend_name"),
            })
            .collect())
    }
}

impl Notifier for SqliteStore {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let dispatch_error = |reason: String| NotifyError::Dispatch {
            recipient: notification.recipient_id.clone(),
            reason,
        };

        let metadata =
            serde_json::to_string(&notification.metadata).map_err(|e| dispatch_error(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient_id, sender_id, message, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&notification.recipient_id)
        .bind(&notification.sender_id)
        .bind(&notification.message)
        .bind(metadata)
        .bind(format_time(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| dispatch_error(e.to_string()))?;

        Ok(())
    }
}

/// Fixed-width UTC timestamps, so text order matches time order.
fn format_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str, field: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid {} timestamp", field))?
        .with_timezone(&Utc))
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => true,
        // SQLITE_BUSY / SQLITE_LOCKED
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

trait StoreContext<T> {
    fn store_context(self, context: &'static str) -> Result<T, StoreError>;
}

impl<T> StoreContext<T> for Result<T, sqlx::Error> {
    fn store_context(self, context: &'static str) -> Result<T, StoreError> {
        self.map_err(|err| {
            if is_transient(&err) {
                StoreError::Unavailable(format!("{}: {}", context, err))
            } else {
                StoreError::Backend(anyhow::Error::new(err).context(context))
            }
        })
    }
}
