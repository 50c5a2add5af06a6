use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::domain::{Amount, Bill, BillId, BillValidationError, Participant, UserId};
use crate::storage::{BillStore, SqliteStore};

use super::{
    AggregateStream, AppError, BillRepository, BillSummary, FeedConfig, FeedHandle, Friend,
    FriendDirectory, IdentityProvider, InboxEntry, LiveAggregate, MergedView, Notification,
    Notifier, User, month_summaries, watch_aggregate,
};

/// Application service providing the high-level ledger operations.
/// This is the primary interface for any client (CLI, API, TUI, etc.).
///
/// Holds at most one session: the live feeds of the signed-in user.
pub struct Ledger<S, F, N> {
    bills: BillRepository<S>,
    friends: Arc<F>,
    notifier: Arc<N>,
    identity: Arc<dyn IdentityProvider>,
    feed_config: FeedConfig,
    session: Mutex<Option<Session>>,
    dispatches: Mutex<JoinSet<()>>,
}

struct Session {
    user: User,
    feeds: FeedHandle,
}

/// The ledger wired to a single SQLite database for store, friends and inbox.
pub type SqliteLedger = Ledger<SqliteStore, SqliteStore, SqliteStore>;

impl SqliteLedger {
    /// Initialize a new database at the given path.
    pub async fn init(
        database_path: &str,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let store = Arc::new(SqliteStore::init(&db_url).await?);
        Ok(Self::new(store.clone(), store.clone(), store, identity))
    }

    /// Connect to an existing database.
    pub async fn connect(
        database_path: &str,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}", database_path);
        let store = Arc::new(SqliteStore::connect(&db_url).await?);
        Ok(Self::new(store.clone(), store.clone(), store, identity))
    }

    /// Add a friend for the signed-in user.
    pub async fn add_friend(&self, friend_id: &str, name: &str) -> Result<Friend, AppError> {
        let user = self.current_user()?;
        Ok(self.friends.add_friend(&user.id, friend_id, name).await?)
    }

    /// Notifications delivered to the signed-in user.
    pub async fn inbox(&self) -> Result<Vec<InboxEntry>, AppError> {
        let user = self.current_user()?;
        Ok(self.notifier.list_inbox(&user.id).await?)
    }
}

impl<S, F, N> Ledger<S, F, N>
where
    S: BillStore,
    F: FriendDirectory,
    N: Notifier,
{
    pub fn new(
        store: Arc<S>,
        friends: Arc<F>,
        notifier: Arc<N>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            bills: BillRepository::new(store),
            friends,
            notifier,
            identity,
            feed_config: FeedConfig::default(),
            session: Mutex::new(None),
            dispatches: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_feed_config(mut self, feed_config: FeedConfig) -> Self {
        self.feed_config = feed_config;
        self
    }

    pub fn bills(&self) -> &BillRepository<S> {
        &self.bills
    }

    /// The signed-in user, as reported by the identity provider.
    pub fn current_user(&self) -> Result<User, AppError> {
        self.identity.current_user().ok_or(AppError::NotSignedIn)
    }

    // ========================
    // Session operations
    // ========================

    /// Start (or keep) the live feeds for the signed-in user.
    /// If the identity changed, the previous user's feeds are stopped first.
    pub async fn sign_in(&self) -> Result<User, AppError> {
        let Some(user) = self.identity.current_user() else {
            self.sign_out().await;
            return Err(AppError::NotSignedIn);
        };

        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| s.user.id == user.id) {
            return Ok(user);
        }

        if let Some(previous) = session.take() {
            previous.feeds.shutdown().await;
        }

        let feeds = FeedHandle::spawn(self.bills.clone(), user.id.clone(), self.feed_config);
        info!(user = %user.id, "session started");
        *session = Some(Session {
            user: user.clone(),
            feeds,
        });
        Ok(user)
    }

    /// Stop both feeds of the active session, if any.
    pub async fn sign_out(&self) {
        if let Some(session) = self.session.lock().await.take() {
            info!(user = %session.user.id, "session ended");
            session.feeds.shutdown().await;
        }
    }

    /// Observe the merged view of the active session.
    pub async fn merged_view(&self) -> Result<watch::Receiver<MergedView>, AppError> {
        let session = self.session.lock().await;
        session
            .as_ref()
            .map(|s| s.feeds.subscribe())
            .ok_or(AppError::NotSignedIn)
    }

    /// Wait until both feeds of the active session have reported once.
    pub async fn settled_view(&self) -> Result<MergedView, AppError> {
        let mut view = self.merged_view().await?;
        if let Ok(settled) = view.wait_for(MergedView::is_settled).await {
            return Ok(settled.clone());
        }
        Ok(view.borrow().clone())
    }

    // ========================
    // Bill operations
    // ========================

    /// Friends of the signed-in user who can be added to a bill.
    pub async fn candidate_participants(&self) -> Result<Vec<Friend>, AppError> {
        let user = self.current_user()?;
        Ok(self.friends.list_friends(&user.id).await?)
    }

    /// Record a bill and notify every split participant.
    ///
    /// Notifications go out in the background after the bill is stored;
    /// a failed delivery is logged and never undoes the bill.
    pub async fn create_bill(
        &self,
        creator_id: &str,
        amount: Amount,
        description: &str,
        split_participants: Vec<Participant>,
    ) -> Result<Bill, AppError> {
        let bill = self
            .bills
            .create_bill(creator_id, amount, description, split_participants)
            .await?;

        let sender_name = match self.identity.current_user() {
            Some(user) if user.id == bill.creator_id => user.display_name,
            _ => bill.creator_id.clone(),
        };
        self.dispatch_split_notifications(&bill, &sender_name).await;

        Ok(bill)
    }

    /// Record a bill for the signed-in user, splitting it with the given
    /// friends. Names are copied from the friend list as it is right now.
    pub async fn create_bill_with_friends(
        &self,
        amount: Amount,
        description: &str,
        friend_ids: &[UserId],
    ) -> Result<Bill, AppError> {
        let user = self.current_user()?;
        let friends: HashMap<UserId, String> = self
            .friends
            .list_friends(&user.id)
            .await?
            .into_iter()
            .map(|f| (f.id, f.name))
            .collect();

        let mut participants = Vec::with_capacity(friend_ids.len());
        for friend_id in friend_ids {
            // Creator and duplicates are rejected by validation
            if friend_id == &user.id {
                participants.push(Participant::new(friend_id.clone(), user.display_name.clone()));
                continue;
            }
            let name = friends
                .get(friend_id)
                .ok_or_else(|| BillValidationError::UnknownFriend(friend_id.clone()))?;
            participants.push(Participant::new(friend_id.clone(), name.clone()));
        }

        self.create_bill(&user.id, amount, description, participants)
            .await
    }

    async fn dispatch_split_notifications(&self, bill: &Bill, sender_name: &str) {
        if !bill.is_split() {
            return;
        }
        let notifications: Vec<Notification> = bill
            .split_participants
            .iter()
            .map(|p| Notification::expense_split(bill, &p.participant_id, sender_name))
            .collect();
        let notifier = Arc::clone(&self.notifier);
        let bill_id = bill.id;

        let mut dispatches = self.dispatches.lock().await;
        while dispatches.try_join_next().is_some() {}
        dispatches.spawn(async move {
            for notification in &notifications {
                if let Err(err) = notifier.send(notification).await {
                    warn!(
                        bill_id = %bill_id,
                        recipient = %notification.recipient_id,
                        %err,
                        "split notification not delivered"
                    );
                }
            }
        });
    }

    /// Wait for every notification dispatch started so far.
    pub async fn flush_notifications(&self) {
        let mut pending = std::mem::take(&mut *self.dispatches.lock().await);
        while pending.join_next().await.is_some() {}
    }

    pub async fn get_bill(&self, bill_id: BillId) -> Result<Bill, AppError> {
        self.bills.get_bill(bill_id).await
    }

    /// Flip the bill's overall status. Participant payments are untouched.
    ///
    /// Reads the current status, then writes its opposite: two concurrent
    /// toggles can both write the same value (last write wins).
    pub async fn toggle_status(&self, bill_id: BillId) -> Result<Bill, AppError> {
        let bill = self.bills.get_bill(bill_id).await?;
        self.bills
            .update_status(bill_id, bill.status.toggled())
            .await
    }

    /// Flip one participant between paid and unpaid. The bill status is untouched.
    ///
    /// Read-then-write like `toggle_status`: concurrent toggles of the same
    /// participant are not serialized.
    pub async fn toggle_participant_paid(
        &self,
        bill_id: BillId,
        participant_id: &str,
    ) -> Result<Bill, AppError> {
        let bill = self.bills.get_bill(bill_id).await?;
        if !bill.has_participant(participant_id) {
            return Err(AppError::NoSuchParticipant {
                bill_id,
                participant_id: participant_id.to_string(),
            });
        }
        let paid = !bill.is_participant_paid(participant_id);
        self.bills
            .set_participant_paid(bill_id, participant_id, paid)
            .await
    }

    pub async fn delete_bill(&self, bill_id: BillId, requester_id: &str) -> Result<(), AppError> {
        self.bills.delete_bill(bill_id, requester_id).await
    }

    // ========================
    // Aggregate operations
    // ========================

    /// Live monthly figures for the user of the active session.
    pub async fn live_aggregate(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> Result<AggregateStream, AppError> {
        let view = self.session_view(user_id).await?;
        Ok(watch_aggregate(view, user_id.to_string(), year, month)?)
    }

    /// Monthly figures computed from the current merged view.
    pub async fn monthly_aggregate(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> Result<LiveAggregate, AppError> {
        let view = self.session_view(user_id).await?;
        let current = view.borrow().clone();
        Ok(LiveAggregate::from_view(&current, user_id, year, month)?)
    }

    /// Bills of the active session's user created in the given month.
    pub async fn bills_for_month(&self, year: i32, month: u32) -> Result<Vec<BillSummary>, AppError> {
        let user = self.current_user()?;
        let view = self.session_view(&user.id).await?;
        let current = view.borrow().clone();
        Ok(month_summaries(&current, &user.id, year, month)?)
    }

    async fn session_view(&self, user_id: &str) -> Result<watch::Receiver<MergedView>, AppError> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(active) if active.user.id == user_id => Ok(active.feeds.subscribe()),
            _ => Err(AppError::NotSignedIn),
        }
    }
}
