//! Seams to the services the ledger relies on but does not own:
//! identity, the friend graph and inbox delivery.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Amount, Bill, BillId, UserId, format_amount, share_of};
use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
}

impl User {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Supplies the signed-in user. `None` means signed out.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<User>;
}

/// Identity fixed at construction, e.g. from command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<User>,
}

impl StaticIdentity {
    pub fn signed_in(user: User) -> Self {
        Self { user: Some(user) }
    }

    pub fn signed_out() -> Self {
        Self { user: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<User> {
        self.user.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    pub id: UserId,
    pub name: String,
}

/// Read-only view of a user's friends, used to pick split participants.
pub trait FriendDirectory: Send + Sync + 'static {
    fn list_friends(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Friend>, StoreError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationMetadata {
    ExpenseSplit {
        bill_id: BillId,
        amount: Amount,
        description: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: UserId,
    pub sender_id: UserId,
    pub message: String,
    pub metadata: NotificationMetadata,
}

impl Notification {
    /// Tell a split participant they were added to a bill.
    pub fn expense_split(bill: &Bill, recipient_id: &str, sender_name: &str) -> Self {
        let message = match share_of(bill) {
            Ok(share) => format!(
                "{} split \"{}\" with you. Your share: {}",
                sender_name,
                bill.description,
                format_amount(share)
            ),
            Err(_) => format!("{} split \"{}\" with you", sender_name, bill.description),
        };

        Self {
            recipient_id: recipient_id.to_string(),
            sender_id: bill.creator_id.clone(),
            message,
            metadata: NotificationMetadata::ExpenseSplit {
                bill_id: bill.id,
                amount: bill.amount,
                description: bill.description.clone(),
            },
        }
    }
}

/// A delivered notification as read back from an inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: Uuid,
    pub notification: Notification,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification to {recipient} failed: {reason}")]
    Dispatch { recipient: UserId, reason: String },
}

/// Fire-and-forget inbox delivery.
pub trait Notifier: Send + Sync + 'static {
    fn send(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}
