use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Amount;

pub type BillId = Uuid;

/// Opaque user identifier supplied by the identity provider.
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    Pending,
    Paid,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Pending => "pending",
            BillStatus::Paid => "paid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(BillStatus::Pending),
            "paid" => Some(BillStatus::Paid),
            _ => None,
        }
    }

    /// The other state on the status axis.
    pub fn toggled(&self) -> Self {
        match self {
            BillStatus::Pending => BillStatus::Paid,
            BillStatus::Paid => BillStatus::Pending,
        }
    }
}

impl std::fmt::Display for BillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A participant as it was named in the friend list when the bill was created.
/// Later renames in the friend graph are not reflected here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: UserId,
    pub participant_name: String,
}

impl Participant {
    pub fn new(participant_id: impl Into<UserId>, participant_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            participant_name: participant_name.into(),
        }
    }
}

/// A recorded expense, optionally split among participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub id: BillId,
    /// The user who recorded the bill; never changes
    pub creator_id: UserId,
    /// Always positive
    pub amount: Amount,
    pub description: String,
    /// Everyone sharing the bill except the creator, in entry order
    pub split_participants: Vec<Participant>,
    /// Split participants who confirmed payment of their share
    pub paid_participants: BTreeSet<UserId>,
    pub status: BillStatus,
    /// Assigned by the store, monotonic per write
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bill {
    pub fn is_split(&self) -> bool {
        !self.split_participants.is_empty()
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.split_participants
            .iter()
            .any(|p| p.participant_id == user_id)
    }

    pub fn is_participant_paid(&self, user_id: &str) -> bool {
        self.paid_participants.contains(user_id)
    }

    /// True if every split participant has confirmed payment.
    /// Informational only: it never drives `status`.
    pub fn all_participants_paid(&self) -> bool {
        self.split_participants
            .iter()
            .all(|p| self.paid_participants.contains(&p.participant_id))
    }

    /// How the given user relates to this bill.
    pub fn role_of(&self, user_id: &str) -> Option<BillRole> {
        if self.creator_id == user_id {
            Some(BillRole::Creator)
        } else if self.has_participant(user_id) {
            Some(BillRole::Participant {
                paid: self.is_participant_paid(user_id),
            })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum BillRole {
    Creator,
    Participant { paid: bool },
}

/// Input for recording a bill, before the store assigns identity and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBill {
    pub creator_id: UserId,
    pub amount: Amount,
    pub description: String,
    pub split_participants: Vec<Participant>,
}

impl NewBill {
    pub fn new(
        creator_id: impl Into<UserId>,
        amount: Amount,
        description: impl Into<String>,
        split_participants: Vec<Participant>,
    ) -> Self {
        Self {
            creator_id: creator_id.into(),
            amount,
            description: description.into(),
            split_participants,
        }
    }

    /// Check the bill invariants. The description is trimmed in place.
    pub fn validate(&mut self) -> Result<(), BillValidationError> {
        if self.amount <= Amount::ZERO {
            return Err(BillValidationError::NonPositiveAmount(self.amount));
        }

        let trimmed = self.description.trim();
        if trimmed.is_empty() {
            return Err(BillValidationError::EmptyDescription);
        }
        if trimmed.len() != self.description.len() {
            self.description = trimmed.to_string();
        }

        let mut seen = HashSet::new();
        for participant in &self.split_participants {
            if participant.participant_id == self.creator_id {
                return Err(BillValidationError::CreatorInSplit(
                    participant.participant_id.clone(),
                ));
            }
            if !seen.insert(participant.participant_id.as_str()) {
                return Err(BillValidationError::DuplicateParticipant(
                    participant.participant_id.clone(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillValidationError {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Amount),
    #[error("description must not be empty")]
    EmptyDescription,
    #[error("creator {0} cannot be a split participant")]
    CreatorInSplit(UserId),
    #[error("participant {0} is listed more than once")]
    DuplicateParticipant(UserId),
    #[error("{0} is not in the friend list")]
    UnknownFriend(UserId),
}
