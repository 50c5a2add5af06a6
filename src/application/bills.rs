use std::sync::Arc;

use tracing::info;

use crate::domain::{Amount, Bill, BillId, BillStatus, NewBill, Participant};
use crate::storage::{BillPatch, BillQuery, BillStore, SnapshotStream};

use super::AppError;

/// The two independently subscribed subsets of a user's bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    CreatedByMe,
    SplitToMe,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::CreatedByMe => "created-by-me",
            Partition::SplitToMe => "split-to-me",
        }
    }

    pub fn query(&self, user_id: &str) -> BillQuery {
        match self {
            Partition::CreatedByMe => BillQuery::CreatedBy(user_id.to_string()),
            Partition::SplitToMe => BillQuery::SplitTo(user_id.to_string()),
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Turns ledger intents into store calls and enforces the bill invariants
/// at the write boundary. The only component that writes to the store.
pub struct BillRepository<S> {
    store: Arc<S>,
}

impl<S> Clone for BillRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: BillStore> BillRepository<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Validate and record a new bill.
    pub async fn create_bill(
        &self,
        creator_id: &str,
        amount: Amount,
        description: &str,
        split_participants: Vec<Participant>,
    ) -> Result<Bill, AppError> {
        let mut new_bill = NewBill::new(creator_id, amount, description, split_participants);
        new_bill.validate()?;

        let bill = self.store.insert(new_bill).await?;
        info!(
            bill_id = %bill.id,
            creator = %bill.creator_id,
            amount = %bill.amount,
            participants = bill.split_participants.len(),
            "bill created"
        );
        Ok(bill)
    }

    pub async fn get_bill(&self, bill_id: BillId) -> Result<Bill, AppError> {
        self.store
            .get(bill_id)
            .await?
            .ok_or(AppError::BillNotFound(bill_id))
    }

    pub async fn update_status(
        &self,
        bill_id: BillId,
        new_status: BillStatus,
    ) -> Result<Bill, AppError> {
        let bill = self
            .store
            .update(bill_id, BillPatch::SetStatus(new_status))
            .await?
            .ok_or(AppError::BillNotFound(bill_id))?;
        info!(bill_id = %bill_id, status = %new_status, "bill status updated");
        Ok(bill)
    }

    /// Mark one split participant's share as paid or unpaid.
    /// A participant not on the split list leaves the bill untouched.
    pub async fn set_participant_paid(
        &self,
        bill_id: BillId,
        participant_id: &str,
        paid: bool,
    ) -> Result<Bill, AppError> {
        let bill = self.get_bill(bill_id).await?;
        if !bill.has_participant(participant_id) {
            return Err(AppError::NoSuchParticipant {
                bill_id,
                participant_id: participant_id.to_string(),
            });
        }

        let patch = if paid {
            BillPatch::MarkParticipantPaid(participant_id.to_string())
        } else {
            BillPatch::MarkParticipantUnpaid(participant_id.to_string())
        };

        let bill = self
            .store
            .update(bill_id, patch)
            .await?
            .ok_or(AppError::BillNotFound(bill_id))?;
        info!(bill_id = %bill_id, participant = participant_id, paid, "participant payment updated");
        Ok(bill)
    }

    /// Delete a bill. Only its creator may do so.
    pub async fn delete_bill(&self, bill_id: BillId, requester_id: &str) -> Result<(), AppError> {
        let bill = self.get_bill(bill_id).await?;
        if bill.creator_id != requester_id {
            return Err(AppError::Forbidden {
                bill_id,
                requester_id: requester_id.to_string(),
            });
        }

        if !self.store.delete(bill_id).await? {
            return Err(AppError::BillNotFound(bill_id));
        }
        info!(bill_id = %bill_id, "bill deleted");
        Ok(())
    }

    /// Live feed of the bills the user created.
    pub fn subscribe_created_by(&self, user_id: &str) -> SnapshotStream {
        self.subscribe(Partition::CreatedByMe, user_id)
    }

    /// Live feed of the bills split to the user by someone else.
    pub fn subscribe_split_to(&self, user_id: &str) -> SnapshotStream {
        self.subscribe(Partition::SplitToMe, user_id)
    }

    pub fn subscribe(&self, partition: Partition, user_id: &str) -> SnapshotStream {
        self.store.subscribe(partition.query(user_id))
    }
}
