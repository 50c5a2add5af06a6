use thiserror::Error;

use super::{Amount, Bill, BillId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShareError {
    #[error("bill {bill_id} has a non-positive amount: {amount}")]
    InvalidAmount { bill_id: BillId, amount: Amount },
}

/// Number of people sharing a bill: every split participant plus the creator.
pub fn sharers(bill: &Bill) -> usize {
    bill.split_participants.len() + 1
}

/// Each sharer's portion of the bill: `amount / (participants + 1)`.
///
/// Division is exact decimal arithmetic; nothing is rounded here. An unsplit
/// bill yields the full amount.
pub fn share_of(bill: &Bill) -> Result<Amount, ShareError> {
    if bill.amount <= Amount::ZERO {
        return Err(ShareError::InvalidAmount {
            bill_id: bill.id,
            amount: bill.amount,
        });
    }

    Ok(bill.amount / Amount::from(sharers(bill)))
}

/// The creator counts as having paid their share when the bill was recorded.
pub fn is_full_payer(bill: &Bill, user_id: &str) -> bool {
    bill.creator_id == user_id
}
