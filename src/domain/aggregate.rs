use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Amount, Bill, ShareError, is_full_payer, share_of};

/// Paid/owed figures for one user and one calendar month.
/// Derived from the merged bill view; never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    /// What the user personally spent: their share of bills they created
    pub monthly_total: Amount,
    /// Creator shares plus split shares the user has marked paid
    pub amount_paid_by_user: Amount,
    /// Split shares the user still has to pay
    pub amount_owed_by_user: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("invalid period: {year}-{month:02}")]
    InvalidPeriod { year: i32, month: u32 },
    #[error("totals for {year}-{month:02} exceed the largest representable amount")]
    Overflow { year: i32, month: u32 },
    #[error(transparent)]
    Share(#[from] ShareError),
}

/// Half-open UTC bounds `[start, end)` of a calendar month.
pub fn month_bounds(year: i32, month: u32) -> Result<(DateTime<Utc>, DateTime<Utc>), AggregateError> {
    let invalid = || AggregateError::InvalidPeriod { year, month };

    let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(invalid)?;

    let start = start.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc();
    let end = next.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc();
    Ok((start, end))
}

/// True if the bill was created inside the given month.
pub fn in_month(bill: &Bill, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    bill.created_at >= start && bill.created_at < end
}

/// Compute the user's figures for a month from a snapshot of bills.
///
/// For bills the user created, their share counts as paid and as spent.
/// For bills split to the user, the share is paid or owed depending on
/// whether they are in `paid_participants`. The bill's `status` plays no part.
pub fn compute_monthly(
    bills: &[Bill],
    user_id: &str,
    year: i32,
    month: u32,
) -> Result<MonthlyAggregate, AggregateError> {
    let (start, end) = month_bounds(year, month)?;
    let add = |total: Amount, share: Amount| {
        total
            .checked_add(share)
            .ok_or(AggregateError::Overflow { year, month })
    };
    let mut aggregate = MonthlyAggregate::default();

    for bill in bills.iter().filter(|b| in_month(b, start, end)) {
        if is_full_payer(bill, user_id) {
            let share = share_of(bill)?;
            aggregate.amount_paid_by_user = add(aggregate.amount_paid_by_user, share)?;
            aggregate.monthly_total = add(aggregate.monthly_total, share)?;
        } else if bill.has_participant(user_id) {
            let share = share_of(bill)?;
            if bill.is_participant_paid(user_id) {
                aggregate.amount_paid_by_user = add(aggregate.amount_paid_by_user, share)?;
            } else {
                aggregate.amount_owed_by_user = add(aggregate.amount_owed_by_user, share)?;
            }
        }
    }

    Ok(aggregate)
}
