use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::domain::{
    AggregateError, Amount, Bill, BillRole, MonthlyAggregate, UserId, compute_monthly, in_month,
    month_bounds, share_of,
};

use super::MergedView;

/// Aggregates buffered for a slow observer.
const AGGREGATE_BUFFER: usize = 16;

/// A monthly aggregate as published to observers of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveAggregate {
    pub aggregate: MonthlyAggregate,
    /// At least one partition has not delivered, or is degraded
    pub possibly_incomplete: bool,
}

impl LiveAggregate {
    pub fn from_view(
        view: &MergedView,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> Result<Self, AggregateError> {
        Ok(Self {
            aggregate: compute_monthly(&view.bills, user_id, year, month)?,
            possibly_incomplete: !view.is_complete(),
        })
    }
}

/// One bill of the merged view, with the viewer's share and role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillSummary {
    pub bill: Bill,
    pub share: Amount,
    pub role: BillRole,
}

/// Bills from the view created in the given month that involve the user.
pub fn month_summaries(
    view: &MergedView,
    user_id: &str,
    year: i32,
    month: u32,
) -> Result<Vec<BillSummary>, AggregateError> {
    let (start, end) = month_bounds(year, month)?;

    let mut summaries = Vec::new();
    for bill in view.bills.iter().filter(|b| in_month(b, start, end)) {
        if let Some(role) = bill.role_of(user_id) {
            summaries.push(BillSummary {
                share: share_of(bill)?,
                bill: bill.clone(),
                role,
            });
        }
    }
    Ok(summaries)
}

/// Stream of distinct aggregates. Ends when the session's feeds stop.
#[derive(Debug)]
pub struct AggregateStream {
    rx: mpsc::Receiver<LiveAggregate>,
}

impl AggregateStream {
    pub async fn next(&mut self) -> Option<LiveAggregate> {
        self.rx.recv().await
    }
}

/// Recompute the aggregate on every merged-view change and publish it only
/// when its value differs from the last one published.
pub fn watch_aggregate(
    mut view: watch::Receiver<MergedView>,
    user_id: UserId,
    year: i32,
    month: u32,
) -> Result<AggregateStream, AggregateError> {
    month_bounds(year, month)?;
    let (tx, rx) = mpsc::channel(AGGREGATE_BUFFER);

    tokio::spawn(async move {
        let mut last: Option<LiveAggregate> = None;
        loop {
            let next = {
                let current = view.borrow_and_update();
                LiveAggregate::from_view(&current, &user_id, year, month)
            };

            match next {
                Ok(aggregate) if last != Some(aggregate) => {
                    debug!(user = %user_id, year, month, ?aggregate, "aggregate changed");
                    last = Some(aggregate);
                    if tx.send(aggregate).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(user = %user_id, %err, "skipping aggregate for invalid bill set"),
            }

            tokio::select! {
                _ = tx.closed() => break,
                changed = view.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(AggregateStream { rx })
}
