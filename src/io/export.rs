use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::application::{BillSummary, FriendDirectory, Ledger, LiveAggregate, Notifier};
use crate::domain::{BillRole, UserId, format_amount};
use crate::storage::BillStore;

/// A user's month as seen through the merged view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub user_id: UserId,
    pub year: i32,
    pub month: u32,
    pub summary: LiveAggregate,
    pub bills: Vec<BillSummary>,
}

/// Exporter for a signed-in user's monthly bills.
/// Both exports wait for the session's feeds to report once.
pub struct Exporter<'a, S, F, N> {
    ledger: &'a Ledger<S, F, N>,
}

impl<'a, S, F, N> Exporter<'a, S, F, N>
where
    S: BillStore,
    F: FriendDirectory,
    N: Notifier,
{
    pub fn new(ledger: &'a Ledger<S, F, N>) -> Self {
        Self { ledger }
    }

    /// Export the month's bills to CSV format
    pub async fn export_bills_csv<W: Write>(&self, writer: W, year: i32, month: u32) -> Result<usize> {
        self.ledger.settled_view().await?;
        let bills = self.ledger.bills_for_month(year, month).await?;
        write_bills_csv(writer, &bills)
    }

    /// Export the month's bills and totals as a JSON snapshot
    pub async fn export_month_json<W: Write>(
        &self,
        mut writer: W,
        year: i32,
        month: u32,
    ) -> Result<MonthSnapshot> {
        let user = self.ledger.current_user()?;
        self.ledger.settled_view().await?;
        let bills = self.ledger.bills_for_month(year, month).await?;
        let summary = self.ledger.monthly_aggregate(&user.id, year, month).await?;

        let snapshot = MonthSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            user_id: user.id,
            year,
            month,
            summary,
            bills,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}

/// Write bill summaries as CSV, one row per bill.
pub fn write_bills_csv<W: Write>(writer: W, bills: &[BillSummary]) -> Result<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    // Write header
    csv_writer.write_record([
        "id",
        "created_at",
        "creator",
        "description",
        "amount",
        "share",
        "role",
        "status",
        "participants",
        "paid_participants",
    ])?;

    let mut count = 0;
    for summary in bills {
        let bill = &summary.bill;
        let role = match summary.role {
            BillRole::Creator => "creator",
            BillRole::Participant { paid: true } => "participant-paid",
            BillRole::Participant { paid: false } => "participant-owing",
        };
        let participants: Vec<&str> = bill
            .split_participants
            .iter()
            .map(|p| p.participant_id.as_str())
            .collect();
        let paid: Vec<&str> = bill.paid_participants.iter().map(String::as_str).collect();

        csv_writer.write_record([
            bill.id.to_string(),
            bill.created_at.to_rfc3339(),
            bill.creator_id.clone(),
            bill.description.clone(),
            bill.amount.to_string(),
            format_amount(summary.share),
            role.to_string(),
            bill.status.as_str().to_string(),
            participants.join(";"),
            paid.join(";"),
        ])?;
        count += 1;
    }

    csv_writer.flush()?;
    Ok(count)
}
