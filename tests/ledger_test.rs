mod common;

use std::sync::Arc;

use anyhow::Result;
use chrono::Datelike;
use common::*;
use splitbill::application::{AppError, Ledger, NotificationMetadata};
use splitbill::domain::{Amount, Bill, BillStatus, MonthlyAggregate};
use splitbill::io::Exporter;

fn month_of(bill: &Bill) -> (i32, u32) {
    (bill.created_at.year(), bill.created_at.month())
}

#[tokio::test]
async fn test_split_bill_aggregates_for_each_user() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");
    let bob = ledger_for(&store, "bob");
    let carol = ledger_for(&store, "carol");

    let bill = alice
        .create_bill("alice", Amount::from(300), "Groceries", participants(&["bob", "carol"]))
        .await?;
    let (year, month) = month_of(&bill);

    alice.sign_in().await?;
    alice.settled_view().await?;
    let live = alice.monthly_aggregate("alice", year, month).await?;
    assert!(!live.possibly_incomplete);
    assert_eq!(
        live.aggregate,
        MonthlyAggregate {
            monthly_total: Amount::from(100),
            amount_paid_by_user: Amount::from(100),
            amount_owed_by_user: Amount::ZERO,
        }
    );

    for ledger in [&bob, &carol] {
        let user = ledger.sign_in().await?;
        ledger.settled_view().await?;
        let live = ledger.monthly_aggregate(&user.id, year, month).await?;
        assert_eq!(live.aggregate.amount_owed_by_user, Amount::from(100));
        assert_eq!(live.aggregate.amount_paid_by_user, Amount::ZERO);
        assert_eq!(live.aggregate.monthly_total, Amount::ZERO);
        ledger.sign_out().await;
    }

    alice.sign_out().await;
    Ok(())
}

#[tokio::test]
async fn test_unsplit_bill_counts_in_full() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");

    let bill = alice
        .create_bill("alice", Amount::from(150), "Shoes", vec![])
        .await?;
    let (year, month) = month_of(&bill);

    alice.sign_in().await?;
    alice.settled_view().await?;
    let live = alice.monthly_aggregate("alice", year, month).await?;
    assert_eq!(live.aggregate.monthly_total, Amount::from(150));
    assert_eq!(live.aggregate.amount_paid_by_user, Amount::from(150));
    assert_eq!(live.aggregate.amount_owed_by_user, Amount::ZERO);

    // Other months are untouched
    let (prev_year, prev_month) = if month == 1 { (year - 1, 12) } else { (year, month - 1) };
    let previous = alice.monthly_aggregate("alice", prev_year, prev_month).await?;
    assert_eq!(previous.aggregate, MonthlyAggregate::default());

    assert!(matches!(
        alice.monthly_aggregate("alice", year, 0).await,
        Err(AppError::InvalidPeriod { month: 0, .. })
    ));

    alice.sign_out().await;
    Ok(())
}

#[tokio::test]
async fn test_participant_payment_moves_share_without_status() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");
    let bob = ledger_for(&store, "bob");

    let bill = alice
        .create_bill("alice", Amount::from(300), "Groceries", participants(&["bob", "carol"]))
        .await?;
    let (year, month) = month_of(&bill);

    bob.sign_in().await?;
    bob.settled_view().await?;
    let before = bob.monthly_aggregate("bob", year, month).await?;
    assert_eq!(before.aggregate.amount_owed_by_user, Amount::from(100));

    let updated = alice.toggle_participant_paid(bill.id, "bob").await?;
    assert_eq!(updated.status, BillStatus::Pending);

    let mut view = bob.merged_view().await?;
    wait_for_view(&mut view, |v| {
        v.bills.iter().any(|b| b.id == bill.id && b.is_participant_paid("bob"))
    })
    .await;

    let after = bob.monthly_aggregate("bob", year, month).await?;
    assert_eq!(
        after.aggregate.amount_paid_by_user,
        before.aggregate.amount_paid_by_user + Amount::from(100)
    );
    assert_eq!(after.aggregate.amount_owed_by_user, Amount::ZERO);
    assert_eq!(alice.get_bill(bill.id).await?.status, BillStatus::Pending);

    // Marking the whole bill paid does not settle carol's share
    alice.toggle_status(bill.id).await?;
    let carol = ledger_for(&store, "carol");
    carol.sign_in().await?;
    carol.settled_view().await?;
    let carol_live = carol.monthly_aggregate("carol", year, month).await?;
    assert_eq!(carol_live.aggregate.amount_owed_by_user, Amount::from(100));

    carol.sign_out().await;
    bob.sign_out().await;
    Ok(())
}

#[tokio::test]
async fn test_live_aggregate_publishes_distinct_values() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");

    let first = alice
        .create_bill("alice", Amount::from(40), "Books", vec![])
        .await?;
    let (year, month) = month_of(&first);

    alice.sign_in().await?;
    let mut stream = alice.live_aggregate("alice", year, month).await?;
    let settled = next_aggregate(&mut stream, |a| !a.possibly_incomplete).await;
    assert_eq!(settled.aggregate.monthly_total, Amount::from(40));

    // A status flip changes the view but not the figures
    alice.toggle_status(first.id).await?;
    let second = alice
        .create_bill("alice", Amount::from(60), "Lamp", participants(&["bob"]))
        .await?;
    assert_eq!(month_of(&second), (year, month));

    let next = next_aggregate(&mut stream, |_| true).await;
    assert_eq!(next.aggregate.monthly_total, Amount::from(70));
    assert_eq!(next.aggregate.amount_paid_by_user, Amount::from(70));
    assert!(!next.possibly_incomplete);

    // The stream ends with the session
    alice.sign_out().await;
    let end = tokio::time::timeout(WAIT, stream.next()).await?;
    assert!(end.is_none());

    Ok(())
}

#[tokio::test]
async fn test_live_aggregate_requires_matching_session() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");

    assert!(matches!(
        alice.live_aggregate("alice", 2024, 5).await,
        Err(AppError::NotSignedIn)
    ));

    alice.sign_in().await?;
    assert!(matches!(
        alice.live_aggregate("bob", 2024, 5).await,
        Err(AppError::NotSignedIn)
    ));
    assert!(matches!(
        alice.live_aggregate("alice", 2024, 13).await,
        Err(AppError::InvalidPeriod { .. })
    ));

    alice.sign_out().await;
    Ok(())
}

#[tokio::test]
async fn test_split_participants_are_notified() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let notifier = Arc::new(RecordingNotifier::default());
    let alice = Ledger::new(store.clone(), store.clone(), notifier.clone(), identity("alice"));

    let bill = alice
        .create_bill("alice", Amount::from(300), "Groceries", participants(&["bob", "carol"]))
        .await?;
    alice
        .create_bill("alice", Amount::from(10), "Solo", vec![])
        .await?;
    alice.flush_notifications().await;

    let sent = notifier.sent();
    assert_eq!(sent.len(), 2);
    let recipients: Vec<_> = sent.iter().map(|n| n.recipient_id.as_str()).collect();
    assert_eq!(recipients, vec!["bob", "carol"]);

    for notification in &sent {
        assert_eq!(notification.sender_id, "alice");
        assert!(notification.message.starts_with("ALICE split \"Groceries\""));
        assert!(notification.message.contains("100.00"));
        assert_eq!(
            notification.metadata,
            NotificationMetadata::ExpenseSplit {
                bill_id: bill.id,
                amount: Amount::from(300),
                description: "Groceries".to_string(),
            }
        );
    }

    Ok(())
}

#[tokio::test]
async fn test_failed_notification_keeps_bill() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = Ledger::new(
        store.clone(),
        store.clone(),
        Arc::new(FailingNotifier),
        identity("alice"),
    );

    let bill = alice
        .create_bill("alice", Amount::from(50), "Gift", participants(&["bob"]))
        .await?;
    alice.flush_notifications().await;

    assert_eq!(alice.get_bill(bill.id).await?, bill);
    Ok(())
}

#[tokio::test]
async fn test_notifications_land_in_inbox() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");
    let bob = ledger_for(&store, "bob");

    alice.add_friend("bob", "Bob").await?;
    let bill = alice
        .create_bill_with_friends(Amount::from(80), "Concert", &["bob".to_string()])
        .await?;
    alice.flush_notifications().await;

    let inbox = bob.inbox().await?;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].notification.recipient_id, "bob");
    assert!(matches!(
        inbox[0].notification.metadata,
        NotificationMetadata::ExpenseSplit { bill_id, .. } if bill_id == bill.id
    ));
    assert!(alice.inbox().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_bills_for_month_and_export() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");
    let bob = ledger_for(&store, "bob");

    let own = alice
        .create_bill("alice", Amount::from(90), "Dinner", participants(&["bob", "carol"]))
        .await?;
    let theirs = bob
        .create_bill("bob", Amount::from(20), "Parking", participants(&["alice"]))
        .await?;
    let (year, month) = month_of(&own);

    alice.sign_in().await?;
    alice.settled_view().await?;
    let bills = alice.bills_for_month(year, month).await?;
    assert_eq!(bills.len(), 2);
    assert_eq!(bills[0].bill.id, theirs.id);
    assert_eq!(bills[0].share, Amount::from(10));
    assert_eq!(bills[1].share, Amount::from(30));

    let exporter = Exporter::new(&alice);
    let mut csv = Vec::new();
    let count = exporter.export_bills_csv(&mut csv, year, month).await?;
    assert_eq!(count, 2);
    let csv = String::from_utf8(csv)?;
    assert_eq!(csv.lines().count(), 3);
    assert!(csv.contains("Dinner"));

    let mut json = Vec::new();
    let snapshot = exporter.export_month_json(&mut json, year, month).await?;
    assert_eq!(snapshot.user_id, "alice");
    assert_eq!(snapshot.bills.len(), 2);
    assert_eq!(snapshot.summary.aggregate.monthly_total, Amount::from(30));
    assert_eq!(snapshot.summary.aggregate.amount_owed_by_user, Amount::from(10));

    let parsed: serde_json::Value = serde_json::from_slice(&json)?;
    assert_eq!(parsed["bills"].as_array().map(Vec::len), Some(2));

    alice.sign_out().await;
    Ok(())
}
