mod common;

use std::sync::Arc;

use anyhow::Result;
use chrono::Datelike;
use common::*;
use splitbill::application::{AppError, FeedStatus, Ledger, Partition};
use splitbill::domain::Amount;
use splitbill::storage::StoreError;

#[tokio::test]
async fn test_merged_view_unions_both_partitions() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");
    let bob = ledger_for(&store, "bob");

    let bill1 = alice
        .create_bill("alice", Amount::from(20), "Cinema", vec![])
        .await?;
    let bill2 = bob
        .create_bill("bob", Amount::from(40), "Pizza", participants(&["alice"]))
        .await?;
    // Involves neither partition of alice
    bob.create_bill("bob", Amount::from(15), "Bus", participants(&["carol"]))
        .await?;

    alice.sign_in().await?;
    let view = alice.settled_view().await?;

    assert_eq!(view.status(Partition::CreatedByMe), FeedStatus::Live);
    assert_eq!(view.status(Partition::SplitToMe), FeedStatus::Live);
    assert!(view.is_complete());

    let ids: Vec<_> = view.bills.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![bill2.id, bill1.id]);

    alice.sign_out().await;
    Ok(())
}

#[tokio::test]
async fn test_view_follows_live_changes() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");
    let bob = ledger_for(&store, "bob");

    alice.sign_in().await?;
    let mut view = alice.merged_view().await?;
    let initial = wait_for_view(&mut view, |v| v.is_complete()).await;
    assert!(initial.bills.is_empty());

    // Bob splits a bill to alice
    let bill = bob
        .create_bill("bob", Amount::from(40), "Pizza", participants(&["alice"]))
        .await?;
    let current = wait_for_view(&mut view, |v| contains(v, bill.id)).await;
    assert_eq!(current.bills.len(), 1);

    // A payment recorded by bob shows up for alice
    bob.toggle_participant_paid(bill.id, "alice").await?;
    wait_for_view(&mut view, |v| {
        v.bills
            .iter()
            .any(|b| b.id == bill.id && b.is_participant_paid("alice"))
    })
    .await;

    // Alice's own bill lands in the other partition
    let own = alice
        .create_bill("alice", Amount::from(12), "Snacks", vec![])
        .await?;
    let current = wait_for_view(&mut view, |v| contains(v, own.id)).await;
    assert_eq!(current.bills[0].id, own.id);
    assert_eq!(current.bills.len(), 2);

    bob.delete_bill(bill.id, "bob").await?;
    let current = wait_for_view(&mut view, |v| !contains(v, bill.id)).await;
    assert_eq!(current.bills.len(), 1);

    alice.sign_out().await;
    Ok(())
}

#[tokio::test]
async fn test_degraded_partition_keeps_other_side() -> Result<()> {
    let (sqlite, _temp) = test_store().await?;
    let flaky = Arc::new(FlakyStore::new(sqlite.clone()));
    let alice = Ledger::new(flaky.clone(), sqlite.clone(), sqlite.clone(), identity("alice"))
        .with_feed_config(fast_feeds());
    let bob = ledger_for(&sqlite, "bob");

    let own = alice
        .create_bill("alice", Amount::from(30), "Lunch", vec![])
        .await?;
    let split = bob
        .create_bill("bob", Amount::from(50), "Tickets", participants(&["alice"]))
        .await?;

    alice.sign_in().await?;
    let mut view = alice.merged_view().await?;
    let degraded = wait_for_view(&mut view, |v| {
        v.split_to_me == FeedStatus::Degraded && v.created_by_me == FeedStatus::Live
    })
    .await;
    assert!(!degraded.is_complete());
    assert_eq!(degraded.degraded(), vec![Partition::SplitToMe]);
    assert!(contains(&degraded, own.id));
    assert!(!contains(&degraded, split.id));

    let live = alice
        .monthly_aggregate("alice", own.created_at.year(), own.created_at.month())
        .await?;
    assert!(live.possibly_incomplete);

    // The feed reconnects on its own once the store is back
    flaky.set_split_to_offline(false);
    let recovered = wait_for_view(&mut view, |v| v.is_complete() && contains(v, split.id)).await;
    assert!(contains(&recovered, own.id));
    assert_eq!(recovered.status(Partition::SplitToMe), FeedStatus::Live);

    alice.sign_out().await;
    Ok(())
}

#[tokio::test]
async fn test_sign_out_stops_both_feeds() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");

    alice.sign_in().await?;
    let mut view = alice.merged_view().await?;
    wait_for_view(&mut view, |v| v.is_settled()).await;

    alice.sign_out().await;
    assert!(view.changed().await.is_err());
    assert!(matches!(
        alice.merged_view().await,
        Err(AppError::NotSignedIn)
    ));

    // Signing in again starts a fresh session
    alice.sign_in().await?;
    let view = alice.settled_view().await?;
    assert!(view.is_complete());
    alice.sign_out().await;

    Ok(())
}

#[tokio::test]
async fn test_repeated_sign_in_keeps_session() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");

    alice.sign_in().await?;
    let first = alice.merged_view().await?;
    alice.sign_in().await?;

    // The original feeds are still publishing
    assert!(first.has_changed().is_ok());
    assert!(alice.settled_view().await?.is_complete());

    alice.sign_out().await;
    Ok(())
}

#[tokio::test]
async fn test_partition_subscriptions_redeliver_full_sets() -> Result<()> {
    let (store, _temp) = test_store().await?;
    let alice = ledger_for(&store, "alice");
    let bob = ledger_for(&store, "bob");

    let mut created = alice.bills().subscribe_created_by("alice");
    let mut split = alice.bills().subscribe_split_to("alice");
    assert!(created.next().await.unwrap()?.is_empty());
    assert!(split.next().await.unwrap()?.is_empty());

    let own = alice
        .create_bill("alice", Amount::from(10), "Tea", participants(&["bob"]))
        .await?;
    let delivered = tokio::time::timeout(WAIT, created.next()).await?.unwrap()?;
    assert_eq!(delivered, vec![own.clone()]);

    let theirs = bob
        .create_bill("bob", Amount::from(20), "Cake", participants(&["alice"]))
        .await?;
    // Every write re-delivers, so skip the sets from before bob's bill
    let delivered = tokio::time::timeout(WAIT, async {
        loop {
            let set = split.next().await.expect("subscription ended")?;
            if !set.is_empty() {
                return Ok::<_, StoreError>(set);
            }
        }
    })
    .await??;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, theirs.id);

    // The creator never shows up in their own "split to" set
    let bob_split = bob.bills().subscribe_split_to("bob").next().await.unwrap()?;
    assert_eq!(bob_split.iter().map(|b| b.id).collect::<Vec<_>>(), vec![own.id]);

    Ok(())
}
