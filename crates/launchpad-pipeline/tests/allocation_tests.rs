//! Reservation, sale finalization and pre-mint reconciliation against the
//! in-memory store

mod common;

use anyhow::Result;
use chrono::Duration;
use common::*;
use launchpad_pipeline::core::{
    AllocationError, EligibilityError, ItemStatus, ItemStore, LaunchItem, MintingModel,
    PhaseKind, PipelineError,
};
use launchpad_pipeline::domain::ActivePhase;
use launchpad_pipeline::services::{PremintOutcome, SaleTerms};
use uuid::Uuid;

fn terms(buyer_address: &str, reservation_price: rust_decimal::Decimal) -> SaleTerms {
    SaleTerms {
        buyer_address: buyer_address.to_string(),
        order_id: None,
        phase: None,
        enforce_limit: false,
        price: reservation_price,
        tx_hash: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_hand_out_one_item_once() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 0)], 1, false);
    let buyers: Vec<_> = (0..10)
        .map(|i| h.add_buyer(&format!("0x{:040x}", 0xa000 + i)))
        .collect();

    let tasks = buyers.iter().map(|buyer| {
        let allocator = h.container.allocator.clone();
        let launch_id = fixture.launch.id;
        let buyer_id = buyer.id;
        tokio::spawn(async move { allocator.reserve(launch_id, buyer_id).await })
    });
    let results = futures::future::join_all(tasks).await;

    let mut winners = Vec::new();
    for result in results {
        match result? {
            Ok(reservation) => winners.push(reservation),
            Err(PipelineError::Allocation(AllocationError::ReservationConflict { .. }))
            | Err(PipelineError::Allocation(AllocationError::NoAvailableItem { .. })) => {}
            Err(other) => panic!("unexpected reservation error: {}", other),
        }
    }

    assert_eq!(winners.len(), 1);
    let item = h.store.get_item(fixture.items[0].id).await?.unwrap();
    assert_eq!(item.status, ItemStatus::OnHold);
    assert_eq!(item.on_hold_by, Some(winners[0].buyer.id));
    Ok(())
}

#[tokio::test]
async fn test_expired_hold_is_reservable_after_staleness_window() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 0)], 1, false);
    let buyer = h.add_buyer(BUYER_A);

    // Expired 30s ago, still inside the 60s staleness window
    let abandoned = LaunchItem {
        status: ItemStatus::OnHold,
        on_hold_by: Some(Uuid::new_v4()),
        on_hold_until: Some(t0() - Duration::seconds(30)),
        ..fixture.items[0].clone()
    };
    h.store.put_item(abandoned);

    let err = h
        .container
        .allocator
        .reserve(fixture.launch.id, buyer.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Allocation(AllocationError::NoAvailableItem { .. })
    ));

    h.clock.advance(Duration::seconds(31));
    let reservation = h.container.allocator.reserve(fixture.launch.id, buyer.id).await?;
    assert_eq!(reservation.item.id, fixture.items[0].id);
    assert_eq!(reservation.item.on_hold_by, Some(buyer.id));
    assert_eq!(
        reservation.item.on_hold_until,
        Some(t0() + Duration::seconds(31) + Duration::seconds(120))
    );
    Ok(())
}

#[tokio::test]
async fn test_finalize_twice_records_one_purchase() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 0)], 1, false);
    let buyer = h.add_buyer(BUYER_A);
    let allocator = &h.container.allocator;

    let reservation = allocator.reserve(fixture.launch.id, buyer.id).await?;
    let purchase = allocator
        .finalize(reservation.item.id, buyer.id, terms(BUYER_A, price(10)))
        .await?;
    assert_eq!(purchase.launch_item_id, reservation.item.id);
    assert_eq!(purchase.purchased_at, t0());

    let err = allocator
        .finalize(reservation.item.id, buyer.id, terms(BUYER_A, price(10)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Allocation(AllocationError::AlreadySold { .. })
    ));
    assert_eq!(h.store.purchases().len(), 1);

    let collectible = h
        .store
        .get_collectible(reservation.collectible.id)
        .await?
        .unwrap();
    assert_eq!(collectible.unique_idx.as_deref(), Some("0x00000000000000000000000000000000000000c0:1"));
    Ok(())
}

#[tokio::test]
async fn test_finalize_requires_the_hold() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 0)], 1, false);
    let buyer = h.add_buyer(BUYER_A);
    let other = h.add_buyer(BUYER_B);

    let reservation = h.container.allocator.reserve(fixture.launch.id, buyer.id).await?;
    let err = h
        .container
        .allocator
        .finalize(reservation.item.id, other.id, terms(BUYER_B, price(10)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Allocation(AllocationError::NotHeldByYou { .. })
    ));
    assert!(h.store.purchases().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_phase_gating_and_pricing() -> Result<()> {
    let h = Harness::new();
    let phases = vec![
        phase(PhaseKind::Public, Duration::hours(1), Duration::hours(3), price(10), 0),
        phase(PhaseKind::Whitelist, Duration::hours(-1), Duration::hours(1), price(5), 0),
    ];
    let fixture = h.seed_launch(MintingModel::BuyerSigned, phases, 4, false);
    let listed = h.add_buyer(BUYER_A);
    let unlisted = h.add_buyer(BUYER_B);
    h.store
        .add_to_whitelist(fixture.launch.id, PhaseKind::Whitelist, BUYER_A);

    let reservation = h.container.allocator.reserve(fixture.launch.id, listed.id).await?;
    assert_eq!(reservation.phase.kind, PhaseKind::Whitelist);
    assert_eq!(reservation.phase.price, price(5));

    let err = h
        .container
        .allocator
        .reserve(fixture.launch.id, unlisted.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Eligibility(EligibilityError::NotEligibleForPhase { .. })
    ));

    // The whitelist window is half-open, at its end PUBLIC takes over
    h.clock.advance(Duration::hours(1));
    let reservation = h.container.allocator.reserve(fixture.launch.id, unlisted.id).await?;
    assert_eq!(reservation.phase.kind, PhaseKind::Public);
    assert_eq!(reservation.phase.price, price(10));

    h.clock.advance(Duration::hours(2));
    let err = h
        .container
        .allocator
        .reserve(fixture.launch.id, unlisted.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Eligibility(EligibilityError::NoActivePhase { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_wallet_limit_blocks_before_holding() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 2)], 3, false);
    let buyer = h.add_buyer(BUYER_A);
    let allocator = &h.container.allocator;

    for _ in 0..2 {
        let reservation = allocator.reserve(fixture.launch.id, buyer.id).await?;
        let mut sale = terms(BUYER_A, reservation.phase.price);
        sale.phase = Some(reservation.phase.clone());
        sale.enforce_limit = true;
        allocator.finalize(reservation.item.id, buyer.id, sale).await?;
    }

    let err = allocator.reserve(fixture.launch.id, buyer.id).await.unwrap_err();
    match err {
        PipelineError::Eligibility(EligibilityError::WalletLimitReached { limit, purchased, .. }) => {
            assert_eq!(limit, 2);
            assert_eq!(purchased, 2);
        }
        other => panic!("expected wallet limit, got {}", other),
    }

    let held = h
        .store
        .items(fixture.launch.id)
        .into_iter()
        .filter(|item| item.status == ItemStatus::OnHold)
        .count();
    assert_eq!(held, 0);
    Ok(())
}

#[tokio::test]
async fn test_wallet_limit_rechecked_at_finalize() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 1)], 2, false);
    let buyer = h.add_buyer(BUYER_A);
    let allocator = &h.container.allocator;

    // Two holds taken before either sale lands
    let first = allocator.reserve(fixture.launch.id, buyer.id).await?;
    let second = allocator.reserve(fixture.launch.id, buyer.id).await?;

    let limited = |phase: ActivePhase| SaleTerms {
        phase: Some(phase),
        enforce_limit: true,
        ..terms(BUYER_A, price(10))
    };
    allocator
        .finalize(first.item.id, buyer.id, limited(first.phase.clone()))
        .await?;
    let err = allocator
        .finalize(second.item.id, buyer.id, limited(second.phase.clone()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Eligibility(EligibilityError::WalletLimitReached { .. })
    ));

    let item = h.store.get_item(second.item.id).await?.unwrap();
    assert_eq!(item.status, ItemStatus::OnHold);
    assert_eq!(h.store.purchases().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_unlimited_supply_creates_items_on_demand() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 0)], 0, true);
    let buyer_a = h.add_buyer(BUYER_A);
    let buyer_b = h.add_buyer(BUYER_B);

    let first = h.container.allocator.reserve(fixture.launch.id, buyer_a.id).await?;
    let second = h.container.allocator.reserve(fixture.launch.id, buyer_b.id).await?;

    assert_eq!(first.collectible.nft_id, 1);
    assert_eq!(second.collectible.nft_id, 2);
    assert_eq!(first.item.status, ItemStatus::OnHold);
    assert_eq!(first.item.on_hold_by, Some(buyer_a.id));

    let uri = first.collectible.cid.clone().expect("metadata uploaded");
    let metadata: serde_json::Value = serde_json::from_slice(&h.uploader.get(&uri).unwrap())?;
    assert_eq!(metadata["name"], "Genesis #1");
    assert_eq!(h.uploader.upload_count(), 2);

    let stored = h.store.get_collection(fixture.collection.id).await?.unwrap();
    assert_eq!(stored.last_nft_id, 2);
    Ok(())
}

#[tokio::test]
async fn test_on_demand_survives_upload_failure() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 0)], 0, true);
    let buyer = h.add_buyer(BUYER_A);
    h.uploader.set_failing(true);

    let reservation = h.container.allocator.reserve(fixture.launch.id, buyer.id).await?;
    assert_eq!(reservation.collectible.nft_id, 1);
    assert!(reservation.collectible.cid.is_none());
    Ok(())
}

#[tokio::test]
async fn test_inactive_buyer_is_rejected() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 0)], 1, false);
    let buyer = h.add_buyer(BUYER_A);
    h.store.set_buyer_active(buyer.id, false);

    let err = h
        .container
        .allocator
        .reserve(fixture.launch.id, buyer.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Eligibility(EligibilityError::BuyerInactive(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_release_is_conditioned_on_holder() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BuyerSigned, vec![public_phase(price(10), 0)], 1, false);
    let buyer = h.add_buyer(BUYER_A);
    let other = h.add_buyer(BUYER_B);
    let launchpad = &h.container.launchpad;

    let reserved = launchpad.reserve(fixture.launch.id, buyer.id).await?;
    let item_id = reserved.reservation.item.id;

    let err = launchpad.release(item_id, other.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Allocation(AllocationError::NotHeldByYou { .. })
    ));

    launchpad.release(item_id, buyer.id).await?;
    let item = h.store.get_item(item_id).await?.unwrap();
    assert_eq!(item.status, ItemStatus::Active);
    assert_eq!(item.on_hold_by, None);

    // Free again for anyone
    let again = launchpad.reserve(fixture.launch.id, other.id).await?;
    assert_eq!(again.reservation.item.id, item_id);
    Ok(())
}

#[tokio::test]
async fn test_premint_check_outcomes() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BackendCustodial, vec![public_phase(price(10), 0)], 1, false);
    let buyer = h.add_buyer(BUYER_A);
    let allocator = &h.container.allocator;
    let reservation = allocator.reserve(fixture.launch.id, buyer.id).await?;
    let item_id = reservation.item.id;

    assert_eq!(allocator.premint_check(item_id, buyer.id, None).await?, PremintOutcome::NotMinted);

    h.chain.set_owner(CONTRACT, 1, CUSTODY);
    assert_eq!(
        allocator.premint_check(item_id, buyer.id, None).await?,
        PremintOutcome::MintedToCustody
    );

    h.chain.set_owner(CONTRACT, 1, BUYER_A);
    assert_eq!(
        allocator.premint_check(item_id, buyer.id, None).await?,
        PremintOutcome::MintedToHolder
    );
    Ok(())
}

#[tokio::test]
async fn test_premint_reconciles_foreign_mint() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BackendDirect, vec![public_phase(price(10), 0)], 1, false);
    let buyer = h.add_buyer(BUYER_A);
    let allocator = &h.container.allocator;
    let reservation = allocator.reserve(fixture.launch.id, buyer.id).await?;

    h.chain.set_owner(CONTRACT, 1, STRANGER);
    let outcome = allocator.premint_check(reservation.item.id, buyer.id, None).await?;
    assert_eq!(
        outcome,
        PremintOutcome::Lost {
            owner: STRANGER.to_string()
        }
    );

    let item = h.store.get_item(reservation.item.id).await?.unwrap();
    assert_eq!(item.status, ItemStatus::Sold);
    let purchases = h.store.purchases_for_item(item.id).await?;
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].buyer_id, None);
    assert_eq!(purchases[0].buyer_address, STRANGER);
    Ok(())
}

#[tokio::test]
async fn test_premint_reassigns_on_unlimited_supply() -> Result<()> {
    let h = Harness::new();
    let fixture = h.seed_launch(MintingModel::BackendDirect, vec![public_phase(price(10), 0)], 1, true);
    let buyer = h.add_buyer(BUYER_A);
    let allocator = &h.container.allocator;
    let reservation = allocator.reserve(fixture.launch.id, buyer.id).await?;

    h.chain.set_owner(CONTRACT, 1, STRANGER);
    match allocator.premint_check(reservation.item.id, buyer.id, None).await? {
        PremintOutcome::Reassigned { item, collectible } => {
            assert_ne!(item.id, reservation.item.id);
            assert_eq!(collectible.nft_id, 2);
            assert!(item.is_held_by(buyer.id));
            assert_eq!(item.on_hold_until, Some(t0() + Duration::hours(1)));
        }
        other => panic!("expected reassignment, got {:?}", other),
    }
    Ok(())
}
