//! Confirmation status caching and receipt validation

use anyhow::Result;
use launchpad_pipeline::adapters::chain::abi::{encode_address, encode_uint, ZERO_ADDRESS};
use launchpad_pipeline::adapters::{MemoryCache, MockChain};
use launchpad_pipeline::config::{ConfirmationConfig, ERC721_TRANSFER_TOPIC};
use launchpad_pipeline::core::{
    ConfirmationState, LogEntry, NetworkError, PipelineError, TxReceipt, ValidationError,
};
use launchpad_pipeline::services::{ConfirmationService, EventTopics, ExpectedOperation};
use std::sync::Arc;
use std::time::Duration;

const CONTRACT: &str = "0x00000000000000000000000000000000000000c0";
const MARKETPLACE: &str = "0x00000000000000000000000000000000000000d0";
const BUYER: &str = "0x00000000000000000000000000000000000000a1";
const SELLER: &str = "0x00000000000000000000000000000000000000a2";
const SALE_TOPIC: &str = "0x5ad9d4b9e2d2f1b2c3a4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f7081920";
const CANCEL_TOPIC: &str = "0x9ba1a3cb55ce8d63d072a886f94d2a744f50cddf82128e897d0661f5ec623158";
const TX: &str = "0x00000000000000000000000000000000000000000000000000000000000000aa";

fn topic_address(address: &str) -> String {
    format!("0x{}", encode_address(address).unwrap())
}

fn topic_uint(value: u128) -> String {
    format!("0x{}", encode_uint(value))
}

fn transfer(from: &str, to: &str, token_id: u128) -> LogEntry {
    LogEntry {
        address: CONTRACT.to_string(),
        topics: vec![
            ERC721_TRANSFER_TOPIC.to_string(),
            topic_address(from),
            topic_address(to),
            topic_uint(token_id),
        ],
        data: "0x".to_string(),
    }
}

fn item_sold(seller: &str, buyer: &str, token_id: u128, price_wei: u128) -> LogEntry {
    LogEntry {
        address: MARKETPLACE.to_string(),
        topics: vec![SALE_TOPIC.to_string(), topic_address(seller), topic_address(buyer)],
        data: format!("0x{}{}", encode_uint(token_id), encode_uint(price_wei)),
    }
}

fn listing_cancelled(seller: &str, token_id: u128) -> LogEntry {
    LogEntry {
        address: MARKETPLACE.to_string(),
        topics: vec![CANCEL_TOPIC.to_string(), topic_address(seller)],
        data: format!("0x{}", encode_uint(token_id)),
    }
}

fn receipt(block_number: u64, success: bool, logs: Vec<LogEntry>) -> TxReceipt {
    TxReceipt {
        transaction_hash: TX.to_string(),
        block_number,
        success,
        logs,
    }
}

fn create_test_setup() -> (Arc<MockChain>, ConfirmationService<MockChain, MemoryCache>) {
    let chain = Arc::new(MockChain::new());
    let service = ConfirmationService::new(
        chain.clone(),
        Arc::new(MemoryCache::new()),
        ConfirmationConfig::default(),
        EventTopics {
            transfer: ERC721_TRANSFER_TOPIC.to_string(),
            sale: Some(SALE_TOPIC.to_string()),
            cancel: None,
        },
    );
    (chain, service)
}

fn create_marketplace_setup() -> (Arc<MockChain>, ConfirmationService<MockChain, MemoryCache>) {
    let chain = Arc::new(MockChain::new());
    let service = ConfirmationService::new(
        chain.clone(),
        Arc::new(MemoryCache::new()),
        ConfirmationConfig::default(),
        EventTopics {
            transfer: ERC721_TRANSFER_TOPIC.to_string(),
            sale: Some(SALE_TOPIC.to_string()),
            cancel: Some(CANCEL_TOPIC.to_string()),
        },
    );
    (chain, service)
}

fn mint_of(token_ids: Vec<i64>) -> ExpectedOperation {
    ExpectedOperation::Mint {
        contract: CONTRACT.to_string(),
        recipient: BUYER.to_string(),
        token_ids,
    }
}

fn mismatch_field(err: PipelineError) -> &'static str {
    match err {
        PipelineError::Validation(ValidationError::Mismatch { field, .. }) => field,
        other => panic!("expected a mismatch, got {}", other),
    }
}

#[tokio::test]
async fn test_unknown_hash_is_pending() -> Result<()> {
    let (_chain, service) = create_test_setup();

    let status = service.get_status(TX).await?;
    assert_eq!(status.status, ConfirmationState::Pending);
    assert_eq!(status.block_number, None);
    Ok(())
}

#[tokio::test]
async fn test_confirmation_depth_threshold() -> Result<()> {
    let (chain, service) = create_test_setup();
    chain.set_block_number(101);
    chain.insert_receipt(receipt(100, true, vec![]));

    let status = service.get_status(TX).await?;
    assert_eq!(status.status, ConfirmationState::Pending);
    assert_eq!(status.confirmations, Some(2));

    // Pending is cached too, a refresh goes back to the chain
    chain.advance_blocks(1);
    assert_eq!(service.get_status(TX).await?.status, ConfirmationState::Pending);
    let status = service.refresh_status(TX).await?;
    assert_eq!(status.status, ConfirmationState::Confirmed);
    assert_eq!(status.confirmations, Some(3));
    Ok(())
}

#[tokio::test]
async fn test_confirmed_status_served_from_cache() -> Result<()> {
    let (chain, service) = create_test_setup();
    chain.set_block_number(110);
    chain.insert_receipt(receipt(100, true, vec![]));

    let first = service.get_status(TX).await?;
    assert_eq!(first.status, ConfirmationState::Confirmed);
    let receipts = chain.call_count("get_transaction_receipt");
    let blocks = chain.call_count("get_block_number");

    let second = service.get_status(&TX.to_ascii_uppercase().replace("0X", "0x")).await?;
    assert_eq!(second, first);
    assert_eq!(chain.call_count("get_transaction_receipt"), receipts);
    assert_eq!(chain.call_count("get_block_number"), blocks);
    Ok(())
}

#[tokio::test]
async fn test_reverted_transaction_is_failed() -> Result<()> {
    let (chain, service) = create_test_setup();
    chain.set_block_number(200);
    chain.insert_receipt(receipt(150, false, vec![]));

    let status = service.get_status(TX).await?;
    assert_eq!(status.status, ConfirmationState::Failed);
    assert_eq!(status.block_number, Some(150));

    let err = service.validate_operation(TX, &mint_of(vec![1])).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::TransactionFailed(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_wait_for_finality_times_out() -> Result<()> {
    let (_chain, service) = create_test_setup();

    let err = service
        .wait_for_finality(TX, Duration::from_millis(50), Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Network(NetworkError::Timeout(_))));
    Ok(())
}

#[tokio::test]
async fn test_wait_for_finality_follows_new_blocks() -> Result<()> {
    let (chain, service) = create_test_setup();
    chain.set_block_number(100);
    chain.insert_receipt(receipt(100, true, vec![]));
    chain.set_auto_mine(true);

    let status = service
        .wait_for_finality(TX, Duration::from_secs(5), Duration::from_millis(10))
        .await?;
    assert_eq!(status.status, ConfirmationState::Confirmed);
    Ok(())
}

#[tokio::test]
async fn test_mint_validation() -> Result<()> {
    let (chain, service) = create_test_setup();
    chain.insert_receipt(receipt(
        100,
        true,
        vec![transfer(ZERO_ADDRESS, BUYER, 4), transfer(ZERO_ADDRESS, BUYER, 5)],
    ));

    service.validate_operation(TX, &mint_of(vec![5, 4])).await?;

    let err = service.validate_operation(TX, &mint_of(vec![4])).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::EventCount { expected: 1, found: 2 })
    ));

    let err = service.validate_operation(TX, &mint_of(vec![4, 6])).await.unwrap_err();
    assert_eq!(mismatch_field(err), "token ids");

    let other_recipient = ExpectedOperation::Mint {
        contract: CONTRACT.to_string(),
        recipient: SELLER.to_string(),
        token_ids: vec![4, 5],
    };
    let err = service.validate_operation(TX, &other_recipient).await.unwrap_err();
    assert_eq!(mismatch_field(err), "recipient");
    Ok(())
}

#[tokio::test]
async fn test_mint_validation_ignores_plain_transfers() -> Result<()> {
    let (chain, service) = create_test_setup();
    chain.insert_receipt(receipt(
        100,
        true,
        vec![transfer(ZERO_ADDRESS, BUYER, 9), transfer(SELLER, BUYER, 3)],
    ));

    service.validate_operation(TX, &mint_of(vec![9])).await?;
    Ok(())
}

#[tokio::test]
async fn test_missing_receipt_is_reported() -> Result<()> {
    let (_chain, service) = create_test_setup();

    let err = service.validate_operation(TX, &mint_of(vec![1])).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::MissingReceipt(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_sale_validation() -> Result<()> {
    let (chain, service) = create_test_setup();
    chain.insert_receipt(receipt(100, true, vec![item_sold(SELLER, BUYER, 7, 1_000)]));

    let sale = |price_wei: u128, buyer: &str| ExpectedOperation::Sale {
        marketplace: MARKETPLACE.to_string(),
        seller: SELLER.to_string(),
        buyer: buyer.to_string(),
        token_id: 7,
        price_wei,
    };

    service.validate_operation(TX, &sale(1_000, BUYER)).await?;

    let err = service.validate_operation(TX, &sale(999, BUYER)).await.unwrap_err();
    assert_eq!(mismatch_field(err), "price");

    let err = service.validate_operation(TX, &sale(1_000, SELLER)).await.unwrap_err();
    assert_eq!(mismatch_field(err), "buyer");
    Ok(())
}

#[tokio::test]
async fn test_unconfigured_event_is_rejected() -> Result<()> {
    let (chain, service) = create_test_setup();
    chain.insert_receipt(receipt(100, true, vec![]));

    let err = service
        .validate_operation(
            TX,
            &ExpectedOperation::Cancellation {
                marketplace: MARKETPLACE.to_string(),
                seller: SELLER.to_string(),
                token_id: 7,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::UnknownEvent("ListingCancelled"))
    ));
    Ok(())
}

#[tokio::test]
async fn test_cancellation_validation() -> Result<()> {
    let (chain, service) = create_marketplace_setup();
    chain.insert_receipt(receipt(100, true, vec![listing_cancelled(SELLER, 7)]));

    let cancellation = |seller: &str, token_id: i64| ExpectedOperation::Cancellation {
        marketplace: MARKETPLACE.to_string(),
        seller: seller.to_string(),
        token_id,
    };

    service.validate_operation(TX, &cancellation(SELLER, 7)).await?;
    // Checksummed input still matches the lowercase log topic
    service
        .validate_operation(TX, &cancellation("0x00000000000000000000000000000000000000A2", 7))
        .await?;

    let err = service.validate_operation(TX, &cancellation(BUYER, 7)).await.unwrap_err();
    assert_eq!(mismatch_field(err), "seller");

    let err = service.validate_operation(TX, &cancellation(SELLER, 8)).await.unwrap_err();
    assert_eq!(mismatch_field(err), "token id");
    Ok(())
}

#[tokio::test]
async fn test_cancellation_needs_exactly_one_event() -> Result<()> {
    let (chain, service) = create_marketplace_setup();
    let cancellation = ExpectedOperation::Cancellation {
        marketplace: MARKETPLACE.to_string(),
        seller: SELLER.to_string(),
        token_id: 7,
    };

    let none = "0x00000000000000000000000000000000000000000000000000000000000000bb";
    chain.insert_receipt(TxReceipt {
        transaction_hash: none.to_string(),
        block_number: 100,
        success: true,
        // Sale events on the same marketplace do not count
        logs: vec![item_sold(SELLER, BUYER, 7, 1_000)],
    });
    let err = service.validate_operation(none, &cancellation).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::EventCount { expected: 1, found: 0 })
    ));

    let twice = "0x00000000000000000000000000000000000000000000000000000000000000cc";
    chain.insert_receipt(TxReceipt {
        transaction_hash: twice.to_string(),
        block_number: 100,
        success: true,
        logs: vec![listing_cancelled(SELLER, 7), listing_cancelled(SELLER, 8)],
    });
    let err = service.validate_operation(twice, &cancellation).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::EventCount { expected: 1, found: 2 })
    ));
    Ok(())
}
