//! Core domain types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::ValidationError;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} value: {}", stringify!($name), other)),
                }
            }
        }
    };
}

/// Lifecycle of one sellable slot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Active,
    OnHold,
    Sold,
    Cancelled,
    Reserved,
}

text_enum!(ItemStatus {
    Active => "ACTIVE",
    OnHold => "ON_HOLD",
    Sold => "SOLD",
    Cancelled => "CANCELLED",
    Reserved => "RESERVED",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectibleStatus {
    Pending,
    Confirmed,
}

text_enum!(CollectibleStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    InQueue,
    Done,
    Failed,
}

text_enum!(OrderStatus {
    Pending => "PENDING",
    InQueue => "IN_QUEUE",
    Done => "DONE",
    Failed => "FAILED",
});

/// Launch phase kinds, declared in evaluation priority order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseKind {
    Whitelist,
    FcfsWhitelist,
    Public,
}

text_enum!(PhaseKind {
    Whitelist => "WHITELIST",
    FcfsWhitelist => "FCFS_WHITELIST",
    Public => "PUBLIC",
});

impl PhaseKind {
    /// Gated phases require whitelist membership
    pub fn is_gated(&self) -> bool {
        !matches!(self, PhaseKind::Public)
    }

    pub fn priority(&self) -> u8 {
        match self {
            PhaseKind::Whitelist => 0,
            PhaseKind::FcfsWhitelist => 1,
            PhaseKind::Public => 2,
        }
    }
}

/// Who signs and submits the mint transaction for a collection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MintingModel {
    /// The buyer signs and broadcasts the authorized mint
    BuyerSigned,
    /// The backend mints straight to the buyer
    BackendDirect,
    /// The backend mints to its custody address and transfers to the buyer
    BackendCustodial,
}

text_enum!(MintingModel {
    BuyerSigned => "BUYER_SIGNED",
    BackendDirect => "BACKEND_DIRECT",
    BackendCustodial => "BACKEND_CUSTODIAL",
});

impl MintingModel {
    pub fn is_backend_minted(&self) -> bool {
        !matches!(self, MintingModel::BuyerSigned)
    }
}

/// One sellable slot within a launch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchItem {
    pub id: Uuid,
    pub launch_id: Uuid,
    pub collectible_id: Uuid,
    pub status: ItemStatus,
    pub on_hold_by: Option<Uuid>,
    /// When the current hold was placed; extensions keep it
    pub on_hold_since: Option<DateTime<Utc>>,
    pub on_hold_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A buyer's claim on an item
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hold {
    pub holder_id: Uuid,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl LaunchItem {
    /// A hold goes stale once its expiry is older than the staleness window
    pub fn hold_is_stale(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        match self.on_hold_until {
            Some(until) => until < now - staleness,
            None => true,
        }
    }

    /// Selection predicate shared by candidate picking and the conditional hold
    pub fn is_reservable(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        match self.status {
            ItemStatus::Active => self.on_hold_until.is_none() || self.hold_is_stale(now, staleness),
            ItemStatus::OnHold => self.hold_is_stale(now, staleness),
            _ => false,
        }
    }

    pub fn is_held_by(&self, buyer_id: Uuid) -> bool {
        self.status == ItemStatus::OnHold && self.on_hold_by == Some(buyer_id)
    }
}

/// Asset payload behind a launch item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collectible {
    pub id: Uuid,
    pub collection_id: Uuid,
    pub nft_id: i64,
    pub cid: Option<String>,
    pub status: CollectibleStatus,
    pub unique_idx: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Deterministic identity of a confirmed collectible
pub fn unique_idx(contract_address: &str, nft_id: i64) -> String {
    format!("{}:{}", contract_address.to_ascii_lowercase(), nft_id)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collection {
    pub id: Uuid,
    pub name: String,
    pub contract_address: String,
    pub minting_model: MintingModel,
    pub last_nft_id: i64,
    pub metadata_template: Option<serde_json::Value>,
}

/// A time window with its own eligibility rule and price
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub kind: PhaseKind,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub price: Decimal,
    /// 0 means unlimited
    pub max_per_wallet: u32,
}

impl Phase {
    /// Windows are half-open: [starts_at, ends_at)
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Launch {
    pub id: Uuid,
    pub collection_id: Uuid,
    pub unlimited_supply: bool,
    /// Declaration order
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Buyer {
    pub id: Uuid,
    pub wallet_address: String,
    pub is_active: bool,
}

/// A buyer's funding/payment envelope for one purchase attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub collection_id: Uuid,
    pub launch_id: Uuid,
    pub launch_item_id: Uuid,
    pub funding_address: Option<String>,
    pub funding_amount: Decimal,
    pub status: OrderStatus,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable sale receipt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Purchase {
    pub id: Uuid,
    pub launch_id: Uuid,
    pub launch_item_id: Uuid,
    /// None for sales reconciled from chain state with no local buyer
    pub buyer_id: Option<Uuid>,
    pub buyer_address: String,
    pub phase: Option<PhaseKind>,
    pub price: Decimal,
    pub tx_hash: Option<String>,
    pub purchased_at: DateTime<Utc>,
}

/// Permanently failed work message kept for manual remediation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedMint {
    pub id: Uuid,
    pub message_id: Uuid,
    pub order_id: Option<Uuid>,
    pub buyer_id: Option<Uuid>,
    pub launch_item_id: Option<Uuid>,
    pub attempts: u32,
    pub error_kind: String,
    pub reason: String,
    pub payload: serde_json::Value,
    pub failed_at: DateTime<Utc>,
}

/// Everything `finalize` writes atomically
#[derive(Debug, Clone)]
pub struct SaleRecord {
    pub item_id: Uuid,
    pub holder_id: Uuid,
    pub buyer_address: String,
    pub contract_address: String,
    pub order_id: Option<Uuid>,
    pub phase: Option<PhaseKind>,
    pub price: Decimal,
    pub tx_hash: Option<String>,
    /// Per-wallet cap re-checked inside the sale transaction
    pub limit: Option<PurchaseLimit>,
    pub sold_at: DateTime<Utc>,
}

/// Wallet limit of the phase a sale belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseLimit {
    pub phase: PhaseKind,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub max_per_wallet: u32,
}

/// Chain-side sale the local database missed
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub item_id: Uuid,
    pub owner_address: String,
    pub contract_address: String,
    pub reconciled_at: DateTime<Utc>,
}

/// Transaction request submitted by the backend signing identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxRequest {
    pub from: String,
    pub to: String,
    pub data: String,
    pub value_wei: u128,
    pub nonce: Option<u64>,
    pub gas: Option<u64>,
}

/// Unsigned transaction handed to a buyer to sign
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsignedTx {
    pub to: String,
    pub data: String,
    pub value_wei: u128,
    pub chain_id: u64,
    pub gas: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    /// false when the transaction reverted
    pub success: bool,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationState {
    Pending,
    Confirmed,
    Failed,
}

/// Cached confirmation status of a transaction hash
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxStatus {
    pub status: ConfirmationState,
    pub block_number: Option<u64>,
    pub confirmations: Option<u64>,
}

impl TxStatus {
    pub fn pending() -> Self {
        Self {
            status: ConfirmationState::Pending,
            block_number: None,
            confirmations: None,
        }
    }
}

/// Validate and lowercase a `0x`-prefixed 20-byte hex address
pub fn normalize_address(address: &str) -> Result<String, ValidationError> {
    let trimmed = address.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| ValidationError::InvalidAddress(address.to_string()))?;

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidAddress(address.to_string()));
    }

    Ok(format!("0x{}", hex_part.to_ascii_lowercase()))
}

pub fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Convert a decimal amount of native currency into wei
pub fn to_wei(amount: Decimal, decimals: u32) -> Option<u128> {
    if amount.is_sign_negative() {
        return None;
    }
    let scale = Decimal::from_i128_with_scale(10i128.checked_pow(decimals)?, 0);
    let wei = amount.checked_mul(scale)?.trunc();
    u128::from_str(&wei.to_string()).ok()
}
