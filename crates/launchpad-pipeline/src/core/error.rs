//! Centralized error types for the launchpad pipeline

use thiserror::Error;
use uuid::Uuid;

/// Coarse classification used to decide retry and propagation behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lost a reservation race; the caller retries with a fresh selection
    Conflict,
    /// Phase, whitelist, limit or ownership rule rejected the request
    Eligibility,
    /// Malformed or mismatched on-chain proof or queue payload
    Validation,
    /// Queue, chain, cache or database unavailable
    Transient,
    /// On-chain state contradicts local state
    FatalConsistency,
}

/// Main pipeline error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Eligibility(#[from] EligibilityError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Allocation state-machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("reservation conflict on item {item_id}, retry with a fresh selection")]
    ReservationConflict { item_id: Uuid },

    #[error("no available item for launch {launch_id}")]
    NoAvailableItem { launch_id: Uuid },

    #[error("item {item_id} is not held by you")]
    NotHeldByYou { item_id: Uuid },

    #[error("item {item_id} is already sold")]
    AlreadySold { item_id: Uuid },

    #[error("launch not found: {0}")]
    LaunchNotFound(Uuid),

    #[error("launch item not found: {0}")]
    ItemNotFound(Uuid),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("buyer not found: {0}")]
    BuyerNotFound(Uuid),

    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidOrderTransition {
        order_id: Uuid,
        from: String,
        to: String,
    },
}

/// Phase, whitelist and wallet-limit errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EligibilityError {
    #[error("no active phase for launch {launch_id}")]
    NoActivePhase { launch_id: Uuid },

    #[error("address {address} is not eligible for the {phase} phase")]
    NotEligibleForPhase { phase: String, address: String },

    #[error("wallet limit reached: {purchased} of {limit} in the {phase} phase")]
    WalletLimitReached {
        phase: String,
        limit: u32,
        purchased: u32,
    },

    #[error("buyer account {0} is not active")]
    BuyerInactive(Uuid),
}

/// On-chain proof and payload validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("transaction {0} has no receipt")]
    MissingReceipt(String),

    #[error("transaction {0} reverted")]
    TransactionFailed(String),

    #[error("expected {expected} matching events, found {found}")]
    EventCount { expected: usize, found: usize },

    #[error("{field} mismatch: expected {expected}, found {found}")]
    Mismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("malformed log entry: {0}")]
    MalformedLog(String),

    #[error("malformed work message: {0}")]
    MalformedMessage(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no event signature configured for {0}")]
    UnknownEvent(&'static str),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Nonce rejected: {0}")]
    Nonce(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("transaction {0} is not final yet")]
    NotFinal(String),
}

impl PipelineError {
    /// Classify this error for retry and propagation decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Allocation(AllocationError::ReservationConflict { .. }) => {
                ErrorKind::Conflict
            }
            PipelineError::Allocation(_) | PipelineError::Eligibility(_) => ErrorKind::Eligibility,
            PipelineError::Validation(_)
            | PipelineError::Serialization(_)
            | PipelineError::Configuration(_) => ErrorKind::Validation,
            PipelineError::Consistency(_) => ErrorKind::FatalConsistency,
            PipelineError::Storage(_) | PipelineError::Network(_) | PipelineError::Other(_) => {
                ErrorKind::Transient
            }
        }
    }

    /// Conflicts and infrastructure failures may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Transient)
    }

    /// True for errors raised by the chain client around nonce assignment
    pub fn is_nonce_error(&self) -> bool {
        match self {
            PipelineError::Network(NetworkError::Nonce(_)) => true,
            PipelineError::Network(NetworkError::Rpc { message, .. }) => {
                let message = message.to_ascii_lowercase();
                message.contains("nonce") || message.contains("replacement transaction")
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::Eligibility => "eligibility",
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::FatalConsistency => "fatal_consistency",
        };
        f.write_str(label)
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Helper to convert sqlx errors
impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => PipelineError::Storage(StorageError::PoolExhausted),
            other => PipelineError::Storage(StorageError::Database(other.to_string())),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for PipelineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        PipelineError::Storage(StorageError::MigrationFailed(err.to_string()))
    }
}

/// Helper to convert redis errors
impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        PipelineError::Storage(StorageError::Cache(err.to_string()))
    }
}

impl From<deadpool_redis::PoolError> for PipelineError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        PipelineError::Storage(StorageError::Cache(err.to_string()))
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Network(NetworkError::ConnectionFailed(err.to_string()))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let conflict: PipelineError = AllocationError::ReservationConflict {
            item_id: Uuid::nil(),
        }
        .into();
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(conflict.is_retryable());

        let sold: PipelineError = AllocationError::AlreadySold { item_id: Uuid::nil() }.into();
        assert_eq!(sold.kind(), ErrorKind::Eligibility);
        assert!(!sold.is_retryable());

        let timeout: PipelineError =
            NetworkError::Timeout(std::time::Duration::from_secs(5)).into();
        assert!(timeout.is_retryable());

        let fatal = PipelineError::Consistency("minted to stranger".to_string());
        assert_eq!(fatal.kind(), ErrorKind::FatalConsistency);
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_nonce_error_detection() {
        let err: PipelineError = NetworkError::Rpc {
            code: -32000,
            message: "nonce too low".to_string(),
        }
        .into();
        assert!(err.is_nonce_error());

        let err: PipelineError = NetworkError::Rpc {
            code: -32000,
            message: "insufficient funds".to_string(),
        }
        .into();
        assert!(!err.is_nonce_error());
    }
}
