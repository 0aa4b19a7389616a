use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{config::ConfigError, store::StoreError};

/// Error codes sent to clients in `ERROR` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    InvalidOrder,
    InvalidProduct,
    InvalidQuantity,
    DuplicateOrderId,
    UnauthorizedProduction,
    OfferExpired,
    RateLimitExceeded,
    ServiceUnavailable,
    InsufficientInventory,
    InvalidMessage,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidOrder => "INVALID_ORDER",
            ErrorCode::InvalidProduct => "INVALID_PRODUCT",
            ErrorCode::InvalidQuantity => "INVALID_QUANTITY",
            ErrorCode::DuplicateOrderId => "DUPLICATE_ORDER_ID",
            ErrorCode::UnauthorizedProduction => "UNAUTHORIZED_PRODUCTION",
            ErrorCode::OfferExpired => "OFFER_EXPIRED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InsufficientInventory => "INSUFFICIENT_INVENTORY",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
        };
        f.write_str(s)
    }
}

/// Everything an engine operation can refuse with.
///
/// Validation and business variants are raised before any state is touched. `Store` and
/// `ServiceUnavailable` come from the durable layer; by the time they reach a caller every
/// in-memory change made for the operation has been undone.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("order {0} already exists")]
    DuplicateOrderId(String),
    #[error("{0}")]
    InvalidOrder(String),
    #[error("{0}")]
    InvalidProduct(String),
    #[error("{0}")]
    InvalidQuantity(String),
    #[error("{0}")]
    InvalidMessage(String),
    #[error("team {team} is not authorized to produce {product}")]
    UnauthorizedProduction { team: String, product: String },
    #[error("{team} holds {available} {product}, needs {needed}")]
    InsufficientInventory {
        team: String,
        product: String,
        needed: u64,
        available: u64,
    },
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("offer {0} not found or expired")]
    OfferExpired(String),
    #[error("order rate limit exceeded")]
    RateLimited,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// The wire code reported to the client for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::AuthFailed(_) => ErrorCode::AuthFailed,
            EngineError::DuplicateOrderId(_) => ErrorCode::DuplicateOrderId,
            EngineError::InvalidOrder(_) | EngineError::InsufficientBalance(_) => {
                ErrorCode::InvalidOrder
            }
            EngineError::InvalidProduct(_) => ErrorCode::InvalidProduct,
            EngineError::InvalidQuantity(_) => ErrorCode::InvalidQuantity,
            EngineError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            EngineError::UnauthorizedProduction { .. } => ErrorCode::UnauthorizedProduction,
            EngineError::InsufficientInventory { .. } => ErrorCode::InsufficientInventory,
            EngineError::OfferExpired(_) => ErrorCode::OfferExpired,
            EngineError::RateLimited => ErrorCode::RateLimitExceeded,
            EngineError::ServiceUnavailable(_)
            | EngineError::Store(_)
            | EngineError::Config(_) => ErrorCode::ServiceUnavailable,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
