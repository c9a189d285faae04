/// Error types for the Telegram login bot.
use crate::messenger::DeliveryError;
use crate::store::VerificationStatus;
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum BotError {
    /// Configuration errors (missing or invalid environment variables).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store errors.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The store connection lock was poisoned by a panicking holder.
    #[error("Storage lock poisoned")]
    StoragePoisoned,

    /// Telegram API errors outside of message delivery.
    #[error("Telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    /// Classified message delivery failures.
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// A verification record was asked to move along an edge the state machine forbids.
    #[error("Verification {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: VerificationStatus,
        to: VerificationStatus,
    },

    /// Caller supplied malformed input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON payloads.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BotError {
    /// Whether a background job that failed with this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            BotError::Storage(_) | BotError::StoragePoisoned | BotError::Io(_) => true,
            BotError::Delivery(e) => e.reason().is_transient(),
            BotError::Telegram(_) => true,
            _ => false,
        }
    }
}

/// Convenient Result alias using our custom error type.
pub type Result<T> = std::result::Result<T, BotError>;
