//! Error types for the command bus.
//!

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::idempotency::IdempotencyError;
use crate::messaging::MessagingError;
use crate::monitoring::OutboxError;
use crate::registry::CommandError;

#[derive(Debug, Error)]
pub enum CommandBusError {
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),
    #[error("Idempotency store error: {0}")]
    Idempotency(#[from] IdempotencyError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("Outbox ledger error: {0}")]
    Outbox(#[from] OutboxError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Consumer error: {0}")]
    Consumer(String),
}

impl From<serde_json::Error> for CommandBusError {
    fn from(error: serde_json::Error) -> Self {
        CommandBusError::Messaging(MessagingError::from(error))
    }
}

pub type Result<T> = std::result::Result<T, CommandBusError>;
