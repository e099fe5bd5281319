//! # Idempotency
//!
//! Durable record of successfully processed commands, keyed by
//! `(tenant_id, idempotency_key, command_name)`. Records are created only after
//! a handler completes and are never mutated.
//!
//! - [`IdempotencyStore`]: the `check` / `record` contract
//! - [`InMemoryIdempotencyStore`]: test double with failure injection
//! - [`PgIdempotencyStore`]: Postgres implementation (feature `postgres`)
//! - [`IdempotencyGuard`]: applies the configured failure mode around a store

pub mod guard;
pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::IdempotencyFailureMode;
pub use guard::{GuardDecision, IdempotencyGuard};
pub use in_memory::InMemoryIdempotencyStore;
#[cfg(feature = "postgres")]
pub use pg::PgIdempotencyStore;

/// Errors raised by idempotency stores
#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("Idempotency store unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    #[error("Idempotency store query failed during {operation}: {message}")]
    Query { operation: String, message: String },

    #[error("Invalid idempotency table identifier: {0}")]
    InvalidTable(String),
}

impl IdempotencyError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                IdempotencyError::unavailable("database", err.to_string())
            }
            other => IdempotencyError::query("database", other.to_string()),
        }
    }
}

pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Identifies one logical command for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey<'a> {
    pub tenant_id: &'a str,
    pub key: &'a str,
    pub command_name: &'a str,
}

/// A processed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tenant_id: String,
    pub idempotency_key: String,
    pub command_name: String,
    pub command_id: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(key: &IdempotencyKey<'_>, command_id: Option<&str>) -> Self {
        Self {
            tenant_id: key.tenant_id.to_string(),
            idempotency_key: key.key.to_string(),
            command_name: key.command_name.to_string(),
            command_id: command_id.map(str::to_string),
            processed_at: Utc::now(),
        }
    }
}

/// Check-and-record contract. Implementations must make `record` an atomic
/// conditional insert so concurrent duplicates cannot both succeed.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Whether a record exists for the key
    async fn check(&self, key: &IdempotencyKey<'_>) -> IdempotencyResult<bool>;

    /// Insert the record if absent; returns `false` when it already existed
    async fn record(&self, record: &IdempotencyRecord) -> IdempotencyResult<bool>;
}
