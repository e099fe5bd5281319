//! # Outbox Ledger
//!
//! Read-only view of the transactional outbox table written by producers.
//! Only the aggregate by status is needed here; the relay that moves rows to
//! the broker runs elsewhere.
//!
//! Expected columns:
//!
//! ```sql
//! id           UUID PRIMARY KEY,
//! payload      JSONB       NOT NULL,
//! status       TEXT        NOT NULL, -- PENDING | IN_PROGRESS | FAILED | DLQ
//! available_at TIMESTAMPTZ NOT NULL,
//! created_at   TIMESTAMPTZ NOT NULL,
//! updated_at   TIMESTAMPTZ NOT NULL
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "postgres")]
use crate::config::is_safe_table_identifier;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Outbox query failed: {0}")]
    Query(String),

    #[error("Invalid outbox table identifier: {0}")]
    InvalidTable(String),

    #[error("Unknown outbox status: {0}")]
    UnknownStatus(String),
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        OutboxError::Query(err.to_string())
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    InProgress,
    Failed,
    Dlq,
}

impl OutboxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Failed => "FAILED",
            Self::Dlq => "DLQ",
        }
    }

    /// Rows that still need to reach the broker
    pub const fn is_backlog(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "FAILED" => Ok(Self::Failed),
            "DLQ" => Ok(Self::Dlq),
            other => Err(OutboxError::UnknownStatus(other.to_string())),
        }
    }
}

/// One outbox row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: Uuid,
    pub payload: Value,
    pub status: OutboxStatus,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRow {
    pub fn new(status: OutboxStatus, available_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload: Value::Null,
            status,
            available_at,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Row counts by status plus the oldest backlog row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStatusSummary {
    pub pending: i64,
    pub in_progress: i64,
    pub failed: i64,
    pub dlq: i64,
    /// Oldest `available_at` among PENDING and FAILED rows
    pub oldest_available_at: Option<DateTime<Utc>>,
}

impl OutboxStatusSummary {
    pub fn add(&mut self, status: OutboxStatus, count: i64, available_at: Option<DateTime<Utc>>) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::InProgress => self.in_progress += count,
            OutboxStatus::Failed => self.failed += count,
            OutboxStatus::Dlq => self.dlq += count,
        }
        if status.is_backlog() {
            if let Some(at) = available_at {
                self.oldest_available_at = Some(match self.oldest_available_at {
                    Some(current) => current.min(at),
                    None => at,
                });
            }
        }
    }

    /// Seconds the oldest backlog row has been available, floored at zero
    pub fn backlog_age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.oldest_available_at
            .map(|at| (now - at).num_seconds().max(0))
    }
}

#[async_trait]
pub trait OutboxLedger: Send + Sync + 'static {
    async fn status_summary(&self) -> OutboxResult<OutboxStatusSummary>;
}

#[cfg(feature = "postgres")]
#[derive(Debug, sqlx::FromRow)]
struct OutboxStatusRow {
    status: String,
    count: i64,
    oldest_available_at: Option<DateTime<Utc>>,
}

/// Postgres outbox reader
#[cfg(feature = "postgres")]
#[derive(Debug, Clone)]
pub struct PgOutboxLedger {
    pool: sqlx::PgPool,
    summary_sql: String,
}

#[cfg(feature = "postgres")]
impl PgOutboxLedger {
    pub fn new(pool: sqlx::PgPool, table_name: &str) -> OutboxResult<Self> {
        if !is_safe_table_identifier(table_name) {
            return Err(OutboxError::InvalidTable(table_name.to_string()));
        }
        Ok(Self {
            pool,
            summary_sql: format!(
                "SELECT status, COUNT(*)::BIGINT AS count, \
                 MIN(available_at) AS oldest_available_at \
                 FROM {table_name} \
                 WHERE status IN ('PENDING', 'IN_PROGRESS', 'FAILED', 'DLQ') \
                 GROUP BY status"
            ),
        })
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl OutboxLedger for PgOutboxLedger {
    async fn status_summary(&self) -> OutboxResult<OutboxStatusSummary> {
        let rows = sqlx::query_as::<_, OutboxStatusRow>(&self.summary_sql)
            .fetch_all(&self.pool)
            .await?;

        let mut summary = OutboxStatusSummary::default();
        for row in rows {
            let status = OutboxStatus::from_str(&row.status)?;
            summary.add(status, row.count, row.oldest_available_at);
        }
        Ok(summary)
    }
}

/// In-memory outbox for tests
#[derive(Debug, Default)]
pub struct InMemoryOutboxLedger {
    rows: Mutex<Vec<OutboxRow>>,
    failure: Mutex<Option<String>>,
}

impl InMemoryOutboxLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: OutboxRow) {
        self.rows.lock().push(row);
    }

    /// Insert `count` rows with `status`, all available at `available_at`
    pub fn insert_many(&self, status: OutboxStatus, count: usize, available_at: DateTime<Utc>) {
        let mut rows = self.rows.lock();
        rows.extend((0..count).map(|_| OutboxRow::new(status, available_at)));
    }

    /// Make `status_summary` fail with `message`, or succeed again with `None`
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_string);
    }
}

#[async_trait]
impl OutboxLedger for InMemoryOutboxLedger {
    async fn status_summary(&self) -> OutboxResult<OutboxStatusSummary> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(OutboxError::Query(message));
        }

        let mut summary = OutboxStatusSummary::default();
        for row in self.rows.lock().iter() {
            summary.add(row.status, 1, Some(row.available_at));
        }
        Ok(summary)
    }
}
