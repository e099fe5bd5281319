//! # Monitoring
//!
//! Observational views of delivery health. Nothing here writes to the outbox
//! or the broker.

pub mod outbox;
pub mod reliability;

pub use outbox::{
    InMemoryOutboxLedger, OutboxError, OutboxLedger, OutboxResult, OutboxRow, OutboxStatus,
    OutboxStatusSummary,
};
#[cfg(feature = "postgres")]
pub use outbox::PgOutboxLedger;
pub use reliability::{
    BrokerHealth, ConsumerHealth, DeadLetterHealth, HealthStatus, OutboxHealth, PartitionLag,
    ReliabilityMonitor, ReliabilitySnapshot, MAX_SAFE_INTEGER,
};
