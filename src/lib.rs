#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Command Bus Core
//!
//! Reliable command delivery and processing over a partitioned, ordered log.
//!
//! ## Overview
//!
//! Services exchange commands through a shared topic instead of calling each
//! other directly. This crate is the consuming side of that contract: a command
//! written once is eventually picked up, applied with at-most-once effect
//! despite at-least-once delivery, retried on transient failure, diverted to a
//! dead-letter topic on permanent failure, and observable through on-demand
//! reliability snapshots.
//!
//! ## Module Organization
//!
//! - [`consumer`] - Batch consumer loop and its owned start/stop handle
//! - [`idempotency`] - Dedup store contract, Postgres and in-memory stores, guard
//! - [`registry`] - Command name to typed handler routing
//! - [`resilience`] - Bounded retry with backoff
//! - [`dead_letter`] - Dead-letter payloads and publishing
//! - [`monitoring`] - Outbox ledger reader and reliability snapshots
//! - [`messaging`] - Envelope types and broker traits, with an in-memory broker
//! - [`metrics`] - Observer interface and OpenTelemetry recorder
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use command_bus::config::CommandBusConfig;
//! use command_bus::consumer::{BatchProcessor, CommandConsumer};
//! use command_bus::idempotency::InMemoryIdempotencyStore;
//! use command_bus::messaging::{InMemoryBatchSource, InMemoryBroker};
//! use command_bus::registry::CommandRouter;
//!
//! # async fn example() -> command_bus::Result<()> {
//! command_bus::logging::init_structured_logging();
//!
//! let config = CommandBusConfig::default();
//! let broker = InMemoryBroker::new();
//! broker.create_topic(&config.consumer.topic, 1);
//! broker.create_topic(&config.consumer.dead_letter_topic, 1);
//!
//! let router = CommandRouter::new();
//! // router.register_handler("ApplyPayment", ApplyPaymentHandler).await;
//!
//! let processor = BatchProcessor::from_config(
//!     &config,
//!     router,
//!     broker.clone(),
//!     Some(Arc::new(InMemoryIdempotencyStore::new())),
//! );
//! let source = Arc::new(InMemoryBatchSource::new(
//!     broker.clone(),
//!     &config.consumer.group_id,
//!     &config.consumer.topic,
//! ));
//!
//! let handle = CommandConsumer::new(processor, source)
//!     .with_config(&config.consumer)
//!     .start();
//!
//! // ... later
//! let summary = handle.stop().await?;
//! println!("processed {} messages", summary.messages);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod monitoring;
pub mod registry;
pub mod resilience;

pub use config::{CommandBusConfig, ConfigManager, IdempotencyFailureMode};
pub use consumer::{
    BatchProcessor, BatchSummary, CommandConsumer, ConsumerCheckpoints, ConsumerHandle,
    ConsumerRunSummary,
};
pub use dead_letter::{DeadLetterOutcome, DeadLetterPayload, DeadLetterRouter, FailureReason};
pub use error::{CommandBusError, Result};
pub use idempotency::{IdempotencyGuard, IdempotencyStore};
pub use messaging::{CommandEnvelope, CommandMetadata};
pub use metrics::{CommandObserver, CommandOutcome, NoopObserver};
pub use monitoring::{ReliabilityMonitor, ReliabilitySnapshot};
pub use registry::{CommandContext, CommandError, CommandRouter, TypedCommandHandler};
pub use resilience::{RetryController, RetryPolicy};
