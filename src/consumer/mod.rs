//! # Batch Consumer
//!
//! Consumes command batches from a subscribed topic with at-least-once
//! delivery and at-most-once effect.

pub mod batch_processor;
pub mod checkpoints;
pub mod handle;

pub use batch_processor::{BatchProcessor, BatchSummary};
pub use checkpoints::ConsumerCheckpoints;
pub use handle::{CommandConsumer, ConsumerHandle, ConsumerRunSummary};
