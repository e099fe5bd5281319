//! # Messaging Module
//!
//! Command envelopes and the broker seams the consumer loop, dead-letter
//! router and reliability monitor are written against.

pub mod broker;
pub mod envelope;
pub mod errors;
pub mod in_memory;

pub use broker::{
    consumer_lag, AdminSession, Batch, BatchControl, BatchSource, BrokerAdmin, BrokerMessage,
    MessageProducer, Offset, PartitionOffsets, PolledBatch, ProducerRecord, PRODUCER_ID_HEADER,
};
pub use envelope::{
    decode_body, CommandEnvelope, CommandMetadata, DecodedBody, Ineligible, InitiatedBy,
    ValidatedMetadata,
};
pub use errors::{MessagingError, MessagingResult};
pub use in_memory::{InMemoryBatchControl, InMemoryBatchSource, InMemoryBroker};
