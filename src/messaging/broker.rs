//! # Broker Traits
//!
//! Provider-agnostic view of a partitioned, ordered log with consumer-group
//! semantics. The consumer loop, the dead-letter router and the reliability
//! monitor depend only on these traits; concrete clients live behind them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::errors::MessagingResult;

/// A log position. Native 64-bit throughout; clamping for display happens only
/// when snapshots are serialized.
pub type Offset = i64;

/// Header naming the service that produced a record
pub const PRODUCER_ID_HEADER: &str = "producer-id";

/// A message delivered from a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub offset: Offset,
    pub timestamp: DateTime<Utc>,
    pub partition: i32,
    pub headers: HashMap<String, String>,
}

impl BrokerMessage {
    pub fn new(partition: i32, offset: Offset, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            value: value.into(),
            offset,
            timestamp: Utc::now(),
            partition,
            headers: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Messages for one `(topic, partition)` delivered together
#[derive(Debug, Clone)]
pub struct Batch {
    pub topic: String,
    pub partition: i32,
    /// Next offset to be written on the partition when the batch was fetched
    pub high_watermark: Offset,
    pub messages: Vec<BrokerMessage>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_offset(&self) -> Option<Offset> {
        self.messages.last().map(|m| m.offset)
    }
}

/// Lag of a consumer positioned after `last_processed` on a partition whose next
/// write position is `high_watermark`. Floored at zero.
pub fn consumer_lag(high_watermark: Offset, last_processed: Offset) -> Offset {
    high_watermark
        .saturating_sub(last_processed)
        .saturating_sub(1)
        .max(0)
}

/// Group-coordination hooks handed to the consumer together with a batch
#[async_trait]
pub trait BatchControl: Send + Sync {
    /// The consumer has not been asked to stop
    fn is_running(&self) -> bool;

    /// Group coordination revoked this member's assignment mid-batch
    fn is_stale(&self) -> bool;

    /// Mark `offset` as processed in the local cursor
    fn resolve_offset(&self, offset: Offset);

    /// Signal liveness to the group coordinator
    async fn heartbeat(&self) -> MessagingResult<()>;

    /// Commit resolved offsets for the batch
    async fn commit_offsets(&self) -> MessagingResult<()>;
}

/// A batch together with its coordination handle
pub struct PolledBatch {
    pub batch: Batch,
    pub control: Arc<dyn BatchControl>,
}

impl std::fmt::Debug for PolledBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledBatch")
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

/// Source of batches for one subscribed topic
#[async_trait]
pub trait BatchSource: Send + Sync + 'static {
    /// Fetch the next batch, or `None` when nothing is currently available
    async fn next_batch(&self) -> MessagingResult<Option<PolledBatch>>;
}

/// Outbound record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// Publishes records to a topic
#[async_trait]
pub trait MessageProducer: Send + Sync + 'static {
    async fn send(&self, topic: &str, record: ProducerRecord) -> MessagingResult<()>;
}

/// High and low watermarks of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOffsets {
    pub partition: i32,
    /// Next offset to be written
    pub high: Offset,
    /// Earliest retained offset
    pub low: Offset,
}

impl PartitionOffsets {
    /// Records currently retained on the partition
    pub fn depth(&self) -> Offset {
        self.high.saturating_sub(self.low).max(0)
    }
}

/// Opens administrative sessions against the broker
#[async_trait]
pub trait BrokerAdmin: Send + Sync + 'static {
    async fn connect(&self) -> MessagingResult<Box<dyn AdminSession>>;
}

/// A connected administrative session
#[async_trait]
pub trait AdminSession: Send + Sync {
    async fn fetch_topic_offsets(&self, topic: &str) -> MessagingResult<Vec<PartitionOffsets>>;

    async fn disconnect(self: Box<Self>) -> MessagingResult<()>;
}
