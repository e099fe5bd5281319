//! # In-Memory Broker
//!
//! Thread-safe in-memory partitioned log for testing and development.
//!
//! ## Features
//!
//! - **Partitioned topics** with per-partition offsets and low/high watermarks
//! - **Consumer groups**: committed offsets tracked per `(group, topic, partition)`
//! - **Failure injection**: unreachable admin API, failing producer sends,
//!   assignments revoked after a number of heartbeats
//! - Implements [`BatchSource`], [`MessageProducer`] and [`BrokerAdmin`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::broker::{
    AdminSession, Batch, BatchControl, BatchSource, BrokerAdmin, BrokerMessage, MessageProducer,
    Offset, PartitionOffsets, PolledBatch, ProducerRecord,
};
use super::errors::{MessagingError, MessagingResult};

#[derive(Debug, Default)]
struct InMemoryPartition {
    /// Retained messages; `records[i].offset == low + i`
    records: Vec<BrokerMessage>,
    low: Offset,
}

impl InMemoryPartition {
    fn high(&self) -> Offset {
        self.low + self.records.len() as Offset
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<InMemoryPartition>>,
    /// (group, topic, partition) -> next offset to consume
    committed: HashMap<(String, String, i32), Offset>,
}

/// In-memory broker shared by producers, consumers and admin sessions
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    admin_reachable: AtomicBool,
    fail_sends: AtomicBool,
    admin_sessions_opened: AtomicU64,
    admin_sessions_closed: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            admin_reachable: AtomicBool::new(true),
            ..Self::default()
        })
    }

    /// Create a topic with `partitions` partitions (no-op if it exists)
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state.lock();
        state.topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions.max(1))
                .map(|_| InMemoryPartition::default())
                .collect()
        });
    }

    /// Append a message and return its offset
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        value: impl Into<Vec<u8>>,
    ) -> MessagingResult<Offset> {
        let mut state = self.state.lock();
        let partitions = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| MessagingError::topic_not_found(topic))?;
        let part = partitions
            .get_mut(partition as usize)
            .ok_or_else(|| MessagingError::topic_operation(topic, "produce", "unknown partition"))?;

        let offset = part.high();
        let mut message = BrokerMessage::new(partition, offset, value);
        message.key = key.map(str::to_string);
        message.timestamp = Utc::now();
        part.records.push(message);
        Ok(offset)
    }

    /// Drop records below `offset` on a partition, advancing the low watermark
    pub fn delete_records_before(&self, topic: &str, partition: i32, offset: Offset) {
        let mut state = self.state.lock();
        if let Some(part) = state
            .topics
            .get_mut(topic)
            .and_then(|p| p.get_mut(partition as usize))
        {
            let drop_count = (offset - part.low).clamp(0, part.records.len() as Offset) as usize;
            part.records.drain(..drop_count);
            part.low += drop_count as Offset;
        }
    }

    /// All retained messages on a topic, partition by partition (for testing)
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .map(|parts| {
                parts
                    .iter()
                    .flat_map(|p| p.records.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next offset the group will consume on a partition
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<Offset> {
        let state = self.state.lock();
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Make the administrative API unreachable (or reachable again)
    pub fn set_admin_reachable(&self, reachable: bool) {
        self.admin_reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make producer sends fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn admin_sessions_opened(&self) -> u64 {
        self.admin_sessions_opened.load(Ordering::SeqCst)
    }

    pub fn admin_sessions_closed(&self) -> u64 {
        self.admin_sessions_closed.load(Ordering::SeqCst)
    }

    fn commit(&self, group: &str, topic: &str, partition: i32, next_offset: Offset) {
        let mut state = self.state.lock();
        let entry = state
            .committed
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(next_offset);
        *entry = (*entry).max(next_offset);
    }

    fn partition_offsets(&self, topic: &str) -> MessagingResult<Vec<PartitionOffsets>> {
        let state = self.state.lock();
        let parts = state
            .topics
            .get(topic)
            .ok_or_else(|| MessagingError::topic_not_found(topic))?;
        Ok(parts
            .iter()
            .enumerate()
            .map(|(idx, p)| PartitionOffsets {
                partition: idx as i32,
                high: p.high(),
                low: p.low,
            })
            .collect())
    }

    /// Fetch up to `max_messages` uncommitted messages for a group from the
    /// first partition that has any
    fn fetch_batch(&self, group: &str, topic: &str, max_messages: usize) -> Option<Batch> {
        let state = self.state.lock();
        let parts = state.topics.get(topic)?;

        for (idx, part) in parts.iter().enumerate() {
            let partition = idx as i32;
            let start = state
                .committed
                .get(&(group.to_string(), topic.to_string(), partition))
                .copied()
                .unwrap_or(part.low)
                .max(part.low);
            if start >= part.high() {
                continue;
            }
            let from = (start - part.low) as usize;
            let messages: Vec<BrokerMessage> = part.records[from..]
                .iter()
                .take(max_messages.max(1))
                .cloned()
                .collect();
            return Some(Batch {
                topic: topic.to_string(),
                partition,
                high_watermark: part.high(),
                messages,
            });
        }
        None
    }
}

#[async_trait]
impl MessageProducer for InMemoryBroker {
    async fn send(&self, topic: &str, record: ProducerRecord) -> MessagingResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MessagingError::topic_operation(
                topic,
                "send",
                "injected producer failure",
            ));
        }

        let mut state = self.state.lock();
        let parts = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| MessagingError::topic_not_found(topic))?;
        let part = &mut parts[0];
        let offset = part.high();
        part.records.push(BrokerMessage {
            key: Some(record.key),
            value: record.value,
            offset,
            timestamp: Utc::now(),
            partition: 0,
            headers: record.headers,
        });
        debug!(topic = %topic, offset = offset, "In-memory record produced");
        Ok(())
    }
}

#[async_trait]
impl BrokerAdmin for Arc<InMemoryBroker> {
    async fn connect(&self) -> MessagingResult<Box<dyn AdminSession>> {
        if !self.admin_reachable.load(Ordering::SeqCst) {
            return Err(MessagingError::broker_unreachable(
                "in-memory broker admin API disabled",
            ));
        }
        self.admin_sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryAdminSession {
            broker: Arc::clone(self),
        }))
    }
}

struct InMemoryAdminSession {
    broker: Arc<InMemoryBroker>,
}

#[async_trait]
impl AdminSession for InMemoryAdminSession {
    async fn fetch_topic_offsets(&self, topic: &str) -> MessagingResult<Vec<PartitionOffsets>> {
        if !self.broker.admin_reachable.load(Ordering::SeqCst) {
            return Err(MessagingError::broker_unreachable("admin session lost"));
        }
        self.broker.partition_offsets(topic)
    }

    async fn disconnect(self: Box<Self>) -> MessagingResult<()> {
        self.broker
            .admin_sessions_closed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Coordination handle for a batch fetched from the in-memory broker
#[derive(Debug)]
pub struct InMemoryBatchControl {
    broker: Arc<InMemoryBroker>,
    group: String,
    topic: String,
    partition: i32,
    resolved: Mutex<Option<Offset>>,
    heartbeats: AtomicUsize,
    commits: AtomicUsize,
    stale_after_heartbeats: Option<usize>,
    running: AtomicBool,
}

impl InMemoryBatchControl {
    pub fn new(broker: Arc<InMemoryBroker>, group: &str, topic: &str, partition: i32) -> Self {
        Self {
            broker,
            group: group.to_string(),
            topic: topic.to_string(),
            partition,
            resolved: Mutex::new(None),
            heartbeats: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            stale_after_heartbeats: None,
            running: AtomicBool::new(true),
        }
    }

    /// Report the assignment as revoked once `n` heartbeats have been sent
    pub fn with_stale_after(mut self, n: usize) -> Self {
        self.stale_after_heartbeats = Some(n);
        self
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn resolved_offset(&self) -> Option<Offset> {
        *self.resolved.lock()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchControl for InMemoryBatchControl {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_stale(&self) -> bool {
        self.stale_after_heartbeats
            .is_some_and(|n| self.heartbeats.load(Ordering::SeqCst) >= n)
    }

    fn resolve_offset(&self, offset: Offset) {
        let mut resolved = self.resolved.lock();
        *resolved = Some(resolved.map_or(offset, |current| current.max(offset)));
    }

    async fn heartbeat(&self) -> MessagingResult<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_offsets(&self) -> MessagingResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if let Some(offset) = self.resolved_offset() {
            self.broker
                .commit(&self.group, &self.topic, self.partition, offset + 1);
        }
        Ok(())
    }
}

/// Consumer-group member reading one topic from the in-memory broker
#[derive(Debug)]
pub struct InMemoryBatchSource {
    broker: Arc<InMemoryBroker>,
    group: String,
    topic: String,
    max_batch_size: usize,
}

impl InMemoryBatchSource {
    pub fn new(broker: Arc<InMemoryBroker>, group: &str, topic: &str) -> Self {
        Self {
            broker,
            group: group.to_string(),
            topic: topic.to_string(),
            max_batch_size: 100,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }
}

#[async_trait]
impl BatchSource for InMemoryBatchSource {
    async fn next_batch(&self) -> MessagingResult<Option<PolledBatch>> {
        let Some(batch) = self
            .broker
            .fetch_batch(&self.group, &self.topic, self.max_batch_size)
        else {
            return Ok(None);
        };

        let control = InMemoryBatchControl::new(
            Arc::clone(&self.broker),
            &self.group,
            &self.topic,
            batch.partition,
        );
        Ok(Some(PolledBatch {
            batch,
            control: Arc::new(control),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_produce_and_fetch_batch() {
        let broker = InMemoryBroker::new();
        broker.create_topic("commands", 2);
        broker.produce("commands", 1, Some("k1"), "a").unwrap();
        broker.produce("commands", 1, None, "b").unwrap();

        let source = InMemoryBatchSource::new(Arc::clone(&broker), "billing", "commands");
        let polled = source.next_batch().await.unwrap().expect("batch available");
        assert_eq!(polled.batch.partition, 1);
        assert_eq!(polled.batch.messages.len(), 2);
        assert_eq!(polled.batch.high_watermark, 2);

        polled.control.resolve_offset(1);
        polled.control.commit_offsets().await.unwrap();
        assert_eq!(broker.committed_offset("billing", "commands", 1), Some(2));
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_admin_offsets_and_retention() {
        let broker = InMemoryBroker::new();
        broker.create_topic("commands.dlq", 1);
        for _ in 0..5 {
            broker.produce("commands.dlq", 0, None, "x").unwrap();
        }
        broker.delete_records_before("commands.dlq", 0, 3);

        let session = broker.connect().await.unwrap();
        let offsets = session.fetch_topic_offsets("commands.dlq").await.unwrap();
        session.disconnect().await.unwrap();

        assert_eq!(offsets[0].high, 5);
        assert_eq!(offsets[0].low, 3);
        assert_eq!(offsets[0].depth(), 2);
        assert_eq!(broker.admin_sessions_opened(), 1);
        assert_eq!(broker.admin_sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_admin() {
        let broker = InMemoryBroker::new();
        broker.set_admin_reachable(false);
        let err = broker.connect().await.err().expect("connect should fail");
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_stale_after_heartbeats() {
        let broker = InMemoryBroker::new();
        let control = InMemoryBatchControl::new(broker, "g", "t", 0).with_stale_after(2);
        assert!(!control.is_stale());
        control.heartbeat().await.unwrap();
        control.heartbeat().await.unwrap();
        assert!(control.is_stale());
    }
}
