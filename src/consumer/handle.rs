//! # Consumer Handle
//!
//! Owned lifecycle for a running consumer. [`CommandConsumer::start`] spawns the
//! poll loop on the tokio runtime; [`ConsumerHandle::stop`] lowers the running
//! flag, lets the in-flight batch observe it before its next message, and
//! returns what the loop did.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batch_processor::{BatchProcessor, BatchSummary};
use super::checkpoints::ConsumerCheckpoints;
use crate::config::ConsumerConfig;
use crate::error::{CommandBusError, Result};
use crate::messaging::{BatchControl, BatchSource, MessagingResult, Offset, PolledBatch};
use crate::metrics::CommandOutcome;

/// Totals for the lifetime of one consumer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerRunSummary {
    pub batches: usize,
    pub committed_batches: usize,
    pub aborted_batches: usize,
    pub messages: usize,
    pub poll_errors: usize,
    pub outcomes: HashMap<CommandOutcome, usize>,
}

impl ConsumerRunSummary {
    fn absorb(&mut self, batch: &BatchSummary) {
        self.batches += 1;
        self.messages += batch.processed();
        if batch.committed {
            self.committed_batches += 1;
        }
        if batch.aborted {
            self.aborted_batches += 1;
        }
        for (outcome, count) in batch.counts() {
            *self.outcomes.entry(outcome).or_insert(0) += count;
        }
    }

    pub fn count(&self, outcome: CommandOutcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

/// Adds the handle's running flag to the broker's own predicate
struct StoppableControl {
    inner: Arc<dyn BatchControl>,
    running: Arc<AtomicBool>,
}

#[async_trait]
impl BatchControl for StoppableControl {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.inner.is_running()
    }

    fn is_stale(&self) -> bool {
        self.inner.is_stale()
    }

    fn resolve_offset(&self, offset: Offset) {
        self.inner.resolve_offset(offset);
    }

    async fn heartbeat(&self) -> MessagingResult<()> {
        self.inner.heartbeat().await
    }

    async fn commit_offsets(&self) -> MessagingResult<()> {
        self.inner.commit_offsets().await
    }
}

/// A configured consumer that has not been started yet
pub struct CommandConsumer {
    processor: BatchProcessor,
    source: Arc<dyn BatchSource>,
    poll_idle: Duration,
}

impl std::fmt::Debug for CommandConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandConsumer")
            .field("processor", &self.processor)
            .field("poll_idle", &self.poll_idle)
            .finish_non_exhaustive()
    }
}

impl CommandConsumer {
    pub fn new(processor: BatchProcessor, source: Arc<dyn BatchSource>) -> Self {
        Self {
            processor,
            source,
            poll_idle: Duration::from_millis(ConsumerConfig::default().poll_idle_ms),
        }
    }

    pub fn with_poll_idle(mut self, poll_idle: Duration) -> Self {
        self.poll_idle = poll_idle;
        self
    }

    pub fn with_config(self, config: &ConsumerConfig) -> Self {
        self.with_poll_idle(Duration::from_millis(config.poll_idle_ms))
    }

    /// Spawn the poll loop
    pub fn start(self) -> ConsumerHandle {
        let consumer_id = Uuid::new_v4();
        let running = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());
        let checkpoints = self.processor.checkpoints().clone();

        info!(
            consumer_id = %consumer_id,
            service_name = %self.processor.service_name(),
            poll_idle_ms = self.poll_idle.as_millis() as u64,
            "🚀 Starting command consumer"
        );

        let task = tokio::spawn(run_loop(
            consumer_id,
            self.processor,
            self.source,
            self.poll_idle,
            Arc::clone(&running),
            Arc::clone(&wake),
        ));

        ConsumerHandle {
            consumer_id,
            running,
            wake,
            checkpoints,
            task,
        }
    }
}

async fn run_loop(
    consumer_id: Uuid,
    processor: BatchProcessor,
    source: Arc<dyn BatchSource>,
    poll_idle: Duration,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
) -> ConsumerRunSummary {
    let mut summary = ConsumerRunSummary::default();

    while running.load(Ordering::SeqCst) {
        let idle = match source.next_batch().await {
            Ok(Some(polled)) => {
                let polled = PolledBatch {
                    batch: polled.batch,
                    control: Arc::new(StoppableControl {
                        inner: polled.control,
                        running: Arc::clone(&running),
                    }),
                };
                let batch_summary = processor.process_batch(&polled).await;
                summary.absorb(&batch_summary);
                false
            }
            Ok(None) => true,
            Err(e) => {
                summary.poll_errors += 1;
                warn!(consumer_id = %consumer_id, error = %e, "Failed to poll for batch");
                true
            }
        };

        if idle && running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(poll_idle) => {}
                _ = wake.notified() => {
                    debug!(consumer_id = %consumer_id, "Consumer woken for shutdown");
                }
            }
        }
    }

    info!(
        consumer_id = %consumer_id,
        batches = summary.batches,
        messages = summary.messages,
        "Command consumer loop exited"
    );
    summary
}

/// Handle to a running consumer
#[derive(Debug)]
pub struct ConsumerHandle {
    consumer_id: Uuid,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    checkpoints: ConsumerCheckpoints,
    task: JoinHandle<ConsumerRunSummary>,
}

impl ConsumerHandle {
    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Checkpoints written by this consumer, for the reliability monitor
    pub fn checkpoints(&self) -> &ConsumerCheckpoints {
        &self.checkpoints
    }

    /// Stop after the current message and wait for the loop to exit
    pub async fn stop(self) -> Result<ConsumerRunSummary> {
        info!(consumer_id = %self.consumer_id, "Stopping command consumer");
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();

        self.task
            .await
            .map_err(|e| CommandBusError::Consumer(format!("consumer task failed: {e}")))
    }
}
