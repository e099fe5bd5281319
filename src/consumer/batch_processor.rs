//! # Batch Processor
//!
//! Processes one batch for a single `(topic, partition)` in arrival order:
//!
//! 1. Stop before the next message if the consumer is no longer running or the
//!    assignment went stale. Nothing further is resolved or committed.
//! 2. Decode the body. Undecodable bytes are dead-lettered as `PARSING_ERROR`.
//! 3. Apply the routing predicate; ineligible envelopes are skipped.
//! 4. Consult the idempotency guard.
//! 5. Route to the registered handler under the retry controller. Unregistered
//!    commands are a no-op. On exhaustion the message is dead-lettered as
//!    `HANDLER_FAILURE`.
//! 6. Resolve the offset and heartbeat.
//!
//! Offsets are committed once, at the end of a batch that was not aborted.
//! Every path continues with the next message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::checkpoints::ConsumerCheckpoints;
use crate::config::CommandBusConfig;
use crate::dead_letter::{DeadLetterPayload, DeadLetterRouter, ErrorInfo};
use crate::idempotency::{GuardDecision, IdempotencyGuard, IdempotencyStore};
use crate::logging::log_command_operation;
use crate::messaging::{
    consumer_lag, decode_body, BrokerMessage, DecodedBody, Ineligible, MessageProducer, Offset,
    PolledBatch,
};
use crate::metrics::{CommandObserver, CommandOutcome, NoopObserver, UNKNOWN_COMMAND};
use crate::registry::{CommandContext, CommandRouter, RouteOutcome};
use crate::resilience::{RetryController, RetryPolicy};

/// What happened to one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub topic: String,
    pub partition: i32,
    /// Per-message outcomes, in processing order
    pub outcomes: Vec<(Offset, CommandOutcome)>,
    /// The batch stopped early because the consumer stopped or went stale
    pub aborted: bool,
    pub committed: bool,
    pub last_resolved: Option<Offset>,
    pub lag: Option<Offset>,
}

impl BatchSummary {
    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn count(&self, outcome: CommandOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    pub fn counts(&self) -> HashMap<CommandOutcome, usize> {
        let mut counts = HashMap::new();
        for (_, outcome) in &self.outcomes {
            *counts.entry(*outcome).or_insert(0) += 1;
        }
        counts
    }
}

/// Per-message pipeline shared by every batch of a consumer
#[derive(Clone)]
pub struct BatchProcessor {
    service_name: String,
    router: CommandRouter,
    guard: IdempotencyGuard,
    retry: RetryController,
    dead_letter: DeadLetterRouter,
    observer: Arc<dyn CommandObserver>,
    checkpoints: ConsumerCheckpoints,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("service_name", &self.service_name)
            .field("router", &self.router)
            .field("guard", &self.guard)
            .field("retry", &self.retry)
            .field("dead_letter", &self.dead_letter)
            .finish_non_exhaustive()
    }
}

impl BatchProcessor {
    pub fn new(
        service_name: impl Into<String>,
        router: CommandRouter,
        dead_letter: DeadLetterRouter,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            router,
            guard: IdempotencyGuard::disabled(),
            retry: RetryController::default(),
            dead_letter,
            observer: Arc::new(NoopObserver),
            checkpoints: ConsumerCheckpoints::new(),
        }
    }

    /// Build a processor from configuration. `store` enables deduplication.
    pub fn from_config(
        config: &CommandBusConfig,
        router: CommandRouter,
        producer: Arc<dyn MessageProducer>,
        store: Option<Arc<dyn IdempotencyStore>>,
    ) -> Self {
        let dead_letter = DeadLetterRouter::new(
            producer,
            config.consumer.dead_letter_topic.clone(),
            config.service_name.clone(),
        );
        let mut processor = Self::new(config.service_name.clone(), router, dead_letter)
            .with_retry_policy(RetryPolicy::from(&config.retry));
        if let Some(store) = store {
            processor = processor.with_idempotency(IdempotencyGuard::new(
                store,
                config.idempotency.failure_mode,
            ));
        }
        processor
    }

    pub fn with_idempotency(mut self, guard: IdempotencyGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryController::new(policy);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommandObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: ConsumerCheckpoints) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn checkpoints(&self) -> &ConsumerCheckpoints {
        &self.checkpoints
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn process_batch(&self, polled: &PolledBatch) -> BatchSummary {
        let batch = &polled.batch;
        let control = &polled.control;
        let mut summary = BatchSummary {
            topic: batch.topic.clone(),
            partition: batch.partition,
            ..BatchSummary::default()
        };

        for message in &batch.messages {
            if !control.is_running() || control.is_stale() {
                warn!(
                    topic = %batch.topic,
                    partition = batch.partition,
                    offset = message.offset,
                    running = control.is_running(),
                    stale = control.is_stale(),
                    "Aborting batch before offset; remaining messages will be redelivered"
                );
                summary.aborted = true;
                break;
            }

            let outcome = self.process_message(&batch.topic, message).await;
            summary.outcomes.push((message.offset, outcome));

            control.resolve_offset(message.offset);
            self.checkpoints
                .record(&batch.topic, batch.partition, message.offset);
            summary.last_resolved = Some(message.offset);

            if let Err(e) = control.heartbeat().await {
                warn!(
                    topic = %batch.topic,
                    partition = batch.partition,
                    error = %e,
                    "Heartbeat failed"
                );
            }
        }

        if !summary.aborted && summary.last_resolved.is_some() {
            match control.commit_offsets().await {
                Ok(()) => summary.committed = true,
                Err(e) => error!(
                    topic = %batch.topic,
                    partition = batch.partition,
                    last_resolved = summary.last_resolved,
                    error = %e,
                    "Offset commit failed; batch will be redelivered"
                ),
            }
        }

        if let Some(last) = summary.last_resolved {
            let lag = consumer_lag(batch.high_watermark, last);
            self.observer
                .set_consumer_lag(&batch.topic, batch.partition, lag);
            summary.lag = Some(lag);
        }

        debug!(
            topic = %batch.topic,
            partition = batch.partition,
            processed = summary.processed(),
            aborted = summary.aborted,
            committed = summary.committed,
            lag = summary.lag,
            "Batch complete"
        );

        summary
    }

    /// Run the pipeline for one message and report it to the observer
    pub async fn process_message(&self, topic: &str, message: &BrokerMessage) -> CommandOutcome {
        let started = Instant::now();
        let (command_name, outcome) = self.handle_message(topic, message).await;
        let name = command_name.as_deref().unwrap_or(UNKNOWN_COMMAND);

        self.observer.record_outcome(name, outcome);
        self.observer
            .observe_duration(name, started.elapsed().as_secs_f64());
        outcome
    }

    async fn handle_message(
        &self,
        topic: &str,
        message: &BrokerMessage,
    ) -> (Option<String>, CommandOutcome) {
        let (envelope, body) = match decode_body(&message.value) {
            Ok(DecodedBody::Envelope(envelope, body)) => (envelope, body),
            Ok(DecodedBody::Unshaped(_)) => {
                debug!(
                    topic = %topic,
                    partition = message.partition,
                    offset = message.offset,
                    reason = %Ineligible::MalformedEnvelope,
                    "Skipping message"
                );
                return (None, CommandOutcome::Skipped);
            }
            Err(e) => {
                warn!(
                    topic = %topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Undecodable message body"
                );
                let payload = DeadLetterPayload::parsing_error(topic, message, &e);
                self.dead_letter.publish(message, &payload).await;
                return (None, CommandOutcome::ParseError);
            }
        };

        let metadata = match envelope.validate_for(&self.service_name) {
            Ok(metadata) => metadata,
            Err(reason) => {
                debug!(
                    topic = %topic,
                    partition = message.partition,
                    offset = message.offset,
                    reason = %reason,
                    "Skipping message"
                );
                let name = envelope
                    .metadata
                    .command_name
                    .filter(|n| !n.trim().is_empty());
                return (name, CommandOutcome::Skipped);
            }
        };
        let command_name = Some(metadata.command_name.clone());

        match self.guard.check(&metadata).await {
            GuardDecision::Proceed => {}
            GuardDecision::Duplicate => return (command_name, CommandOutcome::Duplicate),
            GuardDecision::Reject(e) => {
                let payload = DeadLetterPayload::handler_failure(
                    topic,
                    message,
                    body,
                    &metadata,
                    0,
                    ErrorInfo::from_idempotency_error(&e),
                );
                self.dead_letter.publish(message, &payload).await;
                return (command_name, CommandOutcome::Failure);
            }
        }

        let context = CommandContext::new(&metadata, topic, message.partition, message.offset);
        let result = self
            .retry
            .run(
                |_attempt| self.router.route(&envelope, &metadata, &context),
                |event| {
                    warn!(
                        command_name = %metadata.command_name,
                        tenant_id = %metadata.tenant_id,
                        correlation_id = metadata.correlation_id.as_deref(),
                        offset = message.offset,
                        attempt = event.attempt,
                        delay_ms = event.delay_ms,
                        error_kind = event.error.name(),
                        error = %event.error,
                        "Command handler failed; retrying"
                    );
                },
            )
            .await;

        match result {
            Ok((RouteOutcome::Unrouted, _)) => (command_name, CommandOutcome::Unrouted),
            Ok((RouteOutcome::Handled, attempts)) => {
                self.guard.record(&metadata).await;
                log_command_operation(
                    "handle",
                    Some(&metadata.command_name),
                    Some(&metadata.tenant_id),
                    topic,
                    message.partition,
                    message.offset,
                    CommandOutcome::Success.as_str(),
                    (attempts > 1).then_some("succeeded after retry"),
                );
                (command_name, CommandOutcome::Success)
            }
            Err(e) => {
                error!(
                    command_name = %metadata.command_name,
                    tenant_id = %metadata.tenant_id,
                    correlation_id = metadata.correlation_id.as_deref(),
                    topic = %topic,
                    partition = message.partition,
                    offset = message.offset,
                    attempts = e.attempts(),
                    error = %e,
                    "Command handler exhausted retries"
                );
                let payload = DeadLetterPayload::handler_failure(
                    topic,
                    message,
                    body,
                    &metadata,
                    e.attempts(),
                    ErrorInfo::from_retry_error(&e),
                );
                self.dead_letter.publish(message, &payload).await;
                (command_name, CommandOutcome::Failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdempotencyFailureMode;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::messaging::{Batch, InMemoryBatchControl, InMemoryBroker};
    use crate::metrics::RecordingObserver;
    use crate::registry::{CommandError, TypedCommandHandler};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl TypedCommandHandler for CountingHandler {
        type Payload = Value;

        fn parse(&self, payload: &Value) -> Result<Value, CommandError> {
            Ok(payload.clone())
        }

        async fn apply(
            &self,
            _tenant_id: &str,
            _payload: Value,
            _context: &CommandContext,
        ) -> Result<(), CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CommandError::handler("downstream unavailable"))
            } else {
                Ok(())
            }
        }
    }

    fn command(key: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "metadata": {
                "commandName": "ApplyPayment",
                "tenantId": "tenant-1",
                "idempotencyKey": key,
            },
            "payload": {"amount": 10}
        }))
        .unwrap()
    }

    async fn setup(
        fail: bool,
    ) -> (
        Arc<InMemoryBroker>,
        BatchProcessor,
        Arc<AtomicUsize>,
        Arc<RecordingObserver>,
    ) {
        let broker = InMemoryBroker::new();
        broker.create_topic("commands", 1);
        broker.create_topic("commands.dlq", 1);

        let calls = Arc::new(AtomicUsize::new(0));
        let router = CommandRouter::new();
        router
            .register_handler(
                "ApplyPayment",
                CountingHandler {
                    calls: calls.clone(),
                    fail,
                },
            )
            .await;

        let observer = Arc::new(RecordingObserver::new());
        let processor = BatchProcessor::new(
            "billing",
            router,
            DeadLetterRouter::new(broker.clone(), "commands.dlq", "billing"),
        )
        .with_retry_policy(RetryPolicy::new(2, Duration::ZERO))
        .with_idempotency(IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            IdempotencyFailureMode::FailOpen,
        ))
        .with_observer(observer.clone());

        (broker, processor, calls, observer)
    }

    fn polled(
        broker: &Arc<InMemoryBroker>,
        bodies: Vec<Vec<u8>>,
    ) -> (PolledBatch, Arc<InMemoryBatchControl>) {
        let messages = bodies
            .into_iter()
            .map(|body| {
                let offset = broker.produce("commands", 0, None, body.clone()).unwrap();
                BrokerMessage::new(0, offset, body)
            })
            .collect::<Vec<_>>();
        let high_watermark = messages.last().map_or(0, |m| m.offset + 1);
        let control = Arc::new(InMemoryBatchControl::new(broker.clone(), "billing", "commands", 0));
        (
            PolledBatch {
                batch: Batch {
                    topic: "commands".to_string(),
                    partition: 0,
                    high_watermark,
                    messages,
                },
                control: control.clone(),
            },
            control,
        )
    }

    #[tokio::test]
    async fn test_success_and_duplicate() {
        let (broker, processor, calls, observer) = setup(false).await;
        let (batch, control) = polled(&broker, vec![command("k1"), command("k1")]);

        let summary = processor.process_batch(&batch).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.count(CommandOutcome::Success), 1);
        assert_eq!(summary.count(CommandOutcome::Duplicate), 1);
        assert!(summary.committed);
        assert_eq!(summary.lag, Some(0));
        assert_eq!(control.commit_count(), 1);
        assert_eq!(control.heartbeat_count(), 2);
        assert_eq!(observer.lag("commands", 0), Some(0));
        assert_eq!(observer.durations().len(), 2);
        assert_eq!(processor.checkpoints().get("commands", 0), Some(1));
    }

    #[tokio::test]
    async fn test_unshaped_json_is_skipped() {
        let (broker, processor, calls, _) = setup(false).await;
        let (batch, _) = polled(&broker, vec![b"[1, 2, 3]".to_vec()]);

        let summary = processor.process_batch(&batch).await;

        assert_eq!(summary.outcomes, vec![(0, CommandOutcome::Skipped)]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(broker.messages("commands.dlq").is_empty());
        assert!(summary.committed);
    }

    #[tokio::test]
    async fn test_unrouted_command_is_not_retried() {
        let (broker, processor, calls, _) = setup(false).await;
        let body = serde_json::to_vec(&json!({
            "metadata": {"commandName": "Unknown", "tenantId": "t"},
            "payload": {}
        }))
        .unwrap();
        let (batch, _) = polled(&broker, vec![body]);

        let summary = processor.process_batch(&batch).await;

        assert_eq!(summary.count(CommandOutcome::Unrouted), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(broker.messages("commands.dlq").is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_handler_is_dead_lettered() {
        let (broker, processor, calls, observer) = setup(true).await;
        let (batch, _) = polled(&broker, vec![command("k9")]);

        let summary = processor.process_batch(&batch).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.count(CommandOutcome::Failure), 1);
        assert_eq!(observer.outcome_count(CommandOutcome::Failure), 1);

        let dlq = broker.messages("commands.dlq");
        assert_eq!(dlq.len(), 1);
        let body: Value = serde_json::from_slice(&dlq[0].value).unwrap();
        assert_eq!(body["metadata"]["failureReason"], "HANDLER_FAILURE");
        assert_eq!(body["metadata"]["attempts"], 3);
        assert_eq!(body["error"]["name"], "RetriesExhaustedError");
        assert_eq!(body["payload"]["payload"]["amount"], 10);
    }

    #[tokio::test]
    async fn test_stopped_control_aborts_without_commit() {
        let (broker, processor, calls, _) = setup(false).await;
        let (batch, control) = polled(&broker, vec![command("a"), command("b")]);
        control.stop();

        let summary = processor.process_batch(&batch).await;

        assert!(summary.aborted);
        assert!(!summary.committed);
        assert_eq!(summary.processed(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(control.commit_count(), 0);
        assert_eq!(control.resolved_offset(), None);
    }
}
