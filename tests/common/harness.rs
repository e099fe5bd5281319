//! In-memory pipeline wired the way a service would wire it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use command_bus::config::IdempotencyFailureMode;
use command_bus::consumer::BatchProcessor;
use command_bus::dead_letter::DeadLetterRouter;
use command_bus::idempotency::{IdempotencyGuard, InMemoryIdempotencyStore};
use command_bus::messaging::{BatchSource, InMemoryBatchSource, InMemoryBroker, PolledBatch};
use command_bus::metrics::RecordingObserver;
use command_bus::registry::{
    parse_json_payload, CommandContext, CommandError, CommandRouter, TypedCommandHandler,
};
use command_bus::resilience::RetryPolicy;

pub const TOPIC: &str = "commands";
pub const DLQ_TOPIC: &str = "commands.dlq";
pub const GROUP: &str = "billing";
pub const SERVICE: &str = "billing-service";
pub const COMMAND: &str = "ApplyPayment";

#[derive(Debug, Deserialize)]
pub struct ApplyPayment {
    pub amount: i64,
}

/// Counts invocations and fails the first `fail_first` of them
pub struct PaymentHandler {
    calls: Arc<AtomicUsize>,
    fail_first: usize,
}

#[async_trait]
impl TypedCommandHandler for PaymentHandler {
    type Payload = ApplyPayment;

    fn parse(&self, payload: &Value) -> Result<ApplyPayment, CommandError> {
        parse_json_payload(COMMAND, payload)
    }

    async fn apply(
        &self,
        _tenant_id: &str,
        _payload: ApplyPayment,
        _context: &CommandContext,
    ) -> Result<(), CommandError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(CommandError::handler(format!("ledger unavailable (call {call})")));
        }
        Ok(())
    }
}

pub struct HarnessOptions {
    pub max_retries: u32,
    pub failure_mode: IdempotencyFailureMode,
    pub fail_first: usize,
    pub partitions: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            failure_mode: IdempotencyFailureMode::FailOpen,
            fail_first: 0,
            partitions: 1,
        }
    }
}

pub struct Harness {
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<InMemoryIdempotencyStore>,
    pub observer: Arc<RecordingObserver>,
    pub calls: Arc<AtomicUsize>,
    pub processor: BatchProcessor,
    pub source: Arc<InMemoryBatchSource>,
}

impl Harness {
    pub async fn new(options: HarnessOptions) -> Self {
        let broker = InMemoryBroker::new();
        broker.create_topic(TOPIC, options.partitions);
        broker.create_topic(DLQ_TOPIC, 1);

        let calls = Arc::new(AtomicUsize::new(0));
        let router = CommandRouter::new();
        router
            .register_handler(
                COMMAND,
                PaymentHandler {
                    calls: calls.clone(),
                    fail_first: options.fail_first,
                },
            )
            .await;

        let store = Arc::new(InMemoryIdempotencyStore::new());
        let observer = Arc::new(RecordingObserver::new());
        let processor = BatchProcessor::new(
            SERVICE,
            router,
            DeadLetterRouter::new(broker.clone(), DLQ_TOPIC, SERVICE),
        )
        .with_retry_policy(RetryPolicy::new(options.max_retries, Duration::from_millis(1)))
        .with_idempotency(IdempotencyGuard::new(store.clone(), options.failure_mode))
        .with_observer(observer.clone());

        let source = Arc::new(InMemoryBatchSource::new(broker.clone(), GROUP, TOPIC));

        Self {
            broker,
            store,
            observer,
            calls,
            processor,
            source,
        }
    }

    pub fn produce(&self, body: impl Into<Vec<u8>>) -> i64 {
        self.broker.produce(TOPIC, 0, None, body).unwrap()
    }

    pub async fn next_batch(&self) -> PolledBatch {
        self.source
            .next_batch()
            .await
            .unwrap()
            .expect("a batch should be available")
    }

    pub fn handler_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn committed_offset(&self) -> Option<i64> {
        self.broker.committed_offset(GROUP, TOPIC, 0)
    }

    pub fn dead_letters(&self) -> Vec<Value> {
        self.broker
            .messages(DLQ_TOPIC)
            .iter()
            .map(|m| serde_json::from_slice(&m.value).unwrap())
            .collect()
    }
}

/// A well-formed ApplyPayment command body
pub fn payment_command(tenant_id: &str, idempotency_key: Option<&str>) -> Vec<u8> {
    let mut metadata = json!({
        "commandId": format!("cmd-{}", uuid::Uuid::new_v4()),
        "commandName": COMMAND,
        "tenantId": tenant_id,
        "correlationId": "corr-1",
    });
    if let Some(key) = idempotency_key {
        metadata["idempotencyKey"] = json!(key);
    }
    serde_json::to_vec(&json!({"metadata": metadata, "payload": {"amount": 250}})).unwrap()
}
