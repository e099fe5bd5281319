//! # Reliability Monitor
//!
//! Computes a [`ReliabilitySnapshot`] on demand from three independent
//! sources: the outbox ledger, the consumer's local checkpoints and the
//! broker's administrative offset API. A failing source produces a partial
//! snapshot with its error recorded; the call itself never fails.
//!
//! The monitor only reads. Each call opens and closes its own admin session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use super::outbox::{OutboxLedger, OutboxStatusSummary};
use crate::config::{CommandBusConfig, ReliabilityThresholds};
use crate::consumer::ConsumerCheckpoints;
use crate::messaging::{consumer_lag, AdminSession, BrokerAdmin, Offset, PartitionOffsets};
use crate::metrics::{CommandObserver, NoopObserver};

/// Largest integer a JSON consumer using IEEE doubles can represent exactly
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

fn clamp_for_display(value: i64) -> i64 {
    value.clamp(-MAX_SAFE_INTEGER, MAX_SAFE_INTEGER)
}

fn serialize_clamped<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(clamp_for_display(*value))
}

fn serialize_clamped_opt<S: Serializer>(
    value: &Option<i64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_some(&clamp_for_display(*v)),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxHealth {
    #[serde(serialize_with = "serialize_clamped")]
    pub pending: i64,
    #[serde(serialize_with = "serialize_clamped")]
    pub in_progress: i64,
    #[serde(serialize_with = "serialize_clamped")]
    pub failed: i64,
    #[serde(serialize_with = "serialize_clamped")]
    pub dlq: i64,
    pub oldest_available_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_clamped_opt")]
    pub backlog_age_seconds: Option<i64>,
    pub error: Option<String>,
}

impl OutboxHealth {
    fn from_summary(summary: OutboxStatusSummary, now: DateTime<Utc>) -> Self {
        Self {
            pending: summary.pending,
            in_progress: summary.in_progress,
            failed: summary.failed,
            dlq: summary.dlq,
            backlog_age_seconds: summary.backlog_age_seconds(now),
            oldest_available_at: summary.oldest_available_at,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionLag {
    pub partition: i32,
    /// Last offset processed by this consumer, if any
    #[serde(serialize_with = "serialize_clamped_opt")]
    pub offset: Option<Offset>,
    #[serde(serialize_with = "serialize_clamped")]
    pub high_watermark: Offset,
    #[serde(serialize_with = "serialize_clamped")]
    pub lag: Offset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerHealth {
    pub topic: String,
    pub partitions: Vec<PartitionLag>,
    #[serde(serialize_with = "serialize_clamped")]
    pub max_lag: Offset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterHealth {
    pub topic: String,
    #[serde(serialize_with = "serialize_clamped_opt")]
    pub depth: Option<Offset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHealth {
    pub reachable: bool,
    pub error: Option<String>,
}

/// Point-in-time reliability view. Holds nothing across calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilitySnapshot {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    /// `None` when no outbox ledger is configured
    pub outbox: Option<OutboxHealth>,
    pub consumer: ConsumerHealth,
    pub dead_letter: DeadLetterHealth,
    pub broker: BrokerHealth,
    pub generated_at: DateTime<Utc>,
}

impl ReliabilitySnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

pub struct ReliabilityMonitor {
    admin: Arc<dyn BrokerAdmin>,
    checkpoints: ConsumerCheckpoints,
    ledger: Option<Arc<dyn OutboxLedger>>,
    topic: String,
    dead_letter_topic: String,
    thresholds: ReliabilityThresholds,
    observer: Arc<dyn CommandObserver>,
}

impl std::fmt::Debug for ReliabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliabilityMonitor")
            .field("topic", &self.topic)
            .field("dead_letter_topic", &self.dead_letter_topic)
            .field("has_ledger", &self.ledger.is_some())
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl ReliabilityMonitor {
    pub fn new(
        admin: Arc<dyn BrokerAdmin>,
        checkpoints: ConsumerCheckpoints,
        topic: impl Into<String>,
        dead_letter_topic: impl Into<String>,
    ) -> Self {
        Self {
            admin,
            checkpoints,
            ledger: None,
            topic: topic.into(),
            dead_letter_topic: dead_letter_topic.into(),
            thresholds: ReliabilityThresholds::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn from_config(
        config: &CommandBusConfig,
        admin: Arc<dyn BrokerAdmin>,
        checkpoints: ConsumerCheckpoints,
    ) -> Self {
        Self::new(
            admin,
            checkpoints,
            config.consumer.topic.clone(),
            config.consumer.dead_letter_topic.clone(),
        )
        .with_thresholds(config.reliability.clone())
    }

    pub fn with_outbox_ledger(mut self, ledger: Arc<dyn OutboxLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_thresholds(mut self, thresholds: ReliabilityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommandObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub async fn snapshot(&self) -> ReliabilitySnapshot {
        let now = Utc::now();
        let mut issues = Vec::new();

        let outbox = match &self.ledger {
            Some(ledger) => Some(self.outbox_health(ledger.as_ref(), now, &mut issues).await),
            None => None,
        };

        let mut consumer = ConsumerHealth {
            topic: self.topic.clone(),
            ..ConsumerHealth::default()
        };
        let mut dead_letter = DeadLetterHealth {
            topic: self.dead_letter_topic.clone(),
            depth: None,
        };
        let mut broker = BrokerHealth {
            reachable: true,
            error: None,
        };

        match self.admin.connect().await {
            Ok(session) => {
                self.read_offsets(
                    session.as_ref(),
                    &mut consumer,
                    &mut dead_letter,
                    &mut broker,
                )
                .await;
                if let Err(e) = session.disconnect().await {
                    debug!(error = %e, "Admin session disconnect failed");
                }
            }
            Err(e) => {
                broker.reachable = false;
                broker.error = Some(e.to_string());
            }
        }

        if !broker.reachable {
            issues.push(format!(
                "Broker unreachable: {}",
                broker.error.as_deref().unwrap_or("unknown error")
            ));
        } else if let Some(error) = &broker.error {
            issues.push(format!("Broker offsets unavailable: {error}"));
        }

        self.check_consumer(&consumer, &mut issues);
        if let Some(depth) = dead_letter.depth {
            if depth > self.thresholds.dlq_depth_warning {
                issues.push(format!(
                    "Dead-letter topic {} holds {depth} messages (threshold {})",
                    dead_letter.topic, self.thresholds.dlq_depth_warning
                ));
            }
        }

        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        if status == HealthStatus::Degraded {
            warn!(issues = ?issues, "Reliability snapshot degraded");
        }

        ReliabilitySnapshot {
            status,
            issues,
            outbox,
            consumer,
            dead_letter,
            broker,
            generated_at: now,
        }
    }

    async fn outbox_health(
        &self,
        ledger: &dyn OutboxLedger,
        now: DateTime<Utc>,
        issues: &mut Vec<String>,
    ) -> OutboxHealth {
        let health = match ledger.status_summary().await {
            Ok(summary) => OutboxHealth::from_summary(summary, now),
            Err(e) => {
                issues.push(format!("Outbox ledger unavailable: {e}"));
                return OutboxHealth {
                    error: Some(e.to_string()),
                    ..OutboxHealth::default()
                };
            }
        };

        let t = &self.thresholds;
        if health.pending > t.pending_warning {
            issues.push(format!(
                "Outbox has {} PENDING rows (threshold {})",
                health.pending, t.pending_warning
            ));
        }
        if health.failed > t.failed_warning {
            issues.push(format!(
                "Outbox has {} FAILED rows (threshold {})",
                health.failed, t.failed_warning
            ));
        }
        if health.dlq > t.outbox_dlq_warning {
            issues.push(format!(
                "Outbox has {} DLQ rows (threshold {})",
                health.dlq, t.outbox_dlq_warning
            ));
        }
        if let Some(age) = health.backlog_age_seconds {
            if age > t.backlog_age_warning_seconds {
                issues.push(format!(
                    "Oldest outbox backlog row has waited {age}s (threshold {}s)",
                    t.backlog_age_warning_seconds
                ));
            }
        }
        health
    }

    async fn read_offsets(
        &self,
        session: &dyn AdminSession,
        consumer: &mut ConsumerHealth,
        dead_letter: &mut DeadLetterHealth,
        broker: &mut BrokerHealth,
    ) {
        let (primary, dead) = futures::join!(
            session.fetch_topic_offsets(&self.topic),
            session.fetch_topic_offsets(&self.dead_letter_topic)
        );

        match primary {
            Ok(offsets) => {
                let processed = self.checkpoints.for_topic(&self.topic);
                consumer.partitions = offsets
                    .iter()
                    .map(|p| partition_lag(p, processed.get(&p.partition).copied()))
                    .collect();
                consumer.max_lag = consumer.partitions.iter().map(|p| p.lag).max().unwrap_or(0);

                for partition in &consumer.partitions {
                    self.observer
                        .set_consumer_lag(&self.topic, partition.partition, partition.lag);
                }
            }
            Err(e) => {
                broker.reachable = !e.is_unreachable();
                broker.error = Some(e.to_string());
            }
        }

        match dead {
            Ok(offsets) => {
                dead_letter.depth = Some(offsets.iter().map(PartitionOffsets::depth).sum());
            }
            Err(e) if broker.error.is_none() => {
                broker.reachable = !e.is_unreachable();
                broker.error = Some(e.to_string());
            }
            Err(e) => debug!(error = %e, "Dead-letter offsets unavailable"),
        }
    }

    fn check_consumer(&self, consumer: &ConsumerHealth, issues: &mut Vec<String>) {
        let threshold = self.thresholds.consumer_lag_warning;
        if consumer.max_lag <= threshold {
            return;
        }
        if let Some(worst) = consumer.partitions.iter().max_by_key(|p| p.lag) {
            issues.push(format!(
                "Consumer lag {} on {}[{}] exceeds threshold {threshold}",
                worst.lag, consumer.topic, worst.partition
            ));
        }
    }
}

/// Lag for one partition. Without a local checkpoint every retained record
/// counts as unprocessed.
fn partition_lag(offsets: &PartitionOffsets, last_processed: Option<Offset>) -> PartitionLag {
    let lag = match last_processed {
        Some(last) => consumer_lag(offsets.high, last),
        None => offsets.depth(),
    };
    PartitionLag {
        partition: offsets.partition,
        offset: last_processed,
        high_watermark: offsets.high,
        lag,
    }
}
