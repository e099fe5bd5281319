//! # Command Bus Configuration
//!
//! Typed configuration for the consumer pipeline and the reliability monitor.
//! Every field has a default; files and environment variables override them
//! through [`ConfigManager`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use command_bus::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Defaults, then config/command-bus.toml, then config/command-bus.<env>.toml,
//! // then COMMAND_BUS__* environment variables
//! let manager = ConfigManager::load()?;
//!
//! let retries = manager.config().retry.max_retries;
//! let dlq_topic = &manager.config().consumer.dead_letter_topic;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandBusConfig {
    /// Identity of this consumer; matched against `targetService` and sent as
    /// the `producer-id` header on dead-letter records
    pub service_name: String,

    pub consumer: ConsumerConfig,

    pub retry: RetryConfig,

    pub idempotency: IdempotencyConfig,

    pub outbox: OutboxConfig,

    /// Warning thresholds for the reliability monitor
    pub reliability: ReliabilityThresholds,
}

impl Default for CommandBusConfig {
    fn default() -> Self {
        Self {
            service_name: "command-service".to_string(),
            consumer: ConsumerConfig::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            outbox: OutboxConfig::default(),
            reliability: ReliabilityThresholds::default(),
        }
    }
}

/// Subscription settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub topic: String,
    pub dead_letter_topic: String,
    pub group_id: String,
    /// Pause between polls when the source has nothing to deliver
    pub poll_idle_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: "commands".to_string(),
            dead_letter_topic: "commands.dlq".to_string(),
            group_id: "command-service".to_string(),
            poll_idle_ms: 250,
        }
    }
}

/// Handler retry settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Linear backoff unit: the wait after attempt `n` is `base_delay_ms × n`
    pub base_delay_ms: u64,
    /// Explicit per-retry delays; overrides the linear backoff when non-empty
    pub delay_schedule_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            delay_schedule_ms: Vec::new(),
        }
    }
}

/// What to do when the idempotency store cannot be queried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdempotencyFailureMode {
    /// Log and invoke the handler anyway
    #[default]
    FailOpen,
    /// Dead-letter the command without invoking the handler
    FailClosed,
}

impl IdempotencyFailureMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FailOpen => "fail-open",
            Self::FailClosed => "fail-closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub failure_mode: IdempotencyFailureMode,
    /// Table used by the Postgres idempotency store
    pub table_name: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            failure_mode: IdempotencyFailureMode::FailOpen,
            table_name: "command_idempotency".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Table read by the Postgres outbox ledger
    pub table_name: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            table_name: "outbox".to_string(),
        }
    }
}

/// A signal is reported as an issue when its value exceeds the threshold
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReliabilityThresholds {
    pub pending_warning: i64,
    pub failed_warning: i64,
    pub outbox_dlq_warning: i64,
    pub backlog_age_warning_seconds: i64,
    pub consumer_lag_warning: i64,
    pub dlq_depth_warning: i64,
}

impl Default for ReliabilityThresholds {
    fn default() -> Self {
        Self {
            pending_warning: 100,
            failed_warning: 10,
            outbox_dlq_warning: 0,
            backlog_age_warning_seconds: 300,
            consumer_lag_warning: 1000,
            dlq_depth_warning: 0,
        }
    }
}

/// Table identifiers are interpolated into SQL, so only plain (optionally
/// schema-qualified) identifiers are accepted.
pub fn is_safe_table_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            !part.is_empty()
                && part.len() <= 63
                && part
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

impl CommandBusConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "service_name",
                "root",
            ));
        }
        if self.consumer.topic.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "topic", "consumer",
            ));
        }
        if self.consumer.dead_letter_topic.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "dead_letter_topic",
                "consumer",
            ));
        }
        if self.consumer.topic == self.consumer.dead_letter_topic {
            return Err(ConfigurationError::invalid_value(
                "consumer.dead_letter_topic",
                self.consumer.dead_letter_topic.clone(),
                "dead-letter topic must differ from the consumed topic",
            ));
        }
        for (field, table) in [
            ("idempotency.table_name", &self.idempotency.table_name),
            ("outbox.table_name", &self.outbox.table_name),
        ] {
            if !is_safe_table_identifier(table) {
                return Err(ConfigurationError::invalid_value(
                    field,
                    table.clone(),
                    "expected [schema.]table made of letters, digits and underscores",
                ));
            }
        }

        let thresholds = &self.reliability;
        for (field, value) in [
            ("pending_warning", thresholds.pending_warning),
            ("failed_warning", thresholds.failed_warning),
            ("outbox_dlq_warning", thresholds.outbox_dlq_warning),
            (
                "backlog_age_warning_seconds",
                thresholds.backlog_age_warning_seconds,
            ),
            ("consumer_lag_warning", thresholds.consumer_lag_warning),
            ("dlq_depth_warning", thresholds.dlq_depth_warning),
        ] {
            if value < 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("reliability.{field}"),
                    value.to_string(),
                    "thresholds cannot be negative",
                ));
            }
        }

        Ok(())
    }
}
