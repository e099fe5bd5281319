//! # Command Metrics
//!
//! Observer interface the consumer pipeline reports into. The pipeline always
//! holds an observer and calls it unconditionally; [`NoopObserver`] is the
//! default when no metrics backend is wired up.
//!
//! - [`OpenTelemetryObserver`] records into OpenTelemetry instruments
//! - [`RecordingObserver`] keeps every call in memory for assertions in tests

pub mod otel;
pub mod recording;

use serde::{Deserialize, Serialize};

pub use otel::OpenTelemetryObserver;
pub use recording::RecordingObserver;

/// Terminal outcome of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Handler completed
    Success,
    /// Already applied; handler not invoked
    Duplicate,
    /// Body could not be decoded; dead-lettered
    ParseError,
    /// Not addressed to this consumer or missing required metadata
    Skipped,
    /// No handler registered for the command name
    Unrouted,
    /// Dead-lettered after exhausted retries or a fail-closed idempotency check
    Failure,
}

impl CommandOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Duplicate => "duplicate",
            Self::ParseError => "parse_error",
            Self::Skipped => "skipped",
            Self::Unrouted => "unrouted",
            Self::Failure => "failure",
        }
    }
}

impl std::fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command name used for outcomes that happen before a name is known
pub const UNKNOWN_COMMAND: &str = "unknown";

/// Metrics sink for the command pipeline
pub trait CommandObserver: Send + Sync + 'static {
    fn record_outcome(&self, command_name: &str, outcome: CommandOutcome);

    fn observe_duration(&self, command_name: &str, seconds: f64);

    fn set_consumer_lag(&self, topic: &str, partition: i32, lag: i64);
}

/// Observer that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CommandObserver for NoopObserver {
    fn record_outcome(&self, _command_name: &str, _outcome: CommandOutcome) {}

    fn observe_duration(&self, _command_name: &str, _seconds: f64) {}

    fn set_consumer_lag(&self, _topic: &str, _partition: i32, _lag: i64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(CommandOutcome::ParseError.as_str(), "parse_error");
        assert_eq!(CommandOutcome::Duplicate.to_string(), "duplicate");
        assert_eq!(
            serde_json::to_value(CommandOutcome::Unrouted).unwrap(),
            serde_json::json!("unrouted")
        );
    }
}
