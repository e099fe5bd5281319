//! # OpenTelemetry Command Metrics
//!
//! Instruments:
//! - `command_bus.commands.total` counter, labels `command_name`, `outcome`
//! - `command_bus.command.duration` histogram in seconds, label `command_name`
//! - `command_bus.consumer.lag` gauge, labels `topic`, `partition`
//!
//! Instruments are built from the global meter provider, so they record into
//! whatever exporter the host process installed (or nowhere, if none).

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use super::{CommandObserver, CommandOutcome};

/// [`CommandObserver`] backed by OpenTelemetry instruments
#[derive(Debug, Clone)]
pub struct OpenTelemetryObserver {
    commands_total: Counter<u64>,
    command_duration: Histogram<f64>,
    consumer_lag: Gauge<i64>,
}

impl Default for OpenTelemetryObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenTelemetryObserver {
    /// Build instruments from the global meter provider
    pub fn new() -> Self {
        Self::with_meter(&opentelemetry::global::meter("command-bus"))
    }

    pub fn with_meter(meter: &Meter) -> Self {
        Self {
            commands_total: meter
                .u64_counter("command_bus.commands.total")
                .with_description("Commands consumed, labelled by terminal outcome")
                .build(),
            command_duration: meter
                .f64_histogram("command_bus.command.duration")
                .with_description("Handler execution time including retries")
                .with_unit("s")
                .build(),
            consumer_lag: meter
                .i64_gauge("command_bus.consumer.lag")
                .with_description("Messages between the last processed offset and high watermark")
                .build(),
        }
    }
}

impl CommandObserver for OpenTelemetryObserver {
    fn record_outcome(&self, command_name: &str, outcome: CommandOutcome) {
        self.commands_total.add(
            1,
            &[
                KeyValue::new("command_name", command_name.to_string()),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
    }

    fn observe_duration(&self, command_name: &str, seconds: f64) {
        self.command_duration.record(
            seconds,
            &[KeyValue::new("command_name", command_name.to_string())],
        );
    }

    fn set_consumer_lag(&self, topic: &str, partition: i32, lag: i64) {
        self.consumer_lag.record(
            lag,
            &[
                KeyValue::new("topic", topic.to_string()),
                KeyValue::new("partition", i64::from(partition)),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_without_installed_provider() {
        // The global provider defaults to a no-op; recording must not panic.
        let observer = OpenTelemetryObserver::new();
        observer.record_outcome("reservation.create", CommandOutcome::Success);
        observer.observe_duration("reservation.create", 0.25);
        observer.set_consumer_lag("commands", 0, 12);
    }
}
