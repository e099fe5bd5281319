//! # Structured Logging Module
//!
//! Environment-aware console logging for consumer processes. Output goes to
//! stdout; set `COMMAND_BUS_LOG_FORMAT=json` for one JSON object per event.
//! `RUST_LOG` overrides the per-environment default level.

use std::io::IsTerminal;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ConfigManager;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
/// Safe to call more than once; an already installed global subscriber is kept.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let log_level = get_log_level(&environment);
        let json = use_json_format();

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level));

        let layer = if json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(std::io::stdout().is_terminal())
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized, keeping the existing one"
            );
        }

        tracing::info!(
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

fn use_json_format() -> bool {
    std::env::var("COMMAND_BUS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log structured data for a command moving through the pipeline
#[allow(clippy::too_many_arguments)]
pub fn log_command_operation(
    operation: &str,
    command_name: Option<&str>,
    tenant_id: Option<&str>,
    topic: &str,
    partition: i32,
    offset: i64,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        command_name = command_name,
        tenant_id = tenant_id,
        topic = %topic,
        partition = partition,
        offset = offset,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📨 COMMAND_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "warn");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_level_follows_config_environment() {
        let environment = ConfigManager::detect_environment();
        assert!(["debug", "info", "warn"].contains(&get_log_level(&environment)));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_command_operation(
            "consume",
            Some("ApplyPayment"),
            None,
            "commands",
            0,
            1,
            "success",
            None,
        );
    }
}
