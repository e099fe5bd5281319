//! # Dead-Letter Router
//!
//! Builds a [`DeadLetterPayload`] for a message that failed terminally and
//! publishes it to the dead-letter topic. Publishing never fails the caller:
//! errors are logged as critical and reported back as
//! [`DeadLetterOutcome::PublishFailed`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::idempotency::IdempotencyError;
use crate::messaging::{
    BrokerMessage, MessageProducer, MessagingError, Offset, ProducerRecord, ValidatedMetadata,
    PRODUCER_ID_HEADER,
};
use crate::registry::CommandError;
use crate::resilience::RetryError;

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// The body could not be decoded
    ParsingError,
    /// Handler exhausted its retries, or the idempotency check failed closed
    HandlerFailure,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParsingError => "PARSING_ERROR",
            Self::HandlerFailure => "HANDLER_FAILURE",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized error description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn from_decode_error(error: &MessagingError) -> Self {
        Self::new("SyntaxError", error.to_string())
    }

    pub fn from_retry_error(error: &RetryError<CommandError>) -> Self {
        Self::new(RetryError::<CommandError>::NAME, error.to_string())
    }

    pub fn from_idempotency_error(error: &IdempotencyError) -> Self {
        Self::new("IdempotencyCheckError", error.to_string())
    }
}

/// Broker coordinates and command identity of the failed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMetadata {
    pub failure_reason: FailureReason,
    pub attempts: u32,
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service: Option<String>,
}

/// Record written to the dead-letter topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterPayload {
    pub metadata: DeadLetterMetadata,
    pub error: ErrorInfo,
    /// The original envelope when the body was valid JSON
    pub payload: Option<Value>,
    /// The original body, decoded as lossy UTF-8
    pub raw: String,
    pub emitted_at: DateTime<Utc>,
}

impl DeadLetterPayload {
    /// Payload for a message that could not be decoded
    pub fn parsing_error(topic: &str, message: &BrokerMessage, error: &MessagingError) -> Self {
        Self {
            metadata: DeadLetterMetadata {
                failure_reason: FailureReason::ParsingError,
                attempts: 1,
                topic: topic.to_string(),
                partition: message.partition,
                offset: message.offset,
                command_id: None,
                command_name: None,
                tenant_id: None,
                request_id: None,
                target_service: None,
            },
            error: ErrorInfo::from_decode_error(error),
            payload: None,
            raw: String::from_utf8_lossy(&message.value).into_owned(),
            emitted_at: Utc::now(),
        }
    }

    /// Payload for a decoded command that failed terminally
    pub fn handler_failure(
        topic: &str,
        message: &BrokerMessage,
        envelope: Value,
        metadata: &ValidatedMetadata,
        attempts: u32,
        error: ErrorInfo,
    ) -> Self {
        Self {
            metadata: DeadLetterMetadata {
                failure_reason: FailureReason::HandlerFailure,
                attempts,
                topic: topic.to_string(),
                partition: message.partition,
                offset: message.offset,
                command_id: metadata.command_id.clone(),
                command_name: Some(metadata.command_name.clone()),
                tenant_id: Some(metadata.tenant_id.clone()),
                request_id: metadata.request_id.clone(),
                target_service: metadata.target_service.clone(),
            },
            error,
            payload: Some(envelope),
            raw: String::from_utf8_lossy(&message.value).into_owned(),
            emitted_at: Utc::now(),
        }
    }
}

/// Result of a dead-letter publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    Published,
    /// The record could not be published and may be lost
    PublishFailed,
}

/// Publishes dead-letter records for one service
#[derive(Clone)]
pub struct DeadLetterRouter {
    producer: Arc<dyn MessageProducer>,
    topic: String,
    service_name: String,
}

impl std::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("topic", &self.topic)
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

impl DeadLetterRouter {
    pub fn new(
        producer: Arc<dyn MessageProducer>,
        topic: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            service_name: service_name.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Key for the dead-letter record: the original key, else `offset-<n>`
    pub fn record_key(message: &BrokerMessage) -> String {
        match message.key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => format!("offset-{}", message.offset),
        }
    }

    pub async fn publish(
        &self,
        message: &BrokerMessage,
        payload: &DeadLetterPayload,
    ) -> DeadLetterOutcome {
        let value = match serde_json::to_vec(payload) {
            Ok(value) => value,
            Err(e) => {
                self.log_lost(payload, &MessagingError::from(e));
                return DeadLetterOutcome::PublishFailed;
            }
        };

        let record = ProducerRecord {
            key: Self::record_key(message),
            value,
            headers: HashMap::from([(
                PRODUCER_ID_HEADER.to_string(),
                self.service_name.clone(),
            )]),
        };

        match self.producer.send(&self.topic, record).await {
            Ok(()) => {
                info!(
                    dead_letter_topic = %self.topic,
                    topic = %payload.metadata.topic,
                    partition = payload.metadata.partition,
                    offset = payload.metadata.offset,
                    failure_reason = %payload.metadata.failure_reason,
                    attempts = payload.metadata.attempts,
                    command_name = payload.metadata.command_name.as_deref().unwrap_or("unknown"),
                    "☠️ Message dead-lettered"
                );
                DeadLetterOutcome::Published
            }
            Err(e) => {
                self.log_lost(payload, &e);
                DeadLetterOutcome::PublishFailed
            }
        }
    }

    fn log_lost(&self, payload: &DeadLetterPayload, err: &MessagingError) {
        error!(
            severity = "critical",
            dead_letter_topic = %self.topic,
            topic = %payload.metadata.topic,
            partition = payload.metadata.partition,
            offset = payload.metadata.offset,
            failure_reason = %payload.metadata.failure_reason,
            error = %err,
            "Failed to publish to dead-letter topic; message may be lost"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryBroker;
    use serde_json::json;

    fn router(broker: &Arc<InMemoryBroker>) -> DeadLetterRouter {
        broker.create_topic("commands.dlq", 1);
        DeadLetterRouter::new(broker.clone(), "commands.dlq", "billing-service")
    }

    #[tokio::test]
    async fn test_parsing_error_record() {
        let broker = InMemoryBroker::new();
        let router = router(&broker);
        let message = BrokerMessage::new(2, 17, "{not json");
        let error = MessagingError::message_deserialization("expected value at line 1");

        let payload = DeadLetterPayload::parsing_error("commands", &message, &error);
        assert_eq!(router.publish(&message, &payload).await, DeadLetterOutcome::Published);

        let published = broker.messages("commands.dlq");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key.as_deref(), Some("offset-17"));
        assert_eq!(
            published[0].headers.get("producer-id").map(String::as_str),
            Some("billing-service")
        );

        let body: Value = serde_json::from_slice(&published[0].value).unwrap();
        assert_eq!(body["metadata"]["failureReason"], "PARSING_ERROR");
        assert_eq!(body["metadata"]["attempts"], 1);
        assert_eq!(body["metadata"]["partition"], 2);
        assert_eq!(body["raw"], "{not json");
        assert!(body["payload"].is_null());
        assert!(body.get("emittedAt").is_some());
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_original_key() {
        let broker = InMemoryBroker::new();
        let router = router(&broker);
        let message = BrokerMessage::new(0, 3, "{}").with_key("order-42");
        let metadata = ValidatedMetadata {
            command_name: "ApplyPayment".to_string(),
            tenant_id: "t1".to_string(),
            command_id: Some("cmd-1".to_string()),
            idempotency_key: None,
            correlation_id: None,
            request_id: Some("req-1".to_string()),
            target_service: None,
            initiated_by: None,
        };
        let payload = DeadLetterPayload::handler_failure(
            "commands",
            &message,
            json!({"metadata": {}, "payload": {}}),
            &metadata,
            4,
            ErrorInfo::new("RetriesExhaustedError", "boom"),
        );

        router.publish(&message, &payload).await;

        let published = broker.messages("commands.dlq");
        assert_eq!(published[0].key.as_deref(), Some("order-42"));
        let decoded: DeadLetterPayload = serde_json::from_slice(&published[0].value).unwrap();
        assert_eq!(decoded.metadata.failure_reason, FailureReason::HandlerFailure);
        assert_eq!(decoded.metadata.attempts, 4);
        assert_eq!(decoded.metadata.command_id.as_deref(), Some("cmd-1"));
        assert_eq!(decoded.error.name, "RetriesExhaustedError");
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let broker = InMemoryBroker::new();
        let router = router(&broker);
        broker.set_fail_sends(true);
        let message = BrokerMessage::new(0, 0, vec![0xff_u8, 0xfe]);
        let payload = DeadLetterPayload::parsing_error(
            "commands",
            &message,
            &MessagingError::message_deserialization("invalid utf-8"),
        );

        assert_eq!(
            router.publish(&message, &payload).await,
            DeadLetterOutcome::PublishFailed
        );
        assert!(broker.messages("commands.dlq").is_empty());
        assert!(payload.raw.contains('\u{FFFD}'));
    }
}
