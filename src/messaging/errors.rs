//! # Messaging Error Types
//!
//! Structured error handling for broker, producer and envelope decoding
//! operations using thiserror instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Messaging error types
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Broker unreachable: {message}")]
    BrokerUnreachable { message: String },

    #[error("Topic operation failed: {topic}: {operation}: {message}")]
    TopicOperation {
        topic: String,
        operation: String,
        message: String,
    },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },
}

impl MessagingError {
    /// Create a broker unreachable error
    pub fn broker_unreachable(message: impl Into<String>) -> Self {
        Self::BrokerUnreachable {
            message: message.into(),
        }
    }

    /// Create a topic operation error
    pub fn topic_operation(
        topic: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TopicOperation {
            topic: topic.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a topic not found error
    pub fn topic_not_found(topic: impl Into<String>) -> Self {
        Self::TopicNotFound {
            topic: topic.into(),
        }
    }

    /// Create a message serialization error
    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    /// Create a message deserialization error
    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Whether the error means the broker could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::BrokerUnreachable { .. })
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() || err.is_data() {
            MessagingError::message_deserialization(err.to_string())
        } else {
            MessagingError::message_serialization(err.to_string())
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
