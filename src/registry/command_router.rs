//! # Command Router
//!
//! Registration map from command name to handler. Handlers are written against
//! [`TypedCommandHandler`], which splits a command into a payload parse step and
//! an apply step; the router stores them type-erased behind [`CommandHandler`].
//!
//! Command names with no registered handler are a deliberate no-op: several
//! services share a topic and each registers only the commands it owns.
//!
//! ```rust
//! use async_trait::async_trait;
//! use command_bus::registry::{
//!     parse_json_payload, CommandContext, CommandError, CommandRouter, TypedCommandHandler,
//! };
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct CreateReservation {
//!     room_id: u32,
//! }
//!
//! struct CreateReservationHandler;
//!
//! #[async_trait]
//! impl TypedCommandHandler for CreateReservationHandler {
//!     type Payload = CreateReservation;
//!
//!     fn parse(&self, payload: &serde_json::Value) -> Result<Self::Payload, CommandError> {
//!         parse_json_payload("reservation.create", payload)
//!     }
//!
//!     async fn apply(
//!         &self,
//!         _tenant_id: &str,
//!         payload: Self::Payload,
//!         _context: &CommandContext,
//!     ) -> Result<(), CommandError> {
//!         assert!(payload.room_id > 0);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() {
//! let router = CommandRouter::new();
//! router
//!     .register_handler("reservation.create", CreateReservationHandler)
//!     .await;
//! assert!(router.is_registered("reservation.create").await);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::messaging::{CommandEnvelope, InitiatedBy, Offset, ValidatedMetadata};

/// Errors raised by command handlers
#[derive(Debug, Error)]
pub enum CommandError {
    /// The payload does not match the handler's schema
    #[error("Invalid payload for {command_name}: {message}")]
    InvalidPayload {
        command_name: String,
        message: String,
    },

    /// Business or infrastructure failure inside the handler
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl CommandError {
    pub fn invalid_payload(command_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            command_name: command_name.into(),
            message: message.into(),
        }
    }

    /// Create a handler error from a message
    pub fn handler<M>(message: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self::Handler(anyhow::Error::msg(message))
    }

    /// Stable error name used in dead-letter payloads
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidPayload { .. } => "ValidationError",
            Self::Handler(_) => "HandlerError",
        }
    }
}

/// Deserialize a JSON payload into a handler's payload type
pub fn parse_json_payload<T: DeserializeOwned>(
    command_name: &str,
    payload: &Value,
) -> Result<T, CommandError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| CommandError::invalid_payload(command_name, e.to_string()))
}

/// Execution context passed to handlers alongside the parsed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub command_name: String,
    pub command_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
    pub initiated_by: Option<InitiatedBy>,
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
}

impl CommandContext {
    pub fn new(metadata: &ValidatedMetadata, topic: &str, partition: i32, offset: Offset) -> Self {
        Self {
            command_name: metadata.command_name.clone(),
            command_id: metadata.command_id.clone(),
            idempotency_key: metadata.idempotency_key.clone(),
            correlation_id: metadata.correlation_id.clone(),
            request_id: metadata.request_id.clone(),
            initiated_by: metadata.initiated_by.clone(),
            topic: topic.to_string(),
            partition,
            offset,
        }
    }
}

/// A handler for one command name with a typed payload
#[async_trait]
pub trait TypedCommandHandler: Send + Sync + 'static {
    type Payload: Send + 'static;

    /// Validate and convert the raw payload
    fn parse(&self, payload: &Value) -> Result<Self::Payload, CommandError>;

    /// Apply the command's side effects for `tenant_id`
    async fn apply(
        &self,
        tenant_id: &str,
        payload: Self::Payload,
        context: &CommandContext,
    ) -> Result<(), CommandError>;
}

/// Type-erased handler stored in the router
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        envelope: &CommandEnvelope,
        metadata: &ValidatedMetadata,
        context: &CommandContext,
    ) -> Result<(), CommandError>;
}

struct TypedHandlerAdapter<H>(H);

#[async_trait]
impl<H: TypedCommandHandler> CommandHandler for TypedHandlerAdapter<H> {
    async fn handle(
        &self,
        envelope: &CommandEnvelope,
        metadata: &ValidatedMetadata,
        context: &CommandContext,
    ) -> Result<(), CommandError> {
        let payload = self.0.parse(&envelope.payload)?;
        self.0.apply(&metadata.tenant_id, payload, context).await
    }
}

/// Outcome of routing one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Handled,
    /// No handler registered; intentionally ignored
    Unrouted,
}

/// Registration map from command name to handler
#[derive(Clone, Default)]
pub struct CommandRouter {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn CommandHandler>>>>,
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter").finish_non_exhaustive()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `command_name`, replacing any existing one
    pub async fn register_handler<H: TypedCommandHandler>(&self, command_name: &str, handler: H) {
        self.register_erased(command_name, Arc::new(TypedHandlerAdapter(handler)))
            .await;
    }

    /// Register an already type-erased handler
    pub async fn register_erased(&self, command_name: &str, handler: Arc<dyn CommandHandler>) {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(command_name) {
            warn!(command_name = %command_name, "Replacing existing command handler");
        }
        handlers.insert(command_name.to_string(), handler);
        info!(command_name = %command_name, "Registered command handler");
    }

    pub async fn unregister_handler(&self, command_name: &str) -> bool {
        self.handlers.write().await.remove(command_name).is_some()
    }

    pub async fn is_registered(&self, command_name: &str) -> bool {
        self.handlers.read().await.contains_key(command_name)
    }

    pub async fn registered_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up the handler for a command name
    pub async fn resolve(&self, command_name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.read().await.get(command_name).cloned()
    }

    /// Route a validated command to its handler. Handler errors propagate.
    pub async fn route(
        &self,
        envelope: &CommandEnvelope,
        metadata: &ValidatedMetadata,
        context: &CommandContext,
    ) -> Result<RouteOutcome, CommandError> {
        let Some(handler) = self.resolve(&metadata.command_name).await else {
            debug!(
                command_name = %metadata.command_name,
                tenant_id = %metadata.tenant_id,
                "No handler registered; skipping command"
            );
            return Ok(RouteOutcome::Unrouted);
        };

        handler.handle(envelope, metadata, context).await?;
        Ok(RouteOutcome::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct ApplyPayment {
        amount_cents: u64,
    }

    struct ApplyPaymentHandler {
        applied: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TypedCommandHandler for ApplyPaymentHandler {
        type Payload = ApplyPayment;

        fn parse(&self, payload: &Value) -> Result<Self::Payload, CommandError> {
            parse_json_payload("payment.apply", payload)
        }

        async fn apply(
            &self,
            tenant_id: &str,
            payload: Self::Payload,
            context: &CommandContext,
        ) -> Result<(), CommandError> {
            assert_eq!(tenant_id, "tenant-a");
            assert_eq!(context.command_name, "payment.apply");
            if payload.amount_cents == 0 {
                return Err(CommandError::handler("amount must be positive"));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn command(payload: Value) -> (CommandEnvelope, ValidatedMetadata, CommandContext) {
        let envelope: CommandEnvelope = serde_json::from_value(json!({
            "metadata": {
                "commandName": "payment.apply",
                "tenantId": "tenant-a",
                "commandId": "c-1"
            },
            "payload": payload
        }))
        .unwrap();
        let metadata = envelope.validate_for("billing").unwrap();
        let context = CommandContext::new(&metadata, "commands", 0, 7);
        (envelope, metadata, context)
    }

    #[tokio::test]
    async fn test_routes_to_typed_handler() {
        let applied = Arc::new(AtomicUsize::new(0));
        let router = CommandRouter::new();
        router
            .register_handler(
                "payment.apply",
                ApplyPaymentHandler {
                    applied: Arc::clone(&applied),
                },
            )
            .await;

        let (envelope, metadata, context) = command(json!({"amount_cents": 500}));
        let outcome = router.route(&envelope, &metadata, &context).await.unwrap();

        assert_eq!(outcome, RouteOutcome::Handled);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_command_is_noop() {
        let router = CommandRouter::new();
        let (envelope, metadata, context) = command(json!({}));
        let outcome = router.route(&envelope, &metadata, &context).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Unrouted);
    }

    #[tokio::test]
    async fn test_parse_and_handler_errors_propagate() {
        let router = CommandRouter::new();
        router
            .register_handler(
                "payment.apply",
                ApplyPaymentHandler {
                    applied: Arc::new(AtomicUsize::new(0)),
                },
            )
            .await;

        let (envelope, metadata, context) = command(json!({"amount_cents": "lots"}));
        let err = router.route(&envelope, &metadata, &context).await.unwrap_err();
        assert_eq!(err.name(), "ValidationError");

        let (envelope, metadata, context) = command(json!({"amount_cents": 0}));
        let err = router.route(&envelope, &metadata, &context).await.unwrap_err();
        assert_eq!(err.name(), "HandlerError");
        assert_eq!(err.to_string(), "amount must be positive");
    }
}
