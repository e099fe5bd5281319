//! # Idempotency Guard
//!
//! Wraps an optional [`IdempotencyStore`] with the configured
//! [`IdempotencyFailureMode`]. Without a store, or without a dedup key on the
//! command, every check proceeds.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    IdempotencyError, IdempotencyFailureMode, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
};
use crate::messaging::ValidatedMetadata;

/// What the consumer should do with a command after the pre-handler check
#[derive(Debug)]
pub enum GuardDecision {
    /// Invoke the handler
    Proceed,
    /// Already processed; skip the handler
    Duplicate,
    /// Store failed under fail-closed; dead-letter without invoking the handler
    Reject(IdempotencyError),
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Option<Arc<dyn IdempotencyStore>>,
    failure_mode: IdempotencyFailureMode,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("has_store", &self.store.is_some())
            .field("failure_mode", &self.failure_mode)
            .finish()
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::disabled()
    }
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, failure_mode: IdempotencyFailureMode) -> Self {
        Self {
            store: Some(store),
            failure_mode,
        }
    }

    /// A guard that never deduplicates
    pub fn disabled() -> Self {
        Self {
            store: None,
            failure_mode: IdempotencyFailureMode::FailOpen,
        }
    }

    pub fn failure_mode(&self) -> IdempotencyFailureMode {
        self.failure_mode
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    fn key_for<'a>(&self, metadata: &'a ValidatedMetadata) -> Option<IdempotencyKey<'a>> {
        metadata.dedup_key().map(|key| IdempotencyKey {
            tenant_id: &metadata.tenant_id,
            key,
            command_name: &metadata.command_name,
        })
    }

    pub async fn check(&self, metadata: &ValidatedMetadata) -> GuardDecision {
        let (Some(store), Some(key)) = (&self.store, self.key_for(metadata)) else {
            return GuardDecision::Proceed;
        };

        match store.check(&key).await {
            Ok(true) => {
                debug!(
                    tenant_id = %key.tenant_id,
                    idempotency_key = %key.key,
                    command_name = %key.command_name,
                    "Duplicate command detected"
                );
                GuardDecision::Duplicate
            }
            Ok(false) => GuardDecision::Proceed,
            Err(error) => match self.failure_mode {
                IdempotencyFailureMode::FailOpen => {
                    warn!(
                        tenant_id = %key.tenant_id,
                        idempotency_key = %key.key,
                        command_name = %key.command_name,
                        error = %error,
                        "Idempotency check failed; processing command anyway (fail-open)"
                    );
                    GuardDecision::Proceed
                }
                IdempotencyFailureMode::FailClosed => {
                    warn!(
                        tenant_id = %key.tenant_id,
                        idempotency_key = %key.key,
                        command_name = %key.command_name,
                        error = %error,
                        "Idempotency check failed; rejecting command (fail-closed)"
                    );
                    GuardDecision::Reject(error)
                }
            },
        }
    }

    /// Record a successfully handled command. Failures are logged only.
    pub async fn record(&self, metadata: &ValidatedMetadata) {
        let (Some(store), Some(key)) = (&self.store, self.key_for(metadata)) else {
            return;
        };

        let record = IdempotencyRecord::new(&key, metadata.command_id.as_deref());
        if let Err(error) = store.record(&record).await {
            warn!(
                tenant_id = %key.tenant_id,
                idempotency_key = %key.key,
                command_name = %key.command_name,
                error = %error,
                "Failed to record idempotency key; a redelivery may run the handler again"
            );
        }
    }
}
