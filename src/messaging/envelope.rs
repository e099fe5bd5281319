//! # Command Envelope
//!
//! The unit carried on the bus: routing metadata plus an opaque, handler-defined
//! payload. Envelopes travel as camelCase JSON.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::errors::{MessagingError, MessagingResult};

/// Identity of whoever initiated the command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedBy {
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub role: Option<String>,
}

/// Raw envelope metadata as found on the wire. Every field may be absent, and
/// a field of the wrong JSON type reads as absent instead of failing the whole
/// envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMetadata {
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub command_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub idempotency_key: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub command_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub tenant_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_service: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_initiated_by",
        skip_serializing_if = "Option::is_none"
    )]
    pub initiated_by: Option<InitiatedBy>,
}

/// Strings pass through and numbers keep their textual form; anything else is
/// treated as missing.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_initiated_by<'de, D>(deserializer: D) -> Result<Option<InitiatedBy>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(serde_json::from_value(Value::deserialize(deserializer)?).ok())
}

fn lenient_metadata<'de, D>(deserializer: D) -> Result<CommandMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(serde_json::from_value(Value::deserialize(deserializer)?).unwrap_or_default())
}

/// A command as transmitted on the bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: CommandMetadata,
    #[serde(default)]
    pub payload: Value,
}

/// Why an envelope was not eligible for this consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    /// The body was valid JSON but not an object
    MalformedEnvelope,
    MissingCommandName,
    MissingTenantId,
    /// Addressed to a different service on a shared topic
    OtherTarget(String),
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligible::MalformedEnvelope => write!(f, "malformed_envelope"),
            Ineligible::MissingCommandName => write!(f, "missing_command_name"),
            Ineligible::MissingTenantId => write!(f, "missing_tenant_id"),
            Ineligible::OtherTarget(target) => write!(f, "targeted_at:{target}"),
        }
    }
}

/// Metadata after the routing predicate has passed.
///
/// `command_name` and `tenant_id` are guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMetadata {
    pub command_name: String,
    pub tenant_id: String,
    pub command_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
    pub target_service: Option<String>,
    pub initiated_by: Option<InitiatedBy>,
}

impl ValidatedMetadata {
    /// Key used for deduplication: the idempotency key, falling back to the
    /// command id. `None` disables dedup for this message.
    pub fn dedup_key(&self) -> Option<&str> {
        self.idempotency_key
            .as_deref()
            .or(self.command_id.as_deref())
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl CommandEnvelope {
    pub fn new(metadata: CommandMetadata, payload: Value) -> Self {
        Self { metadata, payload }
    }

    /// Apply the routing predicate for the consumer identified by `service_name`.
    pub fn validate_for(&self, service_name: &str) -> Result<ValidatedMetadata, Ineligible> {
        let meta = &self.metadata;

        if let Some(target) = non_empty(&meta.target_service) {
            if target != service_name {
                return Err(Ineligible::OtherTarget(target));
            }
        }

        let command_name =
            non_empty(&meta.command_name).ok_or(Ineligible::MissingCommandName)?;
        let tenant_id = non_empty(&meta.tenant_id).ok_or(Ineligible::MissingTenantId)?;

        Ok(ValidatedMetadata {
            command_name,
            tenant_id,
            command_id: non_empty(&meta.command_id),
            idempotency_key: non_empty(&meta.idempotency_key),
            correlation_id: non_empty(&meta.correlation_id),
            request_id: non_empty(&meta.request_id),
            target_service: non_empty(&meta.target_service),
            initiated_by: meta.initiated_by.clone(),
        })
    }
}

/// Result of decoding a message body
#[derive(Debug, Clone)]
pub enum DecodedBody {
    /// Well-formed envelope, with the JSON it was decoded from
    Envelope(CommandEnvelope, Value),
    /// Valid JSON that is not an object
    Unshaped(Value),
}

/// Decode raw message bytes.
///
/// Only bytes that are not JSON at all are an error. Any JSON object decodes to
/// an envelope, with mistyped metadata fields read as absent, so eligibility is
/// decided by the routing predicate alone. Non-object JSON is returned as
/// [`DecodedBody::Unshaped`] and skipped by the caller.
pub fn decode_body(bytes: &[u8]) -> MessagingResult<DecodedBody> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| MessagingError::message_deserialization(e.to_string()))?;

    if !value.is_object() {
        return Ok(DecodedBody::Unshaped(value));
    }

    match serde_json::from_value::<CommandEnvelope>(value.clone()) {
        Ok(envelope) => Ok(DecodedBody::Envelope(envelope, value)),
        Err(_) => Ok(DecodedBody::Unshaped(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> CommandEnvelope {
        serde_json::from_value(value).expect("envelope should deserialize")
    }

    #[test]
    fn test_camel_case_wire_format() {
        let env = envelope(json!({
            "metadata": {
                "commandId": "cmd-1",
                "idempotencyKey": "idem-1",
                "commandName": "reservation.create",
                "tenantId": "tenant-a",
                "initiatedBy": {"userId": "u-1", "role": "admin"}
            },
            "payload": {"roomId": 12}
        }));

        assert_eq!(env.metadata.command_name.as_deref(), Some("reservation.create"));
        assert_eq!(
            env.metadata.initiated_by.as_ref().and_then(|i| i.role.as_deref()),
            Some("admin")
        );
        assert_eq!(env.payload["roomId"], 12);
    }

    #[test]
    fn test_validate_requires_name_and_tenant() {
        let missing_name = envelope(json!({"metadata": {"tenantId": "t"}}));
        assert_eq!(
            missing_name.validate_for("billing"),
            Err(Ineligible::MissingCommandName)
        );

        let blank_tenant = envelope(json!({"metadata": {"commandName": "x", "tenantId": "  "}}));
        assert_eq!(
            blank_tenant.validate_for("billing"),
            Err(Ineligible::MissingTenantId)
        );
    }

    #[test]
    fn test_validate_target_service() {
        let other = envelope(json!({
            "metadata": {"commandName": "x", "tenantId": "t", "targetService": "payments"}
        }));
        assert_eq!(
            other.validate_for("billing"),
            Err(Ineligible::OtherTarget("payments".to_string()))
        );

        let ours = envelope(json!({
            "metadata": {"commandName": "x", "tenantId": "t", "targetService": "billing"}
        }));
        assert!(ours.validate_for("billing").is_ok());
    }

    #[test]
    fn test_dedup_key_falls_back_to_command_id() {
        let with_key = envelope(json!({
            "metadata": {
                "commandName": "x",
                "tenantId": "t",
                "commandId": "c",
                "idempotencyKey": "k"
            }
        }));
        assert_eq!(with_key.validate_for("svc").unwrap().dedup_key(), Some("k"));

        let only_id = envelope(json!({
            "metadata": {
                "commandName": "x",
                "tenantId": "t",
                "commandId": "c",
                "idempotencyKey": ""
            }
        }));
        assert_eq!(only_id.validate_for("svc").unwrap().dedup_key(), Some("c"));

        let neither = envelope(json!({"metadata": {"commandName": "x", "tenantId": "t"}}));
        assert_eq!(neither.validate_for("svc").unwrap().dedup_key(), None);
    }

    #[test]
    fn test_decode_body() {
        assert!(decode_body(b"{not json").is_err());
        assert!(matches!(decode_body(b"42"), Ok(DecodedBody::Unshaped(_))));
        assert!(matches!(decode_body(b"[1, 2]"), Ok(DecodedBody::Unshaped(_))));
        assert!(matches!(
            decode_body(br#"{"metadata": {"commandName": "a", "tenantId": "b"}, "payload": {}}"#),
            Ok(DecodedBody::Envelope(_, _))
        ));
    }

    #[test]
    fn test_mistyped_optional_fields_do_not_reject_envelope() {
        let body = br#"{
            "metadata": {
                "commandName": "ApplyPayment",
                "tenantId": "tenant-1",
                "commandId": 981,
                "correlationId": {"nested": true},
                "initiatedBy": {"userId": 42, "role": "admin"}
            },
            "payload": {"amount": 5}
        }"#;
        let Ok(DecodedBody::Envelope(env, _)) = decode_body(body) else {
            panic!("expected an envelope");
        };

        assert_eq!(env.metadata.command_id.as_deref(), Some("981"));
        assert_eq!(env.metadata.correlation_id, None);
        let initiated_by = env.metadata.initiated_by.clone().unwrap();
        assert_eq!(initiated_by.user_id.as_deref(), Some("42"));
        assert_eq!(initiated_by.role.as_deref(), Some("admin"));

        let validated = env.validate_for("billing").unwrap();
        assert_eq!(validated.dedup_key(), Some("981"));
    }

    #[test]
    fn test_mistyped_routing_fields_read_as_missing() {
        let Ok(DecodedBody::Envelope(env, _)) =
            decode_body(br#"{"metadata": {"commandName": ["a"], "tenantId": "t"}}"#)
        else {
            panic!("expected an envelope");
        };
        assert_eq!(env.validate_for("billing"), Err(Ineligible::MissingCommandName));

        let Ok(DecodedBody::Envelope(env, _)) = decode_body(br#"{"metadata": "oops"}"#) else {
            panic!("expected an envelope");
        };
        assert_eq!(env.metadata, CommandMetadata::default());
    }
}
