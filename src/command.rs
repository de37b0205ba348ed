//! Commands, command references and correlation ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest correlation id accepted by the bus.
pub const MAX_CORRELATION_ID_LEN: usize = 128;

/// An intent to change state, dispatched once and handled by exactly one handler.
///
/// The `payload` is always a JSON object; handlers deserialize it into their
/// typed command. Commands are immutable once submitted.
///
/// # Examples
///
/// ```
/// use taskfold::Command;
/// use serde_json::json;
///
/// let cmd = Command::new("ATTRIBUTE_FILTER_INIT")
///     .with_payload(json!({"filterId": "f1"}))
///     .with_correlation_id("req-1");
///
/// assert_eq!(cmd.command_type, "ATTRIBUTE_FILTER_INIT");
/// assert_eq!(cmd.correlation_id.as_deref(), Some("req-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Runtime discriminant used to find the handler.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Command arguments, a JSON object.
    pub payload: Value,
    /// Caller-supplied correlation id. The bus generates one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Command {
    /// Create a command with an empty object payload and no correlation id.
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            payload: Value::Object(serde_json::Map::new()),
            correlation_id: None,
        }
    }

    /// Build a command whose payload is the serialized form of `payload`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `payload` cannot be serialized.
    pub fn typed<T: Serialize>(
        command_type: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(command_type).with_payload(serde_json::to_value(payload)?))
    }

    /// Replace the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Lightweight reference used in event `causedBy` fields and task origins.
    ///
    /// Returns `None` until a correlation id is assigned.
    pub fn reference(&self) -> Option<CommandRef> {
        self.correlation_id.as_ref().map(|cid| CommandRef {
            command_type: self.command_type.clone(),
            correlation_id: cid.clone(),
        })
    }
}

/// Identifies the command that caused an event or spawned a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRef {
    /// Type of the originating command.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Correlation id of the originating command.
    pub correlation_id: String,
}

/// Generate a fresh correlation id (UUID v4).
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Check that a caller-supplied correlation id is well formed.
///
/// Accepts 1 to [`MAX_CORRELATION_ID_LEN`] characters drawn from ASCII
/// alphanumerics and `-`, `_`, `.`, `:`.
///
/// # Errors
///
/// Returns a human-readable reason when the id is rejected.
pub fn validate_correlation_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("correlation id must not be empty".to_owned());
    }
    if id.len() > MAX_CORRELATION_ID_LEN {
        return Err(format!(
            "correlation id longer than {MAX_CORRELATION_ID_LEN} characters"
        ));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(format!("correlation id contains invalid character {bad:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_command_has_empty_object_payload() {
        let cmd = Command::new("NOPE");
        assert_eq!(cmd.payload, json!({}));
        assert_eq!(cmd.correlation_id, None);
        assert_eq!(cmd.reference(), None);
    }

    #[test]
    fn typed_serializes_payload() {
        #[derive(Serialize)]
        struct Add {
            amount: u32,
        }
        let cmd = Command::typed("ADD", &Add { amount: 3 }).unwrap();
        assert_eq!(cmd.payload, json!({"amount": 3}));
    }

    #[test]
    fn reference_uses_correlation_id() {
        let cmd = Command::new("X").with_correlation_id("c-1");
        assert_eq!(
            cmd.reference(),
            Some(CommandRef {
                command_type: "X".into(),
                correlation_id: "c-1".into(),
            })
        );
    }

    #[test]
    fn command_json_uses_type_and_camel_case() {
        let cmd = Command::new("X").with_correlation_id("c-1");
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({"type": "X", "payload": {}, "correlationId": "c-1"})
        );
    }

    #[test]
    fn command_without_correlation_deserializes() {
        let cmd: Command = serde_json::from_value(json!({"type": "X", "payload": {}})).unwrap();
        assert_eq!(cmd.correlation_id, None);
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_ne!(a, b);
        assert!(validate_correlation_id(&a).is_ok());
    }

    #[test]
    fn validation_rejects_malformed_ids() {
        assert!(validate_correlation_id("").is_err());
        assert!(validate_correlation_id("has space").is_err());
        assert!(validate_correlation_id(&"a".repeat(MAX_CORRELATION_ID_LEN + 1)).is_err());
        assert!(validate_correlation_id("req:42.a_b-c").is_ok());
    }
}
