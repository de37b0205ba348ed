//! Events, event kinds, and typed event encoding.
//!
//! An [`Event`] is the generic, broadcastable form. Domain modules define
//! closed, adjacently tagged enums (`#[serde(tag = "type", content = "data")]`)
//! and convert through [`Event::from_typed`] and [`Event::decode`], so the bus
//! can stay keyed by the runtime `type` string while handlers match on variants.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CommandRef;

/// Emitted by the bus right before a handler task starts.
pub const COMMAND_STARTED: &str = "COMMAND_STARTED";

/// Generic terminal failure. Payload is [`CommandFailed`].
pub const COMMAND_FAILED: &str = "COMMAND_FAILED";

/// Generic terminal cancellation for handlers that did not emit their own.
pub const COMMAND_CANCELLED: &str = "COMMAND_CANCELLED";

/// Classification of an event derived from its type suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `*_REQUESTED` / `*_STARTED`: work has begun.
    Requested,
    /// `*_SUCCESS` / `*_RESOLVED` / `*_CHANGED` / `*_COMPLETED`.
    Succeeded,
    /// `*_FAILED` / `*_ERROR`.
    Failed,
    /// `*_CANCEL` / `*_CANCELLED`.
    Cancelled,
    /// Anything else; never terminal.
    Notification,
}

impl EventKind {
    /// Classify an event type string.
    pub fn of(event_type: &str) -> Self {
        const SUFFIXES: &[(&str, EventKind)] = &[
            ("_REQUESTED", EventKind::Requested),
            ("_STARTED", EventKind::Requested),
            ("_SUCCESS", EventKind::Succeeded),
            ("_RESOLVED", EventKind::Succeeded),
            ("_CHANGED", EventKind::Succeeded),
            ("_COMPLETED", EventKind::Succeeded),
            ("_FAILED", EventKind::Failed),
            ("_ERROR", EventKind::Failed),
            ("_CANCELLED", EventKind::Cancelled),
            ("_CANCEL", EventKind::Cancelled),
        ];
        SUFFIXES
            .iter()
            .find(|(suffix, _)| event_type.ends_with(suffix))
            .map_or(EventKind::Notification, |(_, kind)| *kind)
    }

    /// Whether an event of this kind ends a command.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::Succeeded | EventKind::Failed | EventKind::Cancelled
        )
    }
}

/// A broadcast notification of something that happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Runtime discriminant.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data, a JSON object (empty for unit variants).
    pub payload: Value,
    /// Causal thread this event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Command whose handler emitted this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<CommandRef>,
}

impl Event {
    /// Create an uncorrelated event.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            correlation_id: None,
            caused_by: None,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causing command.
    pub fn with_caused_by(mut self, cause: CommandRef) -> Self {
        self.caused_by = Some(cause);
        self
    }

    /// Classification of this event.
    pub fn kind(&self) -> EventKind {
        EventKind::of(&self.event_type)
    }

    /// Shorthand for `self.kind().is_terminal()`.
    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Encode an adjacently tagged domain event.
    ///
    /// The `"type"` tag becomes [`Event::event_type`] and the `"data"` content
    /// becomes [`Event::payload`]. Unit variants get an empty object payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if serialization fails or the value is not
    /// an object with a string `"type"` field.
    pub fn from_typed<E: Serialize>(domain_event: &E) -> serde_json::Result<Self> {
        let value = serde_json::to_value(domain_event)?;
        let Value::Object(mut obj) = value else {
            return Err(serde::ser::Error::custom(
                "typed event must serialize to a JSON object",
            ));
        };
        let event_type = match obj.remove("type") {
            Some(Value::String(t)) => t,
            _ => {
                return Err(serde::ser::Error::custom(
                    "typed event must carry a string 'type' tag",
                ));
            }
        };
        let payload = match obj.remove("data") {
            None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
            Some(data) => data,
        };
        Ok(Self::new(event_type, payload))
    }

    /// Decode this event into an adjacently tagged domain event.
    ///
    /// Returns `None` when the type is not a variant of `E` or the payload
    /// does not match, so subscribers can ignore foreign events.
    pub fn decode<E: DeserializeOwned>(&self) -> Option<E> {
        let tagged = serde_json::json!({ "type": self.event_type, "data": self.payload });
        if let Ok(decoded) = serde_json::from_value(tagged) {
            return Some(decoded);
        }
        // Unit variants reject a content field.
        serde_json::from_value(serde_json::json!({ "type": self.event_type })).ok()
    }
}

/// Why the bus produced a `COMMAND_FAILED` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No handler is registered for the command type.
    UnknownCommand,
    /// Validation or payload decoding failed.
    InvalidArguments,
    /// The handler returned an error.
    HandlerError,
    /// The handler exceeded the configured timeout.
    TimedOut,
    /// The handler panicked.
    Panicked,
    /// The handler returned without emitting a terminal event.
    NoTerminalEvent,
    /// The engine shut down before the command finished.
    EngineClosed,
}

/// Payload of a `COMMAND_FAILED` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailed {
    /// Type of the failed command.
    pub command_type: String,
    /// Failure category.
    pub reason: FailureReason,
    /// Human-readable detail.
    pub message: String,
}

impl CommandFailed {
    /// Build a correlated `COMMAND_FAILED` event.
    pub fn into_event(self, correlation_id: Option<String>, cause: Option<CommandRef>) -> Event {
        let payload =
            serde_json::to_value(&self).unwrap_or_else(|_| Value::Object(Default::default()));
        Event {
            event_type: COMMAND_FAILED.to_owned(),
            payload,
            correlation_id,
            caused_by: cause,
        }
    }

    /// Parse the payload of a `COMMAND_FAILED` event.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.event_type != COMMAND_FAILED {
            return None;
        }
        serde_json::from_value(event.payload.clone()).ok()
    }
}
