//! JSON message shapes exchanged with the hub over the WebSocket.
//!
//! Outbound frames are strongly typed ([`AuthMessage`], [`Request`]).
//! Inbound frames are decoded into the loose [`ServerMessage`] envelope
//! first, since the receive loop has to route results, events, and
//! handshake replies that all share one `type` discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Event type carried by entity change notifications.
pub const STATE_CHANGED: &str = "state_changed";

// ── Handshake ────────────────────────────────────────────────────────

/// Client credential frame: `{type: "auth", access_token}`.
#[derive(Debug, Serialize)]
pub struct AuthMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    access_token: &'a str,
}

impl<'a> AuthMessage<'a> {
    pub fn new(access_token: &'a str) -> Self {
        Self {
            kind: "auth",
            access_token,
        }
    }
}

// ── Correlated requests ──────────────────────────────────────────────

/// A request the client can correlate with a `result` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetStates,
    CallService {
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Map::is_empty")]
        service_data: Map<String, Value>,
    },
    SubscribeEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
}

impl Request {
    /// Short label used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::GetStates => "get_states",
            Self::CallService { .. } => "call_service",
            Self::SubscribeEvents { .. } => "subscribe_events",
        }
    }
}

/// Wire envelope that stamps a request with its correlation id.
#[derive(Debug, Serialize)]
pub(crate) struct RequestFrame<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub request: &'a Request,
}

// ── Inbound frames ───────────────────────────────────────────────────

/// Every frame the hub sends, handshake replies and results included.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
    #[serde(default)]
    pub event: Option<EventMessage>,
    /// Present on `auth_ok`.
    #[serde(default)]
    pub ha_version: Option<String>,
    /// Present on `auth_invalid`.
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerMessage {
    pub fn is_event(&self) -> bool {
        self.kind == "event"
    }

    /// Convert a `result` frame into the request outcome.
    ///
    /// `success: false` becomes [`Error::Remote`]; a missing `result`
    /// body is returned as `Value::Null`.
    pub fn into_result(self) -> Result<Value, Error> {
        if self.success == Some(false) {
            let (code, message) = self.error.map_or_else(
                || ("unknown_error".to_owned(), "request failed".to_owned()),
                |e| (e.code, e.message),
            );
            return Err(Error::Remote { code, message });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// `{code, message}` body attached to failed results.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// The `event` object of an unsolicited event frame.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub time_fired: Option<DateTime<Utc>>,
}

/// Payload of a `state_changed` event.
#[derive(Debug, Clone, Deserialize)]
pub struct StateChangedData {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<EntityState>,
    #[serde(default)]
    pub new_state: Option<EntityState>,
}

// ── Entity snapshot ──────────────────────────────────────────────────

/// A hub entity as reported by `get_states` and `state_changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<StateContext>,
}

/// Provenance of a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateContext {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}
