//! Relay wire protocol
//!
//! All relay traffic is JSON carried in WebSocket text frames:
//! ```text
//! outbound  {"type": "<TYPE>", "payload": {..., "latitude": f64|null, "longitude": f64|null}}
//! inbound   {"type": "SENSOR_DATA", "topic": "<topic>", "data": {...}}
//! control   {"type": "SUBSCRIBE"|"UNSUBSCRIBE", "payload": {"topic": "<topic>"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const SENSOR_DATA: &str = "SENSOR_DATA";
pub const DEVICE_STATUS: &str = "DEVICE_STATUS";
pub const SUBSCRIBE: &str = "SUBSCRIBE";
pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";

/// Inbound frame types emitted by development tooling sharing the socket
pub const NOISE_TYPES: [&str; 6] = ["hot", "liveReload", "hash", "overlay", "errors", "warnings"];

/// Errors that can occur while encoding or decoding relay frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload must be a JSON object, got {0}")]
    PayloadNotObject(&'static str),
}

/// A frame sent from a client to the relay
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl OutboundFrame {
    /// Build a frame from any serializable payload that renders as a JSON object
    pub fn new<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload)?;
        if !payload.is_object() {
            return Err(ProtocolError::PayloadNotObject(json_kind(&payload)));
        }
        Ok(Self {
            kind: kind.into(),
            payload,
        })
    }

    /// Build a SUBSCRIBE control frame
    pub fn subscribe(topic: &str) -> Self {
        Self::control(SUBSCRIBE, topic)
    }

    /// Build an UNSUBSCRIBE control frame
    pub fn unsubscribe(topic: &str) -> Self {
        Self::control(UNSUBSCRIBE, topic)
    }

    fn control(kind: &str, topic: &str) -> Self {
        Self {
            kind: kind.to_string(),
            payload: serde_json::json!({ "topic": topic }),
        }
    }

    /// Merge coordinates into the payload, `null` when unknown
    pub fn with_location(mut self, latitude: Option<f64>, longitude: Option<f64>) -> Self {
        if let Some(map) = self.payload.as_object_mut() {
            map.insert("latitude".into(), latitude.map_or(Value::Null, Value::from));
            map.insert("longitude".into(), longitude.map_or(Value::Null, Value::from));
        }
        self
    }

    /// Get the payload object
    pub fn payload_object(&self) -> Option<&Map<String, Value>> {
        self.payload.as_object()
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A frame delivered by the relay to a client
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    /// Build a SENSOR_DATA frame for a topic
    pub fn sensor_data(topic: impl Into<String>, data: Value) -> Self {
        Self {
            kind: SENSOR_DATA.to_string(),
            topic: Some(topic.into()),
            data,
        }
    }

    /// Whether this frame comes from development tooling rather than the relay
    pub fn is_noise(&self) -> bool {
        NOISE_TYPES.contains(&self.kind.as_str())
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Payload of SUBSCRIBE / UNSUBSCRIBE control frames
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ControlPayload {
    pub topic: String,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
