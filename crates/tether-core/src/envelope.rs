//! Wire envelope shared by every message on the bridge.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// Envelope types understood by the protocol layer itself.
pub mod kinds {
    /// Client handshake, carries the instance id.
    pub const HELLO: &str = "hello";
    /// Server acknowledgement of `hello`.
    pub const HELLO_ACK: &str = "helloAck";
    /// Liveness probe sent by the client.
    pub const PING: &str = "ping";
    /// Liveness reply sent by the server.
    pub const PONG: &str = "pong";
    /// Informational notice from the server after accepting the socket.
    pub const CONNECTED: &str = "connected";
    /// Reply to a correlated request.
    pub const RESPONSE: &str = "response";
    /// Run a script in the sandbox.
    pub const EXECUTE_CODE: &str = "execute.code";
    /// Executor health probe.
    pub const EXECUTE_PING: &str = "execute.ping";
    /// Abort a running script by execution id.
    pub const EXECUTE_ABORT: &str = "execute.abort";

    /// Types handled internally by the router and never dispatched.
    pub const RESERVED: &[&str] = &[HELLO_ACK, PONG, CONNECTED];

    /// Whether `kind` is consumed by the protocol layer.
    #[must_use]
    pub fn is_reserved(kind: &str) -> bool {
        RESERVED.contains(&kind)
    }
}

/// A typed, optionally correlated message unit.
///
/// Payload fields are flattened into the top-level JSON object so that
/// `{"type":"execute.code","code":"..."}` decodes with `code` in `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,

    /// Correlation id, present on requests and their responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Instance id of the client this envelope belongs to.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Remaining fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Create an empty envelope of the given type.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            session_id: None,
            payload: Map::new(),
        }
    }

    /// Create a `response` envelope correlated to `id`.
    ///
    /// Non-object payloads are wrapped under a `result` key.
    #[must_use]
    pub fn response(id: impl Into<String>, payload: Value) -> Self {
        Self::new(kinds::RESPONSE)
            .with_id(id)
            .with_payload(payload)
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Stamp the envelope with an instance id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Add a single payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Merge a payload value into the envelope.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        match payload {
            Value::Object(map) => self.payload.extend(map),
            Value::Null => {}
            other => {
                self.payload.insert("result".to_string(), other);
            }
        }
        self
    }

    /// Decode an envelope from JSON text.
    ///
    /// # Errors
    /// Returns error if the text is not a JSON object with a string `type`.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode the envelope as JSON text.
    ///
    /// # Errors
    /// Returns error if a payload value cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize the payload into a typed structure.
    ///
    /// # Errors
    /// Returns error if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    /// Payload as a JSON object value.
    #[must_use]
    pub fn payload_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    /// Whether this envelope belongs to `session_id`.
    ///
    /// Envelopes without a session stamp are accepted.
    #[must_use]
    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.session_id.as_deref().is_none_or(|s| s == session_id)
    }
}
