//! JSON-RPC wire format: outbound [`Envelope`]s and inbound [`Reply`] frames.
//!
//! One WebSocket text frame carries exactly one JSON document. Inbound frames are
//! classified once, here, into [`Reply::Correlated`], [`Reply::Notification`] or
//! [`Reply::Unroutable`]. Bytes that are not a JSON object with the expected field
//! types are a [`TransportError::MalformedFrame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

use crate::errors::{RemoteError, Result, TransportError};

/// Protocol version stamped on every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name the server uses for pushed events.
pub const EVENT_METHOD: &str = "onEvent";

/// Outgoing request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Correlation id, assigned by the connection.
    pub id: u64,
    /// Remote method name.
    pub method: String,
    /// Method parameters.
    pub params: Value,
    /// Session token, once the server has handed one out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Envelope {
    /// Build an envelope. `params` of `null` is sent as an empty object.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params: if params.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                params
            },
            session_id: None,
        }
    }

    /// Attach a session token.
    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Decoded inbound frame.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Answer to a request we sent.
    Correlated(Response),
    /// Unsolicited server push.
    Notification(Notification),
    /// Well-formed object with neither a usable `id` nor a `method`, such as an
    /// error reply with `"id": null`.
    Unroutable(Unroutable),
}

impl Reply {
    /// Session token carried by this frame, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Correlated(response) => response
                .result
                .as_ref()
                .and_then(|r| r.session_id.as_deref()),
            Self::Notification(_) | Self::Unroutable(_) => None,
        }
    }
}

/// Correlated reply.
#[derive(Clone, Debug)]
pub struct Response {
    /// Echo of the request id.
    pub id: u64,
    /// Successful result, if the server sent one.
    pub result: Option<CallResult>,
    /// Server-side failure, if any.
    pub error: Option<RemoteError>,
}

impl Response {
    /// Split into the successful result or the remote error.
    ///
    /// A reply with neither field is treated as an empty success.
    pub fn into_result(self) -> std::result::Result<CallResult, RemoteError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(err),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(CallResult::default()),
        }
    }
}

/// The `result` object of a correlated reply.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    /// Raw `value` payload, left undecoded for the caller.
    #[serde(default)]
    pub value: Option<Box<RawValue>>,
    /// Session token assigned by the server.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Object id the result refers to.
    #[serde(default)]
    pub object: Option<String>,
}

impl CallResult {
    /// Decode the raw `value` into a concrete type.
    pub fn decode_value<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        let raw = self.value.as_deref().map_or("null", RawValue::get);
        serde_json::from_str(raw)
    }

    /// `value` as a string, the common shape for object ids.
    pub fn value_str(&self) -> Option<String> {
        self.decode_value::<String>().ok()
    }
}

/// Routing key for an event subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    /// Event type, e.g. `EndOfStream`.
    pub event_type: String,
    /// Id of the server object that emits it.
    pub source_id: String,
}

impl SubscriptionKey {
    /// Build a key.
    pub fn new(event_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source_id: source_id.into(),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.event_type, self.source_id)
    }
}

/// Server push.
#[derive(Clone, Debug)]
pub struct Notification {
    /// Notification method, normally [`EVENT_METHOD`].
    pub method: String,
    /// Full `params` object.
    pub params: Value,
    /// `(params.value.data.type, params.value.data.source)` when both are present.
    pub key: Option<SubscriptionKey>,
}

impl Notification {
    /// The `params.value.data` object.
    pub fn data(&self) -> Option<&Value> {
        self.params.get("value").and_then(|v| v.get("data"))
    }

    /// Whether this is an event the subscription table routes.
    pub fn is_event(&self) -> bool {
        self.method == EVENT_METHOD
    }
}

/// A frame that cannot be routed to any caller or subscriber.
#[derive(Clone, Debug)]
pub struct Unroutable {
    /// Server error carried by the frame, if any.
    pub error: Option<RemoteError>,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<CallResult>,
    #[serde(default)]
    error: Option<RemoteError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// Serialize an envelope into a frame body.
pub fn encode(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(|e| TransportError::Send {
        method: envelope.method.clone(),
        reason: e.to_string(),
    })
}

/// Parse a frame body.
pub fn decode(bytes: &[u8]) -> Result<Reply> {
    let frame: RawFrame = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;

    if let Some(id) = frame.id {
        return Ok(Reply::Correlated(Response {
            id,
            result: frame.result,
            error: frame.error,
        }));
    }

    let Some(method) = frame.method else {
        return Ok(Reply::Unroutable(Unroutable { error: frame.error }));
    };
    let params = frame.params.unwrap_or(Value::Null);
    let key = event_key(&params);
    Ok(Reply::Notification(Notification {
        method,
        params,
        key,
    }))
}

fn event_key(params: &Value) -> Option<SubscriptionKey> {
    let data = params.get("value")?.get("data")?;
    let event_type = data.get("type")?.as_str()?;
    let source = data.get("source")?.as_str()?;
    Some(SubscriptionKey::new(event_type, source))
}

fn malformed(reason: impl Into<String>) -> TransportError {
    TransportError::MalformedFrame {
        reason: reason.into(),
    }
}
