//! Core data types shared by the session and event-stream stores.
//!
//! Message *bodies* are opaque to this layer: they travel as [`Bytes`] and
//! are preserved byte-for-byte on replay. Only the thin JSON-RPC envelope
//! (id, method, result/error presence) is inspected, just enough to classify
//! a message and route it.

use std::{fmt::Display, str::FromStr, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque session identifier, assigned by the server at session creation and
/// never reused. Returned to the client via the `Mcp-Session-Id` header.
pub type SessionId = Arc<str>;

/// Identifies one logical SSE stream within a session. A session may hold
/// several concurrent streams (one per in-flight request plus a standalone
/// stream for server-initiated traffic).
pub type StreamId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

pub fn stream_id() -> StreamId {
    uuid::Uuid::new_v4().to_string().into()
}

/// Separates the stream part from the sequence part of an [`EventId`].
///
/// Stream IDs are UUIDs, so the delimiter can never occur inside one.
pub const EVENT_ID_DELIMITER: char = '/';

const SEQUENCE_WIDTH: usize = 20;

/// Replay identifier carried as the SSE `id:` field.
///
/// Encoded as `<stream_id>/<seq>` where `<seq>` is a zero-padded 20-digit
/// decimal, so lexicographic comparison of the encoded form equals numeric
/// comparison of the sequence. Totally ordered within its stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    stream_id: StreamId,
    sequence: u64,
}

impl EventId {
    pub fn new(stream_id: StreamId, sequence: u64) -> Self {
        Self {
            stream_id,
            sequence,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.stream_id == other.stream_id {
            Some(self.sequence.cmp(&other.sequence))
        } else {
            None
        }
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{:0width$}",
            self.stream_id,
            EVENT_ID_DELIMITER,
            self.sequence,
            width = SEQUENCE_WIDTH
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed event id: {reason}")]
pub struct EventIdError {
    reason: &'static str,
}

impl FromStr for EventId {
    type Err = EventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream, seq) = s.rsplit_once(EVENT_ID_DELIMITER).ok_or(EventIdError {
            reason: "missing delimiter",
        })?;
        if stream.is_empty() {
            return Err(EventIdError {
                reason: "empty stream id",
            });
        }
        let sequence = seq.parse::<u64>().map_err(|_| EventIdError {
            reason: "sequence is not a decimal number",
        })?;
        Ok(Self {
            stream_id: stream.into(),
            sequence,
        })
    }
}

/// JSON-RPC request identifier: a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(Arc<str>),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.into())
    }
}

/// Closed tag over the message classes this layer distinguishes.
///
/// Retention on the event store is decided by a pure function over this tag,
/// never by inspecting the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A call expecting a response, carrying an id and a method.
    Request,
    /// A reply (result or error) correlated by request id.
    Response,
    /// One-way traffic with no delivery guarantee.
    Notification,
}

pub const INITIALIZE_METHOD: &str = "initialize";
pub const CANCELLED_NOTIFICATION_METHOD: &str = "notifications/cancelled";

/// Parameters of a `notifications/cancelled` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotificationParam {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("body is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported jsonrpc version: {0:?}")]
    Version(Option<String>),
    #[error("message is neither request, response nor notification")]
    Unclassifiable,
}

#[derive(Deserialize)]
struct EnvelopeProbe {
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// A client→server message, classified but otherwise opaque.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub kind: MessageKind,
    pub request_id: Option<RequestId>,
    pub method: Option<String>,
    /// The original body, untouched.
    pub payload: Bytes,
}

impl ClientMessage {
    /// Classify a raw body by its JSON-RPC envelope. The body itself is kept
    /// verbatim in `payload`.
    pub fn classify(payload: Bytes) -> Result<Self, EnvelopeError> {
        let probe: EnvelopeProbe = serde_json::from_slice(&payload)?;
        match probe.jsonrpc.as_deref() {
            Some("2.0") => {}
            other => return Err(EnvelopeError::Version(other.map(str::to_owned))),
        }
        let kind = match (&probe.id, &probe.method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (None, Some(_)) => MessageKind::Notification,
            (Some(_), None) if probe.result.is_some() || probe.error.is_some() => {
                MessageKind::Response
            }
            _ => return Err(EnvelopeError::Unclassifiable),
        };
        Ok(Self {
            kind,
            request_id: probe.id,
            method: probe.method,
            payload,
        })
    }

    pub fn is_initialize_request(&self) -> bool {
        self.kind == MessageKind::Request && self.method.as_deref() == Some(INITIALIZE_METHOD)
    }

    /// For a `notifications/cancelled` message, the typed parameters.
    /// `None` for anything else, including malformed params.
    pub fn cancelled_params(&self) -> Option<CancelledNotificationParam> {
        if self.kind != MessageKind::Notification
            || self.method.as_deref() != Some(CANCELLED_NOTIFICATION_METHOD)
        {
            return None;
        }
        let probe: EnvelopeProbe = serde_json::from_slice(&self.payload).ok()?;
        serde_json::from_value(probe.params?).ok()
    }
}

/// A server→client message handed to the transport for delivery.
#[derive(Debug, Clone)]
pub struct ServerMessage {
    pub kind: MessageKind,
    /// Correlation id: the request being answered (for responses), or the id
    /// of a server-initiated request.
    pub request_id: Option<RequestId>,
    pub payload: Bytes,
}

impl ServerMessage {
    pub fn response(request_id: RequestId, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Response,
            request_id: Some(request_id),
            payload: payload.into(),
        }
    }

    pub fn request(request_id: RequestId, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Request,
            request_id: Some(request_id),
            payload: payload.into(),
        }
    }

    pub fn notification(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Notification,
            request_id: None,
            payload: payload.into(),
        }
    }
}

/// One frame on a server-sent event stream: the payload plus the per-event
/// metadata that must survive replay.
#[derive(Debug, Clone)]
pub struct ServerSseMessage {
    /// Replay watermark; absent for frames that cannot be resumed from
    /// (e.g. the initialize response).
    pub event_id: Option<EventId>,
    /// Reconnection-interval hint (SSE `retry:`).
    pub retry: Option<Duration>,
    pub message: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_round_trips() {
        let id = EventId::new("d2a9".into(), 42);
        let encoded = id.to_string();
        assert_eq!(encoded, format!("d2a9/{:020}", 42));
        let parsed: EventId = encoded.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn event_id_lexicographic_order_matches_numeric() {
        let a = EventId::new("s".into(), 9).to_string();
        let b = EventId::new("s".into(), 10).to_string();
        let c = EventId::new("s".into(), 100).to_string();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn event_id_rejects_garbage() {
        assert!("no-delimiter".parse::<EventId>().is_err());
        assert!("/123".parse::<EventId>().is_err());
        assert!("stream/not-a-number".parse::<EventId>().is_err());
    }

    #[test]
    fn classify_request_response_notification() {
        let req = ClientMessage::classify(Bytes::from_static(
            br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
        ))
        .unwrap();
        assert_eq!(req.kind, MessageKind::Request);
        assert_eq!(req.request_id, Some(RequestId::Number(1)));

        let notif = ClientMessage::classify(Bytes::from_static(
            br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        ))
        .unwrap();
        assert_eq!(notif.kind, MessageKind::Notification);

        let resp = ClientMessage::classify(Bytes::from_static(
            br#"{"jsonrpc":"2.0","id":"r-1","result":{}}"#,
        ))
        .unwrap();
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.request_id, Some(RequestId::from("r-1")));
    }

    #[test]
    fn classify_rejects_wrong_version_and_shapeless_bodies() {
        assert!(
            ClientMessage::classify(Bytes::from_static(br#"{"jsonrpc":"1.0","id":1}"#)).is_err()
        );
        assert!(ClientMessage::classify(Bytes::from_static(br#"{"jsonrpc":"2.0","id":1}"#)).is_err());
    }

    #[test]
    fn cancelled_params_extraction() {
        let msg = ClientMessage::classify(Bytes::from_static(
            br#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":7,"reason":"user gave up"}}"#,
        ))
        .unwrap();
        let params = msg.cancelled_params().unwrap();
        assert_eq!(params.request_id, RequestId::Number(7));
        assert_eq!(params.reason.as_deref(), Some("user gave up"));

        let other = ClientMessage::classify(Bytes::from_static(
            br#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#,
        ))
        .unwrap();
        assert!(other.cancelled_params().is_none());
    }

    #[test]
    fn payload_is_kept_verbatim() {
        let body = br#"{"jsonrpc":"2.0","id":3,"method":"ping","params":{"k":[1,2,3]}}"#;
        let msg = ClientMessage::classify(Bytes::from_static(body)).unwrap();
        assert_eq!(msg.payload.as_ref(), body);
    }
}
