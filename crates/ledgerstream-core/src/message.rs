//! Wire types for the node's WebSocket API.
//!
//! Requests are flat JSON objects: `{"id": 7, "command": "server_info", ...params}`.
//! Responses echo the id and carry `"type": "response"` plus `status`.
//! Stream pushes carry no id; their `type` field names the event kind.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StreamError;

/// Request parameters, flattened next to `id` and `command`.
pub type Params = Map<String, Value>;

/// An outbound command.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: u64,
    pub command: String,
    #[serde(flatten)]
    pub params: Params,
}

impl Request {
    pub fn new(id: u64, command: impl Into<String>, params: Params) -> Self {
        Self { id, command: command.into(), params }
    }

    /// Encode as a single text frame.
    pub fn to_frame(&self) -> Result<String, StreamError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Convert a JSON value into request params. `null` means "no params".
pub fn params_from_value(command: &str, value: Value) -> Result<Params, StreamError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Params::new()),
        _ => Err(StreamError::InvalidParams { command: command.to_string() }),
    }
}

/// Closed set of stream event kinds recognised at the routing boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LedgerClosed,
    Transaction,
    ValidationReceived,
    ConsensusPhase,
    ServerStatus,
    PeerStatusChange,
    BookChanges,
    ManifestReceived,
    PathFind,
    /// Unknown `type` values and responses nobody is waiting for.
    Unclassified,
}

impl EventKind {
    /// Map a wire `type` tag to a kind.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ledgerClosed" => Self::LedgerClosed,
            "transaction" => Self::Transaction,
            "validationReceived" => Self::ValidationReceived,
            "consensusPhase" => Self::ConsensusPhase,
            "serverStatus" => Self::ServerStatus,
            "peerStatusChange" => Self::PeerStatusChange,
            "bookChanges" => Self::BookChanges,
            "manifestReceived" => Self::ManifestReceived,
            "path_find" => Self::PathFind,
            _ => Self::Unclassified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LedgerClosed => "ledgerClosed",
            Self::Transaction => "transaction",
            Self::ValidationReceived => "validationReceived",
            Self::ConsensusPhase => "consensusPhase",
            Self::ServerStatus => "serverStatus",
            Self::PeerStatusChange => "peerStatusChange",
            Self::BookChanges => "bookChanges",
            Self::ManifestReceived => "manifestReceived",
            Self::PathFind => "path_find",
            Self::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unsolicited push from the node.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub kind: EventKind,
    /// The full message as received.
    pub payload: Value,
}

impl StreamEvent {
    /// `ledger_index` of the event, if it carries one.
    pub fn ledger_index(&self) -> Option<u64> {
        self.payload.get("ledger_index").and_then(Value::as_u64)
    }
}

/// An inbound frame classified for routing.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Response-shaped message carrying a numeric correlation id.
    Response { id: u64, body: Value },
    Event(StreamEvent),
}

impl InboundMessage {
    /// Parse and classify a text frame.
    pub fn parse(frame: &str) -> Result<Self, StreamError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| StreamError::Protocol(format!("invalid JSON frame: {e}")))?;
        Self::classify(value)
    }

    /// Classify an already-decoded message.
    pub fn classify(value: Value) -> Result<Self, StreamError> {
        if !value.is_object() {
            return Err(StreamError::Protocol("frame is not a JSON object".into()));
        }
        let tag = value.get("type").and_then(Value::as_str);
        let id = value.get("id").and_then(Value::as_u64);

        // Some node versions omit `type` on responses but always send `status`.
        let response_shaped =
            tag == Some("response") || (tag.is_none() && value.get("status").is_some());
        if response_shaped {
            if let Some(id) = id {
                return Ok(Self::Response { id, body: value });
            }
        }

        let kind = tag.map(EventKind::from_tag).unwrap_or(EventKind::Unclassified);
        Ok(Self::Event(StreamEvent { kind, payload: value }))
    }
}

/// Error fields of a failed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    pub error: String,
    pub code: Option<i64>,
    pub message: Option<String>,
}

/// Split a response body into its result or its error fields.
pub fn response_outcome(body: Value) -> Result<Value, RpcFailure> {
    let failed = body.get("status").and_then(Value::as_str) == Some("error")
        || body.get("error").is_some();
    if failed {
        return Err(RpcFailure {
            error: body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            code: body.get("error_code").and_then(Value::as_i64),
            message: body.get("error_message").and_then(Value::as_str).map(String::from),
        });
    }
    match body {
        Value::Object(mut map) => Ok(map.remove("result").unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_is_flat() {
        let mut params = Params::new();
        params.insert("ledger_index".into(), json!(90_000_000));
        let frame = Request::new(4, "book_changes", params).to_frame().unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v, json!({"id": 4, "command": "book_changes", "ledger_index": 90_000_000}));
    }

    #[test]
    fn params_must_be_object() {
        assert!(params_from_value("server_info", Value::Null).unwrap().is_empty());
        assert!(params_from_value("server_info", json!({"a": 1})).is_ok());
        assert!(matches!(
            params_from_value("server_info", json!([1, 2])),
            Err(StreamError::InvalidParams { .. })
        ));
    }

    #[test]
    fn classify_response() {
        let frame = r#"{"id":3,"status":"success","type":"response","result":{"info":{}}}"#;
        let msg = InboundMessage::parse(frame).unwrap();
        assert!(matches!(msg, InboundMessage::Response { id: 3, .. }));
    }

    #[test]
    fn classify_ledger_closed() {
        let msg = InboundMessage::parse(r#"{"type":"ledgerClosed","ledger_index":100}"#).unwrap();
        match msg {
            InboundMessage::Event(ev) => {
                assert_eq!(ev.kind, EventKind::LedgerClosed);
                assert_eq!(ev.ledger_index(), Some(100));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_unclassified() {
        let msg = InboundMessage::parse(r#"{"type":"somethingNew"}"#).unwrap();
        assert!(matches!(
            msg,
            InboundMessage::Event(StreamEvent { kind: EventKind::Unclassified, .. })
        ));
    }

    #[test]
    fn response_without_id_is_unclassified() {
        let frame = r#"{"type":"response","status":"error","error":"badSyntax"}"#;
        let msg = InboundMessage::parse(frame).unwrap();
        assert!(matches!(
            msg,
            InboundMessage::Event(StreamEvent { kind: EventKind::Unclassified, .. })
        ));
    }

    #[test]
    fn malformed_frame_is_protocol_error() {
        assert!(matches!(InboundMessage::parse("not json"), Err(StreamError::Protocol(_))));
        assert!(matches!(InboundMessage::parse("[1,2]"), Err(StreamError::Protocol(_))));
    }

    #[test]
    fn outcome_success_and_error() {
        let ok = response_outcome(json!({"id":1,"status":"success","result":{"changes":[]}}))
            .unwrap();
        assert_eq!(ok, json!({"changes": []}));

        let err = response_outcome(json!({
            "id": 2, "status": "error", "error": "actMalformed",
            "error_code": 35, "error_message": "Account malformed."
        }))
        .unwrap_err();
        assert_eq!(err.error, "actMalformed");
        assert_eq!(err.code, Some(35));
        assert_eq!(err.message.as_deref(), Some("Account malformed."));
    }
}
