//! JSON wire protocol.
//!
//! Every frame is one JSON object with a `type` field:
//!
//! ```text
//! date / ackdate                      clock sync
//! fetch / sub / unsub / sync          document protocol
//! qfetch / qsub / qunsub / qsync      query protocol
//! q / qdiff                           query snapshot / id-list diff
//! ack                                 reply to a request id or an op id
//! handshake / projections             reconnect resync
//! add / set / del / increment / ...   replicated operations
//! ```

use std::collections::BTreeMap;

use replica_core::{IdDiff, Operation, VersionVector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Op(Operation),
    Control(Control),
}

/// Non-operation messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Control {
    /// Client local time
    Date { id: String, value: u64 },
    /// Server time in reply to `date`
    Ackdate { id: String, value: u64 },
    Fetch(DocRequest),
    Sub(DocRequest),
    Unsub(DocRequest),
    Sync(DocRequest),
    Qfetch(QueryRequest),
    Qsub(QueryRequest),
    Qunsub(QueryRequest),
    Qsync(QueryRequest),
    Q(QuerySnapshot),
    Qdiff(QueryDiff),
    Ack(Ack),
    Handshake(Handshake),
    /// Current projection hashes, sent first in reply to a handshake
    Projections { hashes: BTreeMap<String, String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub collection_name: String,
    pub doc_id: String,
    /// What the requester already has
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub collection_name: String,
    pub expression: Value,
    /// Versions of result documents the requester already holds
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub doc_versions: BTreeMap<String, VersionVector>,
}

/// Full query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySnapshot {
    pub collection_name: String,
    pub expression: Value,
    /// Id list for document queries, the value itself for aggregates
    pub value: Value,
    /// Operations of result documents the receiver is missing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<Operation>,
}

/// Incremental query result change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDiff {
    pub collection_name: String,
    pub expression: Value,
    pub diffs: Vec<IdDiff>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<Operation>,
}

/// Reply to a request (`id`) or an operation (`op_id`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reconnect resync request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub id: String,
    #[serde(default)]
    pub docs: Vec<HandshakeDoc>,
    #[serde(default)]
    pub queries: Vec<QueryRequest>,
    /// Projection hashes the client cached data under
    #[serde(default)]
    pub projection_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeDoc {
    pub collection_name: String,
    pub doc_id: String,
    pub version: VersionVector,
    /// Operations the server has not acknowledged yet
    #[serde(default)]
    pub ops: Vec<Operation>,
    /// Keep receiving updates for this document
    #[serde(default)]
    pub subscribed: bool,
}

impl Message {
    pub fn ack(id: impl Into<String>, value: Option<Value>) -> Self {
        Message::Control(Control::Ack(Ack {
            id: Some(id.into()),
            value,
            ..Ack::default()
        }))
    }

    pub fn ack_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Message::Control(Control::Ack(Ack {
            id: Some(id.into()),
            error: Some(error.into()),
            ..Ack::default()
        }))
    }

    /// Acknowledge an operation; `error` marks it rejected.
    pub fn ack_op(op_id: impl Into<String>, error: Option<String>) -> Self {
        Message::Control(Control::Ack(Ack {
            op_id: Some(op_id.into()),
            error,
            ..Ack::default()
        }))
    }

    /// Wire name of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Op(op) => op.kind.as_str(),
            Message::Control(c) => match c {
                Control::Date { .. } => "date",
                Control::Ackdate { .. } => "ackdate",
                Control::Fetch(_) => "fetch",
                Control::Sub(_) => "sub",
                Control::Unsub(_) => "unsub",
                Control::Sync(_) => "sync",
                Control::Qfetch(_) => "qfetch",
                Control::Qsub(_) => "qsub",
                Control::Qunsub(_) => "qunsub",
                Control::Qsync(_) => "qsync",
                Control::Q(_) => "q",
                Control::Qdiff(_) => "qdiff",
                Control::Ack(_) => "ack",
                Control::Handshake(_) => "handshake",
                Control::Projections { .. } => "projections",
            },
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl From<Operation> for Message {
    fn from(op: Operation) -> Self {
        Message::Op(op)
    }
}

impl From<Control> for Message {
    fn from(control: Control) -> Self {
        Message::Control(control)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::DeserializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::OpKind;
    use serde_json::json;

    #[test]
    fn test_operation_frame() {
        let op = Operation::new(OpKind::Set, "s1", 3, "users", "1")
            .with_field("name")
            .with_value(json!("Petr"));
        let text = Message::from(op.clone()).encode().unwrap();
        let decoded = Message::decode(&text).unwrap();
        assert_eq!(decoded, Message::Op(op));
        assert_eq!(decoded.type_name(), "set");
    }

    #[test]
    fn test_sub_frame_shape() {
        let msg = Message::decode(r#"{"type":"sub","id":"7","collectionName":"users","docId":"1","version":"s1 3"}"#)
            .unwrap();
        let Message::Control(Control::Sub(req)) = msg else {
            panic!("expected sub, got {msg:?}");
        };
        assert_eq!(req.id.as_deref(), Some("7"));
        assert_eq!(req.version.unwrap().get("s1"), Some(3));
    }

    #[test]
    fn test_ack_op_shape() {
        let msg = Message::ack_op("op-1", Some("denied".into()));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "ack", "opId": "op-1", "error": "denied"}));
    }

    #[test]
    fn test_qdiff_shape() {
        let msg = Message::Control(Control::Qdiff(QueryDiff {
            collection_name: "users".into(),
            expression: json!({}),
            diffs: vec![IdDiff::Insert {
                index: 0,
                ids: vec!["1".into()],
            }],
            ops: Vec::new(),
        }));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "qdiff", "collectionName": "users", "expression": {},
                   "diffs": [{"type": "insert", "index": 0, "ids": ["1"]}]})
        );
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(Message::decode(r#"{"type":"bogus"}"#).is_err());
        assert!(Message::decode("not json").is_err());
    }

    #[test]
    fn test_date_frames() {
        let msg = Message::decode(r#"{"type":"date","id":"1","value":1000}"#).unwrap();
        assert_eq!(
            msg,
            Message::Control(Control::Date {
                id: "1".into(),
                value: 1000
            })
        );
    }
}
