//! Immutable, timestamped mutation records.
//!
//! Every change to a document is expressed as an [`Operation`]. Operations are
//! created once by a writer, never mutated, and replicated verbatim.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Operation kinds.
///
/// Serialized in camelCase; the name doubles as the wire message `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpKind {
    /// Replace the whole document
    Add,
    /// Replace the document or deep-set a field
    Set,
    /// Logically delete the document or deep-delete a field
    Del,
    /// Add a number to a field
    Increment,
    /// Insert text into a string field
    StringInsert,
    /// Remove characters from a string field
    StringRemove,
    /// Set a string field to a target value
    StringDiff,
    /// Append to an array field
    Push,
    /// Remove the last array element
    Pop,
    /// Insert elements at an array index
    Insert,
    /// Remove elements at an array index
    Remove,
    /// Move a run of array elements
    Move,
    /// Swap two array elements
    Swap,
    /// Set an array field to a target value
    ArrayDiff,
}

impl OpKind {
    pub const ALL: [OpKind; 14] = [
        OpKind::Add,
        OpKind::Set,
        OpKind::Del,
        OpKind::Increment,
        OpKind::StringInsert,
        OpKind::StringRemove,
        OpKind::StringDiff,
        OpKind::Push,
        OpKind::Pop,
        OpKind::Insert,
        OpKind::Remove,
        OpKind::Move,
        OpKind::Swap,
        OpKind::ArrayDiff,
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Set => "set",
            OpKind::Del => "del",
            OpKind::Increment => "increment",
            OpKind::StringInsert => "stringInsert",
            OpKind::StringRemove => "stringRemove",
            OpKind::StringDiff => "stringDiff",
            OpKind::Push => "push",
            OpKind::Pop => "pop",
            OpKind::Insert => "insert",
            OpKind::Remove => "remove",
            OpKind::Move => "move",
            OpKind::Swap => "swap",
            OpKind::ArrayDiff => "arrayDiff",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Kinds whose effect fully replaces the value at their path.
    pub fn overwrites(&self) -> bool {
        matches!(
            self,
            OpKind::Add | OpKind::Set | OpKind::Del | OpKind::StringDiff | OpKind::ArrayDiff
        )
    }
}

/// A single replicated mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Globally unique, generated by the writer
    pub id: String,
    /// Writer identity, stable per client instance
    pub source: String,
    /// Writer-local timestamp in milliseconds, strictly increasing per source
    pub date: u64,
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub collection_name: String,
    pub doc_id: String,
    /// Dot-path into the document; `None` targets the whole document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Position for string/array edits (source index for `move`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub how_many: Option<usize>,
    /// Destination for `move` and `swap`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<usize>,
}

impl Operation {
    /// Create an operation with a fresh id.
    pub fn new(
        kind: OpKind,
        source: impl Into<String>,
        date: u64,
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            date,
            kind,
            collection_name: collection_name.into(),
            doc_id: doc_id.into(),
            field: None,
            value: None,
            index: None,
            how_many: None,
            to: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_how_many(mut self, how_many: usize) -> Self {
        self.how_many = Some(how_many);
        self
    }

    pub fn with_to(mut self, to: usize) -> Self {
        self.to = Some(to);
        self
    }

    /// Override the generated id (replays and tests).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Same operation addressed to another collection.
    pub fn renamed(&self, collection_name: &str) -> Self {
        Self {
            collection_name: collection_name.to_string(),
            ..self.clone()
        }
    }

    /// Total order used when folding a document's log:
    /// `(date, add first, source, id)`.
    pub fn fold_order(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| {
                let a = self.kind != OpKind::Add;
                let b = other.kind != OpKind::Add;
                a.cmp(&b)
            })
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a writer identity. Contains no spaces or `|`, so it is safe
/// inside serialized version vectors.
pub fn new_source_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Strictly increasing per-source clock, skew-corrected against a server.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    offset: i64,
    last: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp; never repeats a previous value.
    pub fn next(&mut self) -> u64 {
        let corrected = (now_ms() as i64).saturating_add(self.offset).max(0) as u64;
        let date = corrected.max(self.last + 1);
        self.last = date;
        date
    }

    /// Record the offset between server time and local time.
    pub fn set_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Make sure later timestamps sort after `date`.
    pub fn observe(&mut self, date: u64) {
        self.last = self.last.max(date);
    }
}
