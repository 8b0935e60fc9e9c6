//! Field-restricted views of a base collection.
//!
//! A [`Projection`] named `users` over base `auths` with spec
//! `{"_id": true, "email": true}` exposes only `email`. Inbound operations are
//! validated and renamed to the base collection; outbound operations and
//! snapshots are filtered and renamed back. Fields are matched on their first
//! path segment, and `_id` is always visible.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{Map, Value};

use crate::doc::ID_FIELD;
use crate::op::{OpKind, Operation};
use crate::query::returns_docs;
use crate::value::segments;

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionError {
    /// Field outside the projection was written or queried
    FieldNotAllowed { field: String },
    /// Operation targets the whole document in a way that would touch hidden fields
    WholeDocumentNotAllowed,
    /// Operation addressed to another collection
    CollectionMismatch,
    /// Spec mixes included and excluded fields, or is not an object
    InvalidSpec(String),
}

impl fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionError::FieldNotAllowed { field } => write!(f, "field {field} is not allowed in projection"),
            ProjectionError::WholeDocumentNotAllowed => write!(f, "whole document operation is not allowed in projection"),
            ProjectionError::CollectionMismatch => write!(f, "operation collection does not match projection"),
            ProjectionError::InvalidSpec(e) => write!(f, "invalid projection spec: {e}"),
        }
    }
}

impl std::error::Error for ProjectionError {}

/// Inclusive or exclusive set of top-level field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSpec {
    Include(BTreeSet<String>),
    Exclude(BTreeSet<String>),
}

impl FieldSpec {
    /// Parse `{"a": true, "b": true}` (inclusive) or `{"c": false}` (exclusive).
    /// `_id` may appear in either form and is ignored.
    pub fn from_value(spec: &Value) -> Result<Self, ProjectionError> {
        let Value::Object(map) = spec else {
            return Err(ProjectionError::InvalidSpec("expected an object".into()));
        };
        let mut include = BTreeSet::new();
        let mut exclude = BTreeSet::new();
        for (field, flag) in map {
            if field == ID_FIELD {
                continue;
            }
            match flag {
                Value::Bool(true) => include.insert(field.clone()),
                Value::Bool(false) => exclude.insert(field.clone()),
                _ => return Err(ProjectionError::InvalidSpec(format!("{field} must be true or false"))),
            };
        }
        match (include.is_empty(), exclude.is_empty()) {
            (false, false) => Err(ProjectionError::InvalidSpec("cannot mix included and excluded fields".into())),
            (_, true) => Ok(FieldSpec::Include(include)),
            (true, false) => Ok(FieldSpec::Exclude(exclude)),
        }
    }

    pub fn allows(&self, path: &str) -> bool {
        let Some(top) = segments(path).next() else {
            return false;
        };
        if top == ID_FIELD {
            return true;
        }
        match self {
            FieldSpec::Include(fields) => fields.contains(top),
            FieldSpec::Exclude(fields) => !fields.contains(top),
        }
    }

    /// Keep only visible top-level keys of an object value.
    pub fn filter(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| self.allows(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<_, _>>(),
            ),
            other => other.clone(),
        }
    }

    fn signature(&self) -> String {
        let (sign, fields) = match self {
            FieldSpec::Include(f) => ('+', f),
            FieldSpec::Exclude(f) => ('-', f),
        };
        fields.iter().map(|f| format!("{sign}{f}")).collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub collection_name: String,
    pub base_collection_name: String,
    pub fields: FieldSpec,
}

impl Projection {
    pub fn new(
        collection_name: impl Into<String>,
        base_collection_name: impl Into<String>,
        spec: &Value,
    ) -> Result<Self, ProjectionError> {
        Ok(Self {
            collection_name: collection_name.into(),
            base_collection_name: base_collection_name.into(),
            fields: FieldSpec::from_value(spec)?,
        })
    }

    /// Signature that changes whenever the visible field set changes.
    pub fn hash(&self) -> String {
        format!("{}:{}:{}", self.collection_name, self.base_collection_name, self.fields.signature())
    }

    /// Check an inbound operation addressed to the projection.
    ///
    /// A whole-document `set` would drop hidden fields and is refused. A
    /// whole-document `add` passes here but may only create the base
    /// document; the store refuses it once the document exists.
    pub fn validate_op(&self, op: &Operation) -> Result<(), ProjectionError> {
        if op.collection_name != self.collection_name {
            return Err(ProjectionError::CollectionMismatch);
        }
        match op.field.as_deref() {
            Some(field) if self.fields.allows(field) => Ok(()),
            Some(field) => Err(ProjectionError::FieldNotAllowed { field: field.to_string() }),
            None => match (op.kind, &op.value) {
                (OpKind::Add, Some(Value::Object(map))) => {
                    match map.keys().find(|k| !self.fields.allows(k)) {
                        Some(field) => Err(ProjectionError::FieldNotAllowed { field: field.clone() }),
                        None => Ok(()),
                    }
                }
                (OpKind::Add, None) => Ok(()),
                _ => Err(ProjectionError::WholeDocumentNotAllowed),
            },
        }
    }

    /// Validate and rename an inbound operation to the base collection.
    pub fn to_base_op(&self, op: &Operation) -> Result<Operation, ProjectionError> {
        self.validate_op(op)?;
        Ok(op.renamed(&self.base_collection_name))
    }

    /// Filter and rename an outbound base operation. `None` if nothing of it
    /// is visible.
    pub fn project_op(&self, op: &Operation) -> Option<Operation> {
        let mut projected = op.renamed(&self.collection_name);
        match op.field.as_deref() {
            Some(field) => self.fields.allows(field).then_some(projected),
            None => match op.kind {
                OpKind::Add | OpKind::Set => {
                    projected.value = op.value.as_ref().map(|v| self.fields.filter(v));
                    Some(projected)
                }
                OpKind::Del => Some(projected),
                _ => None,
            },
        }
    }

    pub fn project_ops<'a>(&self, ops: impl IntoIterator<Item = &'a Operation>) -> Vec<Operation> {
        ops.into_iter().filter_map(|op| self.project_op(op)).collect()
    }

    /// Filter a document snapshot.
    pub fn project_state(&self, state: &Value) -> Value {
        self.fields.filter(state)
    }

    /// Reject queries that filter, sort or aggregate on hidden fields.
    pub fn validate_expression(&self, expression: &Value) -> Result<(), ProjectionError> {
        let mut fields = Vec::new();
        referenced_fields(expression, &mut fields);
        match fields.into_iter().find(|f| !self.fields.allows(f)) {
            Some(field) => Err(ProjectionError::FieldNotAllowed { field }),
            None => Ok(()),
        }
    }

    /// Filter a query result: documents are projected, aggregates pass.
    pub fn project_result(&self, expression: &Value, docs: Vec<Value>) -> Vec<Value> {
        if returns_docs(expression) {
            docs.iter().map(|d| self.project_state(d)).collect()
        } else {
            docs
        }
    }
}

/// Field paths an expression reads.
fn referenced_fields(expression: &Value, out: &mut Vec<String>) {
    let Value::Object(map) = expression else {
        return;
    };
    for (key, cond) in map {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                for sub in cond.as_array().into_iter().flatten() {
                    referenced_fields(sub, out);
                }
            }
            "$orderby" => match cond {
                Value::Object(keys) => out.extend(keys.keys().cloned()),
                Value::Array(pairs) => out.extend(pairs.iter().filter_map(|p| {
                    p.as_str()
                        .or_else(|| p.as_array().and_then(|a| a.first()).and_then(Value::as_str))
                        .map(str::to_string)
                })),
                Value::String(f) => out.push(f.clone()),
                _ => {}
            },
            "$distinct" => out.extend(cond.as_str().map(str::to_string)),
            "$aggregate" => {
                for spec in cond.as_object().into_iter().flat_map(|m| m.values()) {
                    for field in spec.as_object().into_iter().flat_map(|m| m.values()) {
                        out.extend(field.as_str().map(str::to_string));
                    }
                }
            }
            k if k.starts_with('$') => {}
            field => out.push(field.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> Projection {
        Projection::new("users", "auths", &json!({"_id": true, "email": true})).unwrap()
    }

    #[test]
    fn test_spec_parsing() {
        assert!(matches!(
            FieldSpec::from_value(&json!({"a": true, "b": false})),
            Err(ProjectionError::InvalidSpec(_))
        ));
        let ex = FieldSpec::from_value(&json!({"password": false})).unwrap();
        assert!(ex.allows("email"));
        assert!(!ex.allows("password.hash"));
        assert!(ex.allows("_id"));
    }

    #[test]
    fn test_validate_inbound() {
        let p = users();
        let ok = Operation::new(OpKind::Set, "s", 1, "users", "1")
            .with_field("email")
            .with_value(json!("a@b.c"));
        let base = p.to_base_op(&ok).unwrap();
        assert_eq!(base.collection_name, "auths");
        assert_eq!(base.id, ok.id);

        let bad = Operation::new(OpKind::Set, "s", 2, "users", "1")
            .with_field("age")
            .with_value(json!(20));
        assert_eq!(
            p.validate_op(&bad),
            Err(ProjectionError::FieldNotAllowed { field: "age".into() })
        );

        let add_hidden = Operation::new(OpKind::Add, "s", 3, "users", "2").with_value(json!({"email": "x", "age": 1}));
        assert!(p.validate_op(&add_hidden).is_err());
        let del = Operation::new(OpKind::Del, "s", 4, "users", "2");
        assert_eq!(p.validate_op(&del), Err(ProjectionError::WholeDocumentNotAllowed));
        let replace = Operation::new(OpKind::Set, "s", 6, "users", "2").with_value(json!({"email": "x"}));
        assert_eq!(p.validate_op(&replace), Err(ProjectionError::WholeDocumentNotAllowed));
        let create = Operation::new(OpKind::Add, "s", 7, "users", "3").with_value(json!({"email": "x"}));
        assert!(p.validate_op(&create).is_ok());
        let other = Operation::new(OpKind::Set, "s", 5, "auths", "2").with_field("email");
        assert_eq!(p.validate_op(&other), Err(ProjectionError::CollectionMismatch));
    }

    #[test]
    fn test_project_outbound() {
        let p = users();
        let add = Operation::new(OpKind::Add, "s", 1, "auths", "1")
            .with_value(json!({"email": "a@b.c", "password": "x", "age": 3}));
        let projected = p.project_op(&add).unwrap();
        assert_eq!(projected.collection_name, "users");
        assert_eq!(projected.value, Some(json!({"email": "a@b.c"})));

        let hidden = Operation::new(OpKind::Set, "s", 2, "auths", "1").with_field("age").with_value(json!(4));
        assert!(p.project_op(&hidden).is_none());
        assert_eq!(p.project_ops([&add, &hidden]).len(), 1);
        assert_eq!(
            p.project_state(&json!({"_id": "1", "email": "e", "age": 3})),
            json!({"_id": "1", "email": "e"})
        );
    }

    #[test]
    fn test_validate_expression() {
        let p = users();
        assert!(p.validate_expression(&json!({"email": "x", "$orderby": {"_id": 1}})).is_ok());
        assert!(p.validate_expression(&json!({"$or": [{"age": 3}]})).is_err());
        assert!(p.validate_expression(&json!({"$aggregate": {"a": {"$max": "age"}}})).is_err());
    }

    #[test]
    fn test_hash_changes_with_fields() {
        let a = users();
        let b = Projection::new("users", "auths", &json!({"email": true, "name": true})).unwrap();
        assert_ne!(a.hash(), b.hash());
        let c = Projection::new("users", "auths", &json!({"email": true, "_id": true})).unwrap();
        assert_eq!(a.hash(), c.hash());
    }
}
