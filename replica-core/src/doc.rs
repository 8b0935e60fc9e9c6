//! Document state machine.
//!
//! A [`Document`] owns its operation log and derives `state` as the left fold
//! of that log in [`Operation::fold_order`]. Nothing else mutates the log.
//!
//! ```text
//!   ops (sorted by date, add-first, source, id)
//!     │
//!     ├── fold ──────► state / deleted
//!     ├── distill ───► smaller log, same state
//!     └── version ───► "source date|source date"
//! ```

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::op::{OpKind, Operation};
use crate::value::{add_numbers, covers, del_path, get_path, get_path_mut, has_index_segment, set_path};
use crate::version::VersionVector;

/// Key under which a document's id is exposed by [`Document::get`].
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    collection_name: String,
    doc_id: String,
    ops: Vec<Operation>,
    state: Option<Value>,
    deleted: bool,
}

impl Document {
    pub fn new(collection_name: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection_name: collection_name.into(),
            doc_id: doc_id.into(),
            ops: Vec::new(),
            state: None,
            deleted: false,
        }
    }

    /// Build a document from an unordered set of operations.
    pub fn from_ops(
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        ops: impl IntoIterator<Item = Operation>,
    ) -> Self {
        let mut doc = Self::new(collection_name, doc_id);
        doc.apply_ops(ops);
        doc
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn has_op(&self, op_id: &str) -> bool {
        self.ops.iter().any(|o| o.id == op_id)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// `true` once the document has a live state.
    pub fn exists(&self) -> bool {
        self.state.is_some() && !self.deleted
    }

    /// Current state with `_id` attached; `None` if absent or deleted.
    pub fn get(&self) -> Option<Value> {
        if self.deleted {
            return None;
        }
        let mut state = self.state.clone()?;
        if let Value::Object(map) = &mut state {
            map.insert(ID_FIELD.to_string(), Value::String(self.doc_id.clone()));
        }
        Some(state)
    }

    /// Value at a dot-path of the current state.
    pub fn get_field(&self, path: &str) -> Option<Value> {
        if path == ID_FIELD {
            return self.exists().then(|| Value::String(self.doc_id.clone()));
        }
        if self.deleted {
            return None;
        }
        self.state.as_ref().and_then(|s| get_path(s, path)).cloned()
    }

    /// Append an operation. Returns `false` for a duplicate id.
    ///
    /// In-order arrivals fold incrementally; out-of-order arrivals refold the
    /// whole log.
    pub fn apply_op(&mut self, op: Operation) -> bool {
        if self.has_op(&op.id) {
            return false;
        }
        let pos = self
            .ops
            .partition_point(|o| o.fold_order(&op) != std::cmp::Ordering::Greater);
        if pos == self.ops.len() {
            fold(&mut self.state, &mut self.deleted, &op);
            self.ops.push(op);
        } else {
            self.ops.insert(pos, op);
            self.refresh_state();
        }
        true
    }

    /// Apply many operations; returns how many were new.
    pub fn apply_ops(&mut self, ops: impl IntoIterator<Item = Operation>) -> usize {
        ops.into_iter().filter(|op| self.apply_op(op.clone())).count()
    }

    /// Drop an operation from the log (rollback) and refold.
    pub fn remove_op(&mut self, op_id: &str) -> Option<Operation> {
        let pos = self.ops.iter().position(|o| o.id == op_id)?;
        let op = self.ops.remove(pos);
        self.refresh_state();
        Some(op)
    }

    /// Recompute `state` from scratch.
    pub fn refresh_state(&mut self) {
        self.state = None;
        self.deleted = false;
        for op in &self.ops {
            fold(&mut self.state, &mut self.deleted, op);
        }
    }

    /// Compact the log without changing `state`.
    ///
    /// Walks newest-first. `add` and whole-document `del` are always kept.
    /// Any other op is dropped when a newer overwrite owns its path or an
    /// ancestor of it. Overwrites through array indexes never take ownership,
    /// since a positional edit in between can shift what the index points at.
    /// A field `del` never takes ownership either: the ops before it may have
    /// revived the document or created the parents it leaves behind.
    pub fn distill(&mut self) -> usize {
        let before = self.ops.len();
        let mut seen = HashSet::new();
        let mut owned: Vec<String> = Vec::new();
        let mut root_owned = false;
        let mut kept = Vec::with_capacity(self.ops.len());

        for op in self.ops.iter().rev() {
            if !seen.insert(op.id.as_str()) {
                continue;
            }
            let always = op.kind == OpKind::Add || (op.kind == OpKind::Del && op.field.is_none());
            let is_owned = root_owned
                || op
                    .field
                    .as_deref()
                    .is_some_and(|p| owned.iter().any(|o| covers(o, p)));
            if is_owned && !always {
                continue;
            }
            kept.push(op.clone());
            if op.kind.overwrites() {
                match op.field.as_deref() {
                    None => root_owned = true,
                    Some(_) if op.kind == OpKind::Del => {}
                    Some(p) if !has_index_segment(p) => owned.push(p.to_string()),
                    Some(_) => {}
                }
            }
        }
        kept.reverse();
        self.ops = kept;
        let dropped = before - self.ops.len();
        if dropped > 0 {
            log::trace!(
                "distilled {}/{}: dropped {} of {} ops",
                self.collection_name,
                self.doc_id,
                dropped,
                before
            );
        }
        dropped
    }

    /// `source → latest date` over the current log.
    pub fn version(&self) -> VersionVector {
        VersionVector::from_ops(&self.ops)
    }

    /// Operations the holder of `version` has not seen yet.
    pub fn ops_to_send(&self, version: &VersionVector) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|op| !version.covers(op))
            .cloned()
            .collect()
    }
}

fn strip_id(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.remove(ID_FIELD);
    }
    value
}

/// Live state to edit; a missing or deleted document is revived as `{}`.
fn revive<'a>(state: &'a mut Option<Value>, deleted: &mut bool) -> &'a mut Value {
    if *deleted {
        *state = None;
        *deleted = false;
    }
    state.get_or_insert_with(|| Value::Object(Map::new()))
}

/// Mutable target at `field` (the root when `None`), created with `init` if missing.
fn target<'a>(root: &'a mut Value, field: Option<&str>, init: Value) -> Option<&'a mut Value> {
    match field {
        None => Some(root),
        Some(path) => {
            if get_path(root, path).is_none() {
                set_path(root, path, init);
            }
            get_path_mut(root, path)
        }
    }
}

fn fold(state: &mut Option<Value>, deleted: &mut bool, op: &Operation) {
    let field = op.field.as_deref();
    match op.kind {
        OpKind::Add => {
            *state = Some(strip_id(op.value.clone().unwrap_or_else(|| Value::Object(Map::new()))));
            *deleted = false;
        }
        OpKind::Set | OpKind::StringDiff | OpKind::ArrayDiff => {
            let value = op.value.clone().unwrap_or(Value::Null);
            match field {
                None => {
                    *state = Some(strip_id(value));
                    *deleted = false;
                }
                Some(path) => set_path(revive(state, deleted), path, value),
            }
        }
        OpKind::Del => match field {
            None => {
                *state = None;
                *deleted = true;
            }
            Some(path) => {
                if let (Some(s), false) = (state.as_mut(), *deleted) {
                    del_path(s, path);
                }
            }
        },
        OpKind::Increment => {
            let root = revive(state, deleted);
            let by = op.value.clone().unwrap_or_else(|| Value::from(1));
            let current = match field {
                None => Some(&*root),
                Some(path) => get_path(root, path),
            };
            let next = add_numbers(current, &by);
            match field {
                None => *root = next,
                Some(path) => set_path(root, path, next),
            }
        }
        OpKind::StringInsert | OpKind::StringRemove => {
            let root = revive(state, deleted);
            let Some(Value::String(text)) = target(root, field, Value::String(String::new())) else {
                return;
            };
            let mut chars: Vec<char> = text.chars().collect();
            let index = op.index.unwrap_or(0).min(chars.len());
            if op.kind == OpKind::StringInsert {
                let insert = match &op.value {
                    Some(Value::String(s)) => s.clone(),
                    _ => return,
                };
                chars.splice(index..index, insert.chars());
            } else {
                let end = index.saturating_add(op.how_many.unwrap_or(1)).min(chars.len());
                chars.drain(index..end);
            }
            *text = chars.into_iter().collect();
        }
        OpKind::Push | OpKind::Pop | OpKind::Insert | OpKind::Remove | OpKind::Move | OpKind::Swap => {
            let root = revive(state, deleted);
            let Some(Value::Array(items)) = target(root, field, Value::Array(Vec::new())) else {
                return;
            };
            apply_array_edit(items, op);
        }
    }
}

fn apply_array_edit(items: &mut Vec<Value>, op: &Operation) {
    match op.kind {
        OpKind::Push => items.push(op.value.clone().unwrap_or(Value::Null)),
        OpKind::Pop => {
            items.pop();
        }
        OpKind::Insert => {
            let index = op.index.unwrap_or(items.len()).min(items.len());
            let values = match op.value.clone() {
                Some(Value::Array(values)) => values,
                Some(v) => vec![v],
                None => Vec::new(),
            };
            items.splice(index..index, values);
        }
        OpKind::Remove => {
            let start = op.index.unwrap_or(0).min(items.len());
            let end = start.saturating_add(op.how_many.unwrap_or(1)).min(items.len());
            items.drain(start..end);
        }
        OpKind::Move => {
            let from = op.index.unwrap_or(0);
            if from >= items.len() {
                return;
            }
            let end = from.saturating_add(op.how_many.unwrap_or(1)).min(items.len());
            let moved: Vec<Value> = items.drain(from..end).collect();
            let to = op.to.unwrap_or(0).min(items.len());
            items.splice(to..to, moved);
        }
        OpKind::Swap => {
            let (a, b) = (op.index.unwrap_or(0), op.to.unwrap_or(0));
            if a < items.len() && b < items.len() {
                items.swap(a, b);
            }
        }
        _ => {}
    }
}
