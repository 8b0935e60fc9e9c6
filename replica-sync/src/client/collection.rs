//! Client-side cache of one collection.

use std::collections::BTreeMap;

use replica_core::{evaluate, Document, QueryOutput};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    /// Never replicated to a server
    local: bool,
    docs: BTreeMap<String, Document>,
}

impl Collection {
    pub fn new(name: impl Into<String>, local: bool) -> Self {
        Self {
            name: name.into(),
            local,
            docs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Current state of a document, with `_id`.
    pub fn get(&self, doc_id: &str) -> Option<Value> {
        self.docs.get(doc_id)?.get()
    }

    pub fn doc(&self, doc_id: &str) -> Option<&Document> {
        self.docs.get(doc_id)
    }

    pub(crate) fn doc_mut(&mut self, doc_id: &str) -> &mut Document {
        self.docs
            .entry(doc_id.to_string())
            .or_insert_with(|| Document::new(self.name.clone(), doc_id))
    }

    pub fn docs(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    /// States of every live document.
    pub fn snapshots(&self) -> Vec<Value> {
        self.docs.values().filter_map(Document::get).collect()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn evaluate(&self, expression: &Value) -> QueryOutput {
        evaluate(expression, self.snapshots())
    }

    /// Drop cached documents, except those `keep` selects.
    pub(crate) fn purge(&mut self, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.docs.len();
        self.docs.retain(|id, _| keep(id));
        before - self.docs.len()
    }
}
