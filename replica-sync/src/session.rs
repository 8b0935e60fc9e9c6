//! Per-connection subscription bookkeeping.

use std::collections::{HashMap, HashSet};

use replica_core::VersionVector;

/// What one connection is subscribed to, and which versions it already has.
///
/// Makes repeated `sub`/`unsub` idempotent and lets broadcasts send each
/// connection only the operations it is missing. Documents delivered through
/// query results are known without being subscribed.
#[derive(Debug, Default)]
pub struct ChannelSession {
    versions: HashMap<String, HashMap<String, VersionVector>>,
    subscribed: HashSet<(String, String)>,
    queries: HashSet<String>,
}

impl ChannelSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version the connection is known to hold.
    pub fn doc_version(&self, collection_name: &str, doc_id: &str) -> Option<&VersionVector> {
        self.versions.get(collection_name)?.get(doc_id)
    }

    pub fn is_doc_subscribed(&self, collection_name: &str, doc_id: &str) -> bool {
        self.subscribed
            .contains(&(collection_name.to_string(), doc_id.to_string()))
    }

    /// Record a subscription at the version the client reported. Returns
    /// `false` if it already existed.
    pub fn subscribe_doc(&mut self, collection_name: &str, doc_id: &str, version: VersionVector) -> bool {
        self.versions
            .entry(collection_name.to_string())
            .or_default()
            .insert(doc_id.to_string(), version);
        self.subscribed
            .insert((collection_name.to_string(), doc_id.to_string()))
    }

    /// Merge `version` into what the connection is known to hold.
    pub fn note_doc(&mut self, collection_name: &str, doc_id: &str, version: &VersionVector) {
        self.versions
            .entry(collection_name.to_string())
            .or_default()
            .entry(doc_id.to_string())
            .or_default()
            .merge(version);
    }

    pub fn unsubscribe_doc(&mut self, collection_name: &str, doc_id: &str) -> bool {
        if let Some(docs) = self.versions.get_mut(collection_name) {
            docs.remove(doc_id);
            if docs.is_empty() {
                self.versions.remove(collection_name);
            }
        }
        self.subscribed
            .remove(&(collection_name.to_string(), doc_id.to_string()))
    }

    pub fn has_query(&self, hash: &str) -> bool {
        self.queries.contains(hash)
    }

    pub fn subscribe_query(&mut self, hash: &str) -> bool {
        self.queries.insert(hash.to_string())
    }

    pub fn unsubscribe_query(&mut self, hash: &str) -> bool {
        self.queries.remove(hash)
    }

    /// Every subscribed `(collection, doc_id)`.
    pub fn doc_keys(&self) -> Vec<(String, String)> {
        self.subscribed.iter().cloned().collect()
    }

    pub fn query_hashes(&self) -> Vec<String> {
        self.queries.iter().cloned().collect()
    }

    /// Forget what the connection holds of a collection (projection changed).
    pub fn clear_collection(&mut self, collection_name: &str) {
        self.versions.remove(collection_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut s = ChannelSession::new();
        assert!(s.subscribe_doc("users", "1", VersionVector::new()));
        assert!(!s.subscribe_doc("users", "1", VersionVector::new()));
        assert!(s.is_doc_subscribed("users", "1"));
        assert!(s.unsubscribe_doc("users", "1"));
        assert!(!s.unsubscribe_doc("users", "1"));
        assert!(s.doc_keys().is_empty());
        assert!(s.doc_version("users", "1").is_none());
    }

    #[test]
    fn test_note_merges_without_subscribing() {
        let mut s = ChannelSession::new();
        s.subscribe_doc("users", "1", "a 1".parse().unwrap());
        s.note_doc("users", "1", &"a 5|b 2".parse().unwrap());
        assert_eq!(s.doc_version("users", "1").unwrap().to_string(), "a 5|b 2");

        s.note_doc("users", "2", &"a 5".parse().unwrap());
        assert!(!s.is_doc_subscribed("users", "2"));
        assert_eq!(s.doc_version("users", "2").unwrap().to_string(), "a 5");
    }

    #[test]
    fn test_subscribe_replaces_known_version() {
        let mut s = ChannelSession::new();
        s.note_doc("users", "1", &"a 5".parse().unwrap());
        s.subscribe_doc("users", "1", "a 2".parse().unwrap());
        assert_eq!(s.doc_version("users", "1").unwrap().to_string(), "a 2");
    }

    #[test]
    fn test_queries() {
        let mut s = ChannelSession::new();
        assert!(s.subscribe_query("users:{}"));
        assert!(!s.subscribe_query("users:{}"));
        assert!(s.has_query("users:{}"));
        assert!(s.unsubscribe_query("users:{}"));
        assert!(s.query_hashes().is_empty());
    }
}
