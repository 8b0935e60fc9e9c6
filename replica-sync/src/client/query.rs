//! Client query handles.

use replica_core::query::join_refs;
use replica_core::{query_hash, QueryOutput};
use serde_json::Value;

use super::{await_ack, Model, ModelError};

/// How a query is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// Local collection; evaluated over the cache only
    Local,
    /// Evaluated by the server
    Remote,
    /// References fields of other documents; those are kept in sync and
    /// substituted before the query goes to the server
    Join,
}

/// A query over one collection.
///
/// Subscriptions are reference counted per `(collection, expression)`, so
/// several handles for the same query share one server subscription.
#[derive(Clone)]
pub struct Query {
    model: Model,
    collection_name: String,
    expression: Value,
    strategy: QueryStrategy,
    hash: String,
}

impl Query {
    pub(crate) fn new(model: Model, collection_name: &str, expression: Value) -> Self {
        let strategy = model.query_strategy(collection_name, &expression);
        Self {
            hash: query_hash(collection_name, &expression),
            model,
            collection_name: collection_name.to_string(),
            expression,
            strategy,
        }
    }

    pub fn strategy(&self) -> QueryStrategy {
        self.strategy
    }

    /// Identifies this query in [`ModelEvent::QueryChange`](super::ModelEvent::QueryChange).
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    /// One-shot: ask the server (when connected) and return the result.
    pub async fn fetch(&self) -> Result<QueryOutput, ModelError> {
        if self.strategy == QueryStrategy::Join {
            for r in join_refs(&self.expression) {
                self.model.fetch_doc(&r.collection_name, &r.doc_id).await?;
            }
        }
        if let Some(request) = self
            .model
            .open_query(&self.collection_name, &self.expression, self.strategy, false)
        {
            await_ack(request).await?;
        }
        Ok(self.get())
    }

    /// Keep the result live. Offline, the subscription is recorded and sent
    /// with the next handshake.
    pub async fn subscribe(&self) -> Result<(), ModelError> {
        if self.strategy == QueryStrategy::Join {
            for r in join_refs(&self.expression) {
                self.model.subscribe_doc(&r.collection_name, &r.doc_id).await?;
            }
        }
        if let Some(request) = self
            .model
            .open_query(&self.collection_name, &self.expression, self.strategy, true)
        {
            await_ack(request).await?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self) -> Result<(), ModelError> {
        if !self.model.close_query(&self.collection_name, &self.expression) {
            return Err(ModelError::UnknownQuery);
        }
        if self.strategy == QueryStrategy::Join {
            for r in join_refs(&self.expression) {
                self.model.unsubscribe_doc(&r.collection_name, &r.doc_id);
            }
        }
        Ok(())
    }

    /// Current result, without touching the network.
    pub fn get(&self) -> QueryOutput {
        self.model.query_output(&self.collection_name, &self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ModelOptions;
    use serde_json::json;

    #[tokio::test]
    async fn test_strategy_selection() {
        let model = Model::new(ModelOptions::default());
        assert_eq!(model.query("_local", json!({})).strategy(), QueryStrategy::Local);
        assert_eq!(model.query("users", json!({"age": 3})).strategy(), QueryStrategy::Remote);
        assert_eq!(
            model.query("posts", json!({"author": "$users.1.name"})).strategy(),
            QueryStrategy::Join
        );
    }

    #[tokio::test]
    async fn test_offline_query_evaluates_cache() {
        let model = Model::new(ModelOptions::default());
        model.add("users", "1", json!({"age": 30})).await.unwrap();
        model.add("users", "2", json!({"age": 10})).await.unwrap();

        let adults = model.query("users", json!({"age": {"$gte": 18}}));
        adults.subscribe().await.unwrap();
        assert_eq!(adults.get().ids(), vec!["1"]);
        assert_eq!(adults.fetch().await.unwrap().ids(), vec!["1"]);
        adults.unsubscribe().unwrap();
        assert!(matches!(adults.unsubscribe(), Err(ModelError::UnknownQuery)));
    }

    #[tokio::test]
    async fn test_join_resolves_from_cache() {
        let model = Model::new(ModelOptions::default());
        model.add("users", "1", json!({"name": "ann"})).await.unwrap();
        model.add("posts", "a", json!({"author": "ann"})).await.unwrap();
        model.add("posts", "b", json!({"author": "bob"})).await.unwrap();

        let posts = model.query("posts", json!({"author": "$users.1.name"}));
        posts.subscribe().await.unwrap();
        assert_eq!(posts.get().ids(), vec!["a"]);

        model.set("users", "1", Some("name"), json!("bob")).await.unwrap();
        assert_eq!(posts.get().ids(), vec!["b"]);
    }
}
