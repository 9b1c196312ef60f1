//! Session manager: session CRUD plus usage and summary bookkeeping.

use codeloom_core::error::StoreError;
use codeloom_core::message::Message;
use codeloom_core::model::ModelCatalog;
use codeloom_core::provider::Usage;
use codeloom_core::session::Session;
use codeloom_core::store::Store;
use std::sync::Arc;
use tracing::{debug, info};

/// Thin layer over the [`Store`] that knows about models and prices.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn Store>,
    catalog: Arc<ModelCatalog>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<ModelCatalog>) -> Self {
        Self { store, catalog }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Create a root session. An empty title is filled in after the first turn.
    pub async fn create(&self, title: impl Into<String>) -> Result<Session, StoreError> {
        let session = self.store.create_session(Session::new(title)).await?;
        info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    /// Create a session owned by `parent`. Delegation passes the tool-call ID
    /// as `id` so a child can be found from the call that spawned it.
    pub async fn create_child(
        &self,
        parent: &str,
        id: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Session, StoreError> {
        let session = self
            .store
            .create_session(Session::child(id, parent, title))
            .await?;
        info!(session_id = %session.id, parent_id = %parent, "Child session created");
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Session, StoreError> {
        self.store.get_session(id).await
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Result<Vec<Session>, StoreError> {
        self.store.list_sessions().await
    }

    pub async fn list_by_parent(&self, parent: &str) -> Result<Vec<Session>, StoreError> {
        self.store.list_child_sessions(parent).await
    }

    pub async fn messages(&self, id: &str) -> Result<Vec<Message>, StoreError> {
        self.store.list_messages(id).await
    }

    pub async fn rename(&self, id: &str, title: impl Into<String>) -> Result<Session, StoreError> {
        let mut session = self.store.get_session(id).await?;
        session.title = title.into();
        self.store.update_session(session).await
    }

    /// Delete a session together with its children and messages.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete_session(id).await?;
        info!(session_id = %id, "Session deleted");
        Ok(())
    }

    /// Make `message_id` the first message the provider sees from now on.
    pub async fn set_summary_anchor(&self, id: &str, message_id: &str) -> Result<Session, StoreError> {
        let mut session = self.store.get_session(id).await?;
        session.summary_message_id = Some(message_id.to_string());
        self.store.update_session(session).await
    }

    /// Add one call's tokens and their price under `model` to the session.
    pub async fn accumulate_usage(
        &self,
        id: &str,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
    ) -> Result<Session, StoreError> {
        let cost = self.catalog.cost(model, Usage::new(input_tokens, output_tokens));
        debug!(session_id = %id, input_tokens, output_tokens, cost, "Accumulating usage");
        self.store
            .accumulate_usage(id, input_tokens, output_tokens, cost)
            .await
    }

    /// Add spend that has no message of its own (titles, sub-agents).
    pub async fn add_cost(&self, id: &str, cost: f64) -> Result<Session, StoreError> {
        self.store.accumulate_usage(id, 0, 0, cost).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeloom_core::model::ModelInfo;
    use codeloom_store::InMemoryStore;

    fn manager() -> SessionManager {
        let catalog = ModelCatalog::empty();
        catalog.register(ModelInfo::new("m", "scripted", 10_000).with_costs(3.0, 15.0));
        SessionManager::new(Arc::new(InMemoryStore::default()), Arc::new(catalog))
    }

    #[tokio::test]
    async fn children_are_listed_by_parent() {
        let sessions = manager();
        let parent = sessions.create("parent").await.unwrap();
        sessions.create_child(&parent.id, "call_1", "child a").await.unwrap();
        sessions.create_child(&parent.id, "call_2", "child b").await.unwrap();

        let children = sessions.list_by_parent(&parent.id).await.unwrap();
        let ids: Vec<_> = children.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["call_1", "call_2"]);
        assert!(children.iter().all(|s| s.parent_id.as_deref() == Some(parent.id.as_str())));
    }

    #[tokio::test]
    async fn child_of_missing_parent_fails() {
        let sessions = manager();
        let err = sessions.create_child("nope", "c1", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn usage_is_priced_from_the_catalog() {
        let sessions = manager();
        let s = sessions.create("t").await.unwrap();
        sessions.accumulate_usage(&s.id, 1_000_000, 0, "m").await.unwrap();
        let s = sessions.accumulate_usage(&s.id, 0, 1_000_000, "m").await.unwrap();
        assert_eq!(s.input_tokens, 1_000_000);
        assert_eq!(s.output_tokens, 1_000_000);
        assert!((s.cost - 18.0).abs() < 1e-9);

        let s = sessions.add_cost(&s.id, 0.5).await.unwrap();
        assert_eq!(s.total_tokens(), 2_000_000);
        assert!((s.cost - 18.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rename_and_anchor() {
        let sessions = manager();
        let s = sessions.create("").await.unwrap();
        assert!(!s.has_title());
        let s = sessions.rename(&s.id, "Refactor parser").await.unwrap();
        assert_eq!(s.title, "Refactor parser");
        let s = sessions.set_summary_anchor(&s.id, "m42").await.unwrap();
        assert_eq!(s.summary_message_id.as_deref(), Some("m42"));
        assert_eq!(sessions.get(&s.id).await.unwrap().title, "Refactor parser");
    }

    #[tokio::test]
    async fn delete_removes_children() {
        let sessions = manager();
        let parent = sessions.create("p").await.unwrap();
        sessions.create_child(&parent.id, "c1", "c").await.unwrap();
        sessions.delete(&parent.id).await.unwrap();
        assert!(sessions.get("c1").await.is_err());
        assert!(sessions.list().await.unwrap().is_empty());
    }
}
