use std::collections::BTreeSet;
use std::sync::Arc;

use nosql_session_core::{
    DocumentStore, DocumentStoreRef, Filter, Projection, SessionResult, Update,
};
use tracing::{debug, warn};

use crate::codec::AttributeCodec;
use crate::lifecycle::SessionListenerRef;
use crate::proxy::SessionState;
use crate::record::{
    self, attribute_path, context_path, now_millis, stored_version, version_path, SessionRecord,
    ACCESSED, CREATED, ID, INVALIDATED, VALID,
};

/// Result of comparing in-memory state with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The stored version matched; nothing was reloaded.
    Unchanged(i64),
    /// Attributes were reloaded at the given version.
    Reloaded(Option<i64>),
    /// The record is gone or no longer valid; local state was invalidated.
    Invalidated,
    /// The store could not be read; local state was left as it was.
    Failed,
}

/// Reads and writes one context's view of session records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    documents: DocumentStoreRef,
    codec: Arc<AttributeCodec>,
    context_id: String,
    save_all_attributes: bool,
}

impl SessionStore {
    pub fn new(
        documents: DocumentStoreRef,
        codec: Arc<AttributeCodec>,
        context_id: impl Into<String>,
        save_all_attributes: bool,
    ) -> Self {
        Self {
            documents,
            codec,
            context_id: context_id.into(),
            save_all_attributes,
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn documents(&self) -> &DocumentStoreRef {
        &self.documents
    }

    pub fn codec(&self) -> &Arc<AttributeCodec> {
        &self.codec
    }

    /// Persist `state`, returning the new version.
    ///
    /// Failures are logged and reported as `None`; the state keeps its
    /// previous version and dirty names so the next save retries them.
    pub async fn save(&self, state: &mut SessionState, activate_after: bool) -> Option<i64> {
        state.will_passivate();
        let dirty = state.take_dirty();

        match self.write(state, &dirty).await {
            Ok(Some(version)) => {
                if activate_after {
                    state.did_activate();
                }
                state.set_version(Some(version));
                state.mark_synced(now_millis());
                debug!(session_id = %state.cluster_id(), version, "Saved session");
                Some(version)
            }
            Ok(None) => {
                warn!(
                    session_id = %state.cluster_id(),
                    "Save matched no valid record; keeping version {:?}",
                    state.version()
                );
                state.restore_dirty(dirty);
                None
            }
            Err(e) => {
                warn!(session_id = %state.cluster_id(), error = %e, "Failed to save session");
                state.restore_dirty(dirty);
                None
            }
        }
    }

    /// Persist a newly created session.
    ///
    /// Unlike [`save`](Self::save), store errors other than an outage are
    /// returned, so a caller can reject an id that collides with an
    /// existing record. An outage is logged and yields `Ok(None)`.
    pub async fn create(&self, state: &mut SessionState) -> SessionResult<Option<i64>> {
        match self.write(state, &BTreeSet::new()).await {
            Ok(Some(version)) => {
                state.set_version(Some(version));
                state.mark_synced(now_millis());
                debug!(session_id = %state.cluster_id(), version, "Created session");
                Ok(Some(version))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_transient() => {
                warn!(session_id = %state.cluster_id(), error = %e, "Failed to persist new session");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn write(
        &self,
        state: &SessionState,
        dirty: &BTreeSet<String>,
    ) -> SessionResult<Option<i64>> {
        let id = state.cluster_id();
        let now = now_millis();
        let is_new = state.version().is_none();
        let valid = state.is_valid();

        let (mut update, next) = match state.version() {
            Some(version) => (Update::new().inc(version_path(&self.context_id), 1), version + 1),
            None => (Update::new().set(version_path(&self.context_id), 1i64), 1),
        };

        let filter = if valid {
            Filter::new().eq(ID, id).eq(VALID, true)
        } else {
            Filter::new().eq(ID, id)
        };

        if valid {
            update = update.set(ACCESSED, state.accessed().max(now));
            if is_new {
                // An existing valid record keeps its creation time; an
                // invalidated one is not matched, so the upsert collides on
                // the unique id index instead of reviving it.
                update = update
                    .set_on_insert(VALID, true)
                    .set_on_insert(CREATED, state.created());
            }

            let names: Vec<String> = if is_new || self.save_all_attributes {
                state.names()
            } else {
                dirty.iter().cloned().collect()
            };
            for name in names {
                let path = attribute_path(&self.context_id, &name);
                update = match state.attribute(&name) {
                    Some(value) => update.set(path, self.codec.encode_value(value)?),
                    None => update.unset(path),
                };
            }
        } else {
            update = update
                .set(VALID, false)
                .set(INVALIDATED, now)
                .unset(context_path(&self.context_id));
        }

        let result = self
            .documents
            .update(&filter, &update, is_new && valid, false)
            .await?;
        if result.matched == 0 && !result.upserted {
            return Ok(None);
        }
        Ok(Some(next))
    }

    /// Bring `state` up to date with the store.
    ///
    /// With a known version, a lightweight lookup of the version and
    /// validity decides whether the full reload is needed.
    pub async fn refresh(&self, state: &mut SessionState) -> RefreshOutcome {
        match self.try_refresh(state).await {
            Ok(outcome) => {
                if outcome == RefreshOutcome::Invalidated {
                    state.invalidate();
                } else {
                    state.mark_synced(now_millis());
                }
                outcome
            }
            Err(e) => {
                warn!(session_id = %state.cluster_id(), error = %e, "Failed to refresh session");
                RefreshOutcome::Failed
            }
        }
    }

    async fn try_refresh(&self, state: &mut SessionState) -> SessionResult<RefreshOutcome> {
        let filter = Filter::new().eq(ID, state.cluster_id());

        if let Some(version) = state.version() {
            let versions_only = Projection::of([version_path(&self.context_id), VALID.to_string()]);
            let Some(doc) = self.documents.find_one(&filter, Some(&versions_only)).await? else {
                return Ok(RefreshOutcome::Invalidated);
            };
            if !record::is_valid(&doc) {
                return Ok(RefreshOutcome::Invalidated);
            }
            if stored_version(&doc, &self.context_id) == Some(version) {
                return Ok(RefreshOutcome::Unchanged(version));
            }
        }

        let Some(doc) = self.documents.find_one(&filter, None).await? else {
            return Ok(RefreshOutcome::Invalidated);
        };
        let loaded = SessionRecord::from_document(&doc, &self.context_id, &self.codec)?;
        if !loaded.valid {
            return Ok(RefreshOutcome::Invalidated);
        }

        state.will_passivate();
        state.clear_attributes();
        for (name, value) in loaded.attributes {
            state.restore_attribute(name, value);
        }
        state.touch(loaded.accessed);
        state.set_version(loaded.version);
        state.did_activate();

        debug!(session_id = %state.cluster_id(), version = ?loaded.version, "Reloaded session");
        Ok(RefreshOutcome::Reloaded(loaded.version))
    }

    /// Load a valid session. Missing, invalid and unreadable records all yield `None`.
    pub async fn load_session(&self, id: &str, listener: SessionListenerRef) -> Option<SessionState> {
        match self.try_load(id, listener).await {
            Ok(state) => state,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to load session");
                None
            }
        }
    }

    async fn try_load(
        &self,
        id: &str,
        listener: SessionListenerRef,
    ) -> SessionResult<Option<SessionState>> {
        let Some(doc) = self.documents.find_one(&Filter::new().eq(ID, id), None).await? else {
            debug!(session_id = %id, "No stored session");
            return Ok(None);
        };
        let loaded = SessionRecord::from_document(&doc, &self.context_id, &self.codec)?;
        if !loaded.valid {
            debug!(session_id = %id, "Stored session is no longer valid");
            return Ok(None);
        }

        let mut state = SessionState::new(
            loaded.id,
            loaded.created,
            loaded.accessed,
            loaded.version,
            listener,
        );
        for (name, value) in loaded.attributes {
            state.restore_attribute(name, value);
        }
        state.mark_synced(now_millis());
        state.did_activate();
        Ok(Some(state))
    }

    /// Drop this context's attributes for the session. Returns whether a record existed.
    pub async fn remove(&self, state: &SessionState) -> bool {
        let filter = Filter::new().eq(ID, state.cluster_id());
        let update = Update::new().unset(context_path(&self.context_id));
        match self.documents.update(&filter, &update, false, false).await {
            Ok(result) => result.matched > 0,
            Err(e) => {
                warn!(session_id = %state.cluster_id(), error = %e, "Failed to remove session");
                false
            }
        }
    }

    /// Mark a record invalid regardless of any in-memory state.
    ///
    /// Only a currently valid record is touched, so repeating this keeps the
    /// first `invalidated` timestamp.
    pub async fn invalidate_session(&self, id: &str) -> bool {
        match invalidate_record(&*self.documents, id).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to invalidate session");
                false
            }
        }
    }
}

/// Flip a valid record to `valid=false`. Returns whether a record changed.
pub(crate) async fn invalidate_record(
    documents: &dyn DocumentStore,
    id: &str,
) -> SessionResult<bool> {
    let filter = Filter::new().eq(ID, id).eq(VALID, true);
    let update = Update::new()
        .set(VALID, false)
        .set(INVALIDATED, now_millis());
    let result = documents.update(&filter, &update, false, false).await?;
    Ok(result.matched > 0)
}

/// Read the stored `valid` flag; an absent record is not in use.
pub(crate) async fn id_in_use(
    documents: &dyn DocumentStore,
    id: &str,
) -> SessionResult<bool> {
    let validity = Projection::of([VALID]);
    let doc = documents
        .find_one(&Filter::new().eq(ID, id), Some(&validity))
        .await?;
    Ok(doc.map(|d| record::is_valid(&d)).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AttributeValue, OpaqueValue};
    use crate::lifecycle::{NoopListener, SessionListener};
    use nosql_session_core::adapters::InMemoryDocumentStore;
    use nosql_session_core::document::get_path;
    use nosql_session_core::{Document, SessionError, Value};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    const CTX: &str = "0_0_0_0_app";

    async fn setup() -> (Arc<InMemoryDocumentStore>, SessionStore) {
        let memory = Arc::new(InMemoryDocumentStore::new());
        record::ensure_indexes(&*memory).await.unwrap();
        let store = SessionStore::new(memory.clone(), Arc::new(AttributeCodec::new()), CTX, false);
        (memory, store)
    }

    fn other_context(memory: &Arc<InMemoryDocumentStore>, save_all: bool) -> SessionStore {
        SessionStore::new(
            memory.clone(),
            Arc::new(AttributeCodec::new()),
            "0_0_0_0_other",
            save_all,
        )
    }

    #[derive(Debug, Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl SessionListener for Recorder {
        fn will_passivate(&self, id: &str, _: &BTreeMap<String, AttributeValue>) {
            self.events.lock().unwrap().push(format!("passivate:{}", id));
        }
        fn did_activate(&self, id: &str, _: &BTreeMap<String, AttributeValue>) {
            self.events.lock().unwrap().push(format!("activate:{}", id));
        }
    }

    fn fresh(id: &str) -> SessionState {
        let now = now_millis();
        SessionState::new(id, now, now, None, Arc::new(NoopListener))
    }

    async fn stored(memory: &InMemoryDocumentStore, id: &str) -> Option<Document> {
        memory
            .find_one(&Filter::new().eq(ID, id), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_save_creates_record() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        state.put_or_remove("user.name", Some("alice".into()));

        assert_eq!(store.save(&mut state, false).await, Some(1));
        assert_eq!(state.version(), Some(1));
        assert!(!state.is_dirty());

        let doc = stored(&memory, "s1").await.unwrap();
        assert_eq!(doc.get(VALID), Some(&Value::Bool(true)));
        assert_eq!(doc.get(CREATED), Some(&Value::Int(state.created())));
        assert_eq!(get_path(&doc, &version_path(CTX)), Some(&Value::Int(1)));
        assert_eq!(
            get_path(&doc, "context.0_0_0_0_app.user%2Ename"),
            Some(&Value::from("alice"))
        );
    }

    #[tokio::test]
    async fn test_versions_increase_by_one() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        let mut seen = Vec::new();
        for i in 0..4i64 {
            state.put_or_remove("n", Some(i.into()));
            seen.push(store.save(&mut state, false).await.unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
        let doc = stored(&memory, "s1").await.unwrap();
        assert_eq!(get_path(&doc, &version_path(CTX)), Some(&Value::Int(4)));
    }

    #[tokio::test]
    async fn test_incremental_save_writes_only_dirty_names() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        state.put_or_remove("a", Some(1i64.into()));
        state.put_or_remove("b", Some(2i64.into()));
        store.save(&mut state, false).await.unwrap();

        state.put_or_remove("b", None);
        store.save(&mut state, false).await.unwrap();

        let doc = stored(&memory, "s1").await.unwrap();
        assert_eq!(get_path(&doc, &attribute_path(CTX, "a")), Some(&Value::Int(1)));
        assert_eq!(get_path(&doc, &attribute_path(CTX, "b")), None);
    }

    #[tokio::test]
    async fn test_invalid_save_clears_context() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        state.put_or_remove("a", Some(1i64.into()));
        store.save(&mut state, false).await.unwrap();

        state.invalidate();
        assert!(store.save(&mut state, false).await.is_some());

        let doc = stored(&memory, "s1").await.unwrap();
        assert_eq!(doc.get(VALID), Some(&Value::Bool(false)));
        assert!(doc.get(INVALIDATED).is_some());
        assert_eq!(get_path(&doc, &context_path(CTX)), None);
        assert!(get_path(&doc, &version_path(CTX)).is_some());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_version_and_dirty() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        store.save(&mut state, false).await.unwrap();

        state.put_or_remove("a", Some(1i64.into()));
        memory.set_unavailable(true);
        assert_eq!(store.save(&mut state, false).await, None);
        assert_eq!(state.version(), Some(1));
        assert!(state.is_dirty());

        memory.set_unavailable(false);
        assert_eq!(store.save(&mut state, false).await, Some(2));
        let doc = stored(&memory, "s1").await.unwrap();
        assert_eq!(get_path(&doc, &attribute_path(CTX, "a")), Some(&Value::Int(1)));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cart {
        items: Vec<String>,
    }

    #[tokio::test]
    async fn test_unregistered_opaque_value_fails_save() {
        let (_memory, store) = setup().await;
        let mut state = fresh("s1");
        store.save(&mut state, false).await.unwrap();

        let cart = OpaqueValue::new("cart", Cart { items: vec!["x".into()] });
        state.put_or_remove("cart", Some(cart.into()));
        assert_eq!(store.save(&mut state, false).await, None);
        assert!(state.is_dirty());

        store.codec().register::<Cart>("cart").unwrap();
        assert_eq!(store.save(&mut state, false).await, Some(2));

        let loaded = store
            .load_session("s1", Arc::new(NoopListener))
            .await
            .unwrap();
        let AttributeValue::Opaque(value) = loaded.attribute("cart").unwrap() else {
            panic!("expected opaque attribute");
        };
        assert_eq!(
            value.downcast_ref::<Cart>(),
            Some(&Cart { items: vec!["x".into()] })
        );
    }

    #[tokio::test]
    async fn test_refresh_fast_path() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        store.save(&mut state, false).await.unwrap();

        memory.reset_stats();
        assert_eq!(store.refresh(&mut state).await, RefreshOutcome::Unchanged(1));
        let stats = memory.stats();
        assert_eq!(stats.find_one, 1);
        assert_eq!(stats.update, 0);
    }

    #[tokio::test]
    async fn test_refresh_reloads_newer_version() {
        let (memory, store) = setup().await;
        let mut writer = fresh("s1");
        writer.put_or_remove("a", Some(1i64.into()));
        store.save(&mut writer, false).await.unwrap();

        let mut reader = store
            .load_session("s1", Arc::new(NoopListener))
            .await
            .unwrap();
        writer.put_or_remove("a", Some(2i64.into()));
        store.save(&mut writer, false).await.unwrap();

        memory.reset_stats();
        assert_eq!(store.refresh(&mut reader).await, RefreshOutcome::Reloaded(Some(2)));
        assert_eq!(memory.stats().find_one, 2);
        assert_eq!(reader.attribute("a"), Some(&AttributeValue::from(2i64)));
        assert!(!reader.is_dirty());
    }

    #[tokio::test]
    async fn test_refresh_invalidates_on_missing_or_invalid() {
        let (_memory, store) = setup().await;
        let mut state = fresh("s1");
        store.save(&mut state, false).await.unwrap();

        assert!(store.invalidate_session("s1").await);
        assert_eq!(store.refresh(&mut state).await, RefreshOutcome::Invalidated);
        assert!(!state.is_valid());

        let mut ghost = SessionState::new("ghost", 0, 0, Some(3), Arc::new(NoopListener));
        assert_eq!(store.refresh(&mut ghost).await, RefreshOutcome::Invalidated);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_state() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        state.put_or_remove("a", Some(1i64.into()));
        store.save(&mut state, false).await.unwrap();

        memory.set_unavailable(true);
        assert_eq!(store.refresh(&mut state).await, RefreshOutcome::Failed);
        assert!(state.is_valid());
        assert_eq!(state.version(), Some(1));
        assert_eq!(state.attribute("a"), Some(&AttributeValue::from(1i64)));
    }

    #[tokio::test]
    async fn test_load_session() {
        let (_memory, store) = setup().await;
        assert!(store.load_session("nope", Arc::new(NoopListener)).await.is_none());

        let mut state = fresh("s1");
        state.put_or_remove("a", Some("x".into()));
        store.save(&mut state, false).await.unwrap();

        let loaded = store
            .load_session("s1", Arc::new(NoopListener))
            .await
            .unwrap();
        assert_eq!(loaded.version(), Some(1));
        assert_eq!(loaded.created(), state.created());
        assert_eq!(loaded.attribute("a"), Some(&AttributeValue::from("x")));
        assert!(!loaded.is_dirty());

        store.invalidate_session("s1").await;
        assert!(store.load_session("s1", Arc::new(NoopListener)).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_unsets_context() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        state.put_or_remove("a", Some(1i64.into()));
        store.save(&mut state, false).await.unwrap();

        assert!(store.remove(&state).await);
        let doc = stored(&memory, "s1").await.unwrap();
        assert_eq!(get_path(&doc, &context_path(CTX)), None);
        assert!(!store.remove(&fresh("other")).await);
    }

    #[tokio::test]
    async fn test_invalidate_session_is_idempotent() {
        let (memory, store) = setup().await;
        let mut state = fresh("s1");
        store.save(&mut state, false).await.unwrap();

        assert!(store.invalidate_session("s1").await);
        let first = stored(&memory, "s1").await.unwrap();
        assert!(!store.invalidate_session("s1").await);
        let second = stored(&memory, "s1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.get(VALID), Some(&Value::Bool(false)));
        assert!(second.get(INVALIDATED).is_some());
    }

    #[tokio::test]
    async fn test_id_in_use() {
        let (memory, store) = setup().await;
        assert!(!id_in_use(&*memory, "s1").await.unwrap());
        let mut state = fresh("s1");
        store.save(&mut state, false).await.unwrap();
        assert!(id_in_use(&*memory, "s1").await.unwrap());
        store.invalidate_session("s1").await;
        assert!(!id_in_use(&*memory, "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_first_save_keeps_existing_created() {
        let (memory, store) = setup().await;
        let mut first = SessionState::new("s1", 1_000, 1_000, None, Arc::new(NoopListener));
        store.save(&mut first, false).await.unwrap();

        let other = other_context(&memory, false);
        let mut second = SessionState::new("s1", 2_000, 2_000, None, Arc::new(NoopListener));
        assert_eq!(other.save(&mut second, false).await, Some(1));

        let doc = stored(&memory, "s1").await.unwrap();
        assert_eq!(doc.get(CREATED), Some(&Value::Int(1_000)));
        assert_eq!(doc.get(VALID), Some(&Value::Bool(true)));
        assert_eq!(get_path(&doc, &version_path(CTX)), Some(&Value::Int(1)));
        assert_eq!(get_path(&doc, &version_path("0_0_0_0_other")), Some(&Value::Int(1)));
        assert_eq!(memory.documents().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_save_does_not_revive_invalidated_record() {
        let (memory, store) = setup().await;
        let mut first = SessionState::new("s1", 1_000, 1_000, None, Arc::new(NoopListener));
        store.save(&mut first, false).await.unwrap();
        assert!(store.invalidate_session("s1").await);
        let before = stored(&memory, "s1").await.unwrap();

        let other = other_context(&memory, false);
        let mut late = fresh("s1");
        late.put_or_remove("a", Some(1i64.into()));
        assert_eq!(other.save(&mut late, false).await, None);
        assert_eq!(late.version(), None);
        assert!(late.is_dirty());

        assert_eq!(stored(&memory, "s1").await.unwrap(), before);
        assert_eq!(memory.documents().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalidated_id() {
        let (memory, store) = setup().await;
        let mut first = fresh("s1");
        store.save(&mut first, false).await.unwrap();
        store.invalidate_session("s1").await;

        let mut again = fresh("s1");
        assert!(matches!(
            store.create(&mut again).await,
            Err(SessionError::DuplicateKey { .. })
        ));
        assert_eq!(
            stored(&memory, "s1").await.unwrap().get(VALID),
            Some(&Value::Bool(false))
        );

        memory.set_unavailable(true);
        assert_eq!(store.create(&mut fresh("s2")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_all_attributes_rewrites_clean_names() {
        let (memory, _store) = setup().await;
        let store = other_context(&memory, true);
        let path_a = attribute_path("0_0_0_0_other", "a");

        let mut state = fresh("s1");
        state.put_or_remove("a", Some(1i64.into()));
        state.put_or_remove("b", Some(1i64.into()));
        store.save(&mut state, false).await.unwrap();

        memory
            .update(
                &Filter::new().eq(ID, "s1"),
                &Update::new().set(path_a.clone(), 99i64),
                false,
                false,
            )
            .await
            .unwrap();

        state.put_or_remove("b", Some(2i64.into()));
        store.save(&mut state, false).await.unwrap();

        let doc = stored(&memory, "s1").await.unwrap();
        assert_eq!(get_path(&doc, &path_a), Some(&Value::Int(1)));
        assert_eq!(
            get_path(&doc, &attribute_path("0_0_0_0_other", "b")),
            Some(&Value::Int(2))
        );
    }

    #[tokio::test]
    async fn test_save_replays_activation_only_when_asked() {
        let (_memory, store) = setup().await;
        let recorder = Arc::new(Recorder::default());
        let mut state = SessionState::new("s1", 0, 0, None, recorder.clone());

        store.save(&mut state, true).await.unwrap();
        assert_eq!(
            recorder.events.lock().unwrap().drain(..).collect::<Vec<_>>(),
            vec!["passivate:s1", "activate:s1"]
        );

        store.save(&mut state, false).await.unwrap();
        assert_eq!(
            recorder.events.lock().unwrap().drain(..).collect::<Vec<_>>(),
            vec!["passivate:s1"]
        );
    }
}
