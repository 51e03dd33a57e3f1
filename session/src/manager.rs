use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use nosql_session_core::{
    DocumentStoreRef, SessionConfig, SessionError, SessionResult, SessionSettings, StalePolicy,
};
use tracing::{debug, info, warn};

use crate::codec::AttributeCodec;
use crate::context::context_id_for;
use crate::lifecycle::SessionListenerRef;
use crate::proxy::{SessionProxy, SessionState};
use crate::record::now_millis;
use crate::registry::{IdRegistry, SessionInvalidator, SubscriptionId};
use crate::store::SessionStore;

/// Owns the in-memory sessions of one application context.
#[derive(Debug)]
pub struct SessionManager {
    store: SessionStore,
    registry: Arc<IdRegistry>,
    settings: SessionSettings,
    listener: SessionListenerRef,
    sessions: RwLock<HashMap<String, Arc<SessionProxy>>>,
    subscription: std::sync::Mutex<Option<SubscriptionId>>,
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        documents: DocumentStoreRef,
        registry: Arc<IdRegistry>,
        config: &SessionConfig,
        codec: Arc<AttributeCodec>,
        listener: SessionListenerRef,
    ) -> Arc<Self> {
        let store = SessionStore::new(
            documents,
            codec,
            context_id_for(&config.context),
            config.session.save_all_attributes,
        );
        Arc::new_cyclic(|weak_self| Self {
            store,
            registry,
            settings: config.session.clone(),
            listener,
            sessions: RwLock::new(HashMap::new()),
            subscription: std::sync::Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<IdRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn context_id(&self) -> &str {
        self.store.context_id()
    }

    /// Subscribe to invalidations broadcast by the registry.
    pub fn start(&self) -> SessionResult<()> {
        let mut subscription = self
            .subscription
            .lock()
            .map_err(|e| SessionError::Config(format!("subscription poisoned: {}", e)))?;
        if subscription.is_none() {
            let invalidator: Weak<dyn SessionInvalidator> = self.weak_self.clone();
            *subscription = Some(self.registry.subscribe(invalidator)?);
            info!(context = %self.context_id(), "Session manager started");
        }
        Ok(())
    }

    /// Unsubscribe and write every valid in-memory session back to the store.
    pub async fn stop(&self) {
        let subscription = self.subscription.lock().ok().and_then(|mut s| s.take());
        if let Some(subscription) = subscription {
            self.registry.unsubscribe(subscription);
        }

        for proxy in self.drain() {
            let mut state = proxy.lock_state().await;
            if state.is_valid() {
                self.store.save(&mut state, false).await;
            }
        }
        info!(context = %self.context_id(), "Session manager stopped");
    }

    fn drain(&self) -> Vec<Arc<SessionProxy>> {
        match self.sessions.write() {
            Ok(mut sessions) => sessions.drain().map(|(_, proxy)| proxy).collect(),
            Err(e) => {
                warn!(error = %e, "Session map poisoned");
                Vec::new()
            }
        }
    }

    /// Create a session under a fresh cluster id.
    pub async fn create_session(&self) -> SessionResult<Arc<SessionProxy>> {
        let id = self.registry.new_session_id().await?;
        self.create_session_with_id(&id).await
    }

    /// Create a session and persist it at once.
    ///
    /// Fails with [`SessionError::DuplicateKey`] when the id is already
    /// cached here or held by a valid record, and when a stored record for
    /// the id was invalidated.
    ///
    /// The returned proxy already counts one active request; the caller
    /// finishes it with [`SessionProxy::complete`].
    pub async fn create_session_with_id(&self, id: &str) -> SessionResult<Arc<SessionProxy>> {
        if self.cached(id)?.is_some() || self.registry.id_in_use(id).await? {
            return Err(SessionError::DuplicateKey {
                index: "sessions".to_string(),
                key: id.to_string(),
            });
        }

        let now = now_millis();
        let mut state = SessionState::new(id, now, now, None, self.listener.clone());
        if self.store.create(&mut state).await?.is_none() {
            warn!(session_id = %id, "New session not yet persisted; next save retries");
        }

        let proxy = Arc::new(SessionProxy::new(state, 1, self.weak_self.clone()));
        self.registry.add_session(id).await;
        self.sessions
            .write()
            .map_err(|e| SessionError::Config(format!("session map poisoned: {}", e)))?
            .insert(id.to_string(), proxy.clone());
        debug!(session_id = %id, "Created session");
        Ok(proxy)
    }

    /// Find a session in memory, or load it from the store.
    ///
    /// Callers bracket each request with [`SessionProxy::access`] and
    /// [`SessionProxy::complete`].
    pub async fn get_session(&self, id: &str) -> SessionResult<Option<Arc<SessionProxy>>> {
        if let Some(proxy) = self.cached(id)? {
            return Ok(Some(proxy));
        }

        let Some(state) = self.store.load_session(id, self.listener.clone()).await else {
            return Ok(None);
        };
        let loaded = Arc::new(SessionProxy::new(state, 0, self.weak_self.clone()));
        let proxy = self
            .sessions
            .write()
            .map_err(|e| SessionError::Config(format!("session map poisoned: {}", e)))?
            .entry(id.to_string())
            .or_insert(loaded)
            .clone();
        self.registry.add_session(id).await;
        debug!(session_id = %id, "Loaded session");
        Ok(Some(proxy))
    }

    fn cached(&self, id: &str) -> SessionResult<Option<Arc<SessionProxy>>> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| SessionError::Config(format!("session map poisoned: {}", e)))?
            .get(id)
            .cloned())
    }

    /// Drop the session from memory and remove this context's attributes from the store.
    pub async fn remove_session(&self, proxy: &SessionProxy) -> bool {
        self.forget(proxy.cluster_id()).await;
        let state = proxy.lock_state().await;
        self.store.remove(&state).await
    }

    /// Invalidate `id` in the store and in every context on this node.
    pub async fn invalidate_session(&self, id: &str) -> bool {
        let changed = self.store.invalidate_session(id).await;
        self.registry.invalidate_all(id).await;
        changed
    }

    /// Write back and drop sessions idle for longer than `max_idle`. Returns how many were evicted.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(max_idle.as_millis() as i64);
        let candidates: Vec<Arc<SessionProxy>> = match self.sessions.read() {
            Ok(sessions) => sessions
                .values()
                .filter(|p| p.active_requests() == 0)
                .cloned()
                .collect(),
            Err(_) => return 0,
        };

        let mut evicted = 0;
        for proxy in candidates {
            let mut state = proxy.lock_state().await;
            if proxy.active_requests() > 0 || state.accessed() >= cutoff {
                continue;
            }
            if state.is_valid() && state.is_dirty() {
                self.store.save(&mut state, false).await;
            }
            if let Ok(mut sessions) = self.sessions.write() {
                sessions.remove(proxy.cluster_id());
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(context = %self.context_id(), evicted, "Evicted idle sessions");
        }
        evicted
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub(crate) fn refresh_due(&self, state: &SessionState, now: i64) -> bool {
        match self.settings.stale_policy {
            StalePolicy::Always => true,
            StalePolicy::Never => false,
            StalePolicy::Window => {
                now - state.last_sync() > self.settings.stale_window().as_millis() as i64
            }
        }
    }

    /// Drop `id` from memory and from the node registry.
    pub(crate) async fn forget(&self, id: &str) {
        self.unmap(id);
        self.registry.remove_session(id).await;
    }

    fn unmap(&self, id: &str) -> Option<Arc<SessionProxy>> {
        match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(id),
            Err(e) => {
                warn!(error = %e, "Session map poisoned");
                None
            }
        }
    }
}

#[async_trait]
impl SessionInvalidator for SessionManager {
    async fn invalidate_by_id(&self, id: &str) {
        if let Some(proxy) = self.unmap(id) {
            proxy.invalidate_locally().await;
            debug!(session_id = %id, context = %self.context_id(), "Invalidated by broadcast");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::NoopListener;
    use crate::record;
    use nosql_session_core::adapters::InMemoryDocumentStore;
    use nosql_session_core::{ContextConfig, SavePolicy};

    async fn manager_with(
        memory: &Arc<InMemoryDocumentStore>,
        registry: &Arc<IdRegistry>,
        context_path: &str,
        save_policy: SavePolicy,
    ) -> Arc<SessionManager> {
        let mut config = SessionConfig::default();
        config.context = ContextConfig {
            virtual_hosts: Vec::new(),
            context_path: context_path.to_string(),
        };
        config.session.save_policy = save_policy;
        let manager = SessionManager::new(
            memory.clone(),
            registry.clone(),
            &config,
            Arc::new(AttributeCodec::new()),
            Arc::new(NoopListener),
        );
        manager.start().unwrap();
        manager
    }

    async fn setup(save_policy: SavePolicy) -> (Arc<InMemoryDocumentStore>, Arc<SessionManager>) {
        let memory = Arc::new(InMemoryDocumentStore::new());
        let registry = IdRegistry::new(memory.clone(), None).await.unwrap();
        let manager = manager_with(&memory, &registry, "/app", save_policy).await;
        (memory, manager)
    }

    #[tokio::test]
    async fn test_create_persists_eagerly() {
        let (_memory, manager) = setup(SavePolicy::Always).await;
        let proxy = manager.create_session().await.unwrap();
        let id = proxy.cluster_id().to_string();

        assert_eq!(proxy.version().await, Some(1));
        assert_eq!(proxy.active_requests(), 1);
        assert!(manager.registry().is_registered(&id).await);
        assert!(manager.registry().id_in_use(&id).await.unwrap());
        assert_eq!(manager.session_count(), 1);

        assert!(matches!(
            manager.create_session_with_id(&id).await,
            Err(SessionError::DuplicateKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_session_uses_memory_then_store() {
        let (memory, manager) = setup(SavePolicy::Always).await;
        let proxy = manager.create_session_with_id("s1").await.unwrap();
        proxy.set_attribute("a", 1i64).await.unwrap();
        proxy.complete().await;

        let same = manager.get_session("s1").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&proxy, &same));

        let registry = manager.registry().clone();
        let other = manager_with(&memory, &registry, "/app", SavePolicy::Always).await;
        let loaded = other.get_session("s1").await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&proxy, &loaded));
        assert_eq!(loaded.attribute("a").await, Some(1i64.into()));

        assert!(manager.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_session_reaches_every_context() {
        let (memory, manager) = setup(SavePolicy::Always).await;
        let registry = manager.registry().clone();
        let other = manager_with(&memory, &registry, "/other", SavePolicy::Always).await;

        let proxy = manager.create_session_with_id("s1").await.unwrap();
        proxy.complete().await;
        let theirs = other.get_session("s1").await.unwrap().unwrap();

        assert!(manager.invalidate_session("s1").await);
        assert!(!proxy.is_valid().await);
        assert!(!theirs.is_valid().await);
        assert_eq!(manager.session_count(), 0);
        assert_eq!(other.session_count(), 0);
        assert!(!registry.is_registered("s1").await);
        assert!(!registry.id_in_use("s1").await.unwrap());

        assert!(!manager.invalidate_session("s1").await);
    }

    #[tokio::test]
    async fn test_proxy_invalidate_forgets_session() {
        let (_memory, manager) = setup(SavePolicy::Never).await;
        let proxy = manager.create_session_with_id("s1").await.unwrap();
        proxy.invalidate().await;

        assert_eq!(manager.session_count(), 0);
        assert!(!manager.registry().is_registered("s1").await);
        assert!(!manager.registry().id_in_use("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_session() {
        let (_memory, manager) = setup(SavePolicy::Always).await;
        let proxy = manager.create_session_with_id("s1").await.unwrap();
        proxy.complete().await;

        assert!(manager.remove_session(&proxy).await);
        assert_eq!(manager.session_count(), 0);
        assert!(!manager.registry().is_registered("s1").await);
    }

    #[tokio::test]
    async fn test_stale_window_policy() {
        let memory = Arc::new(InMemoryDocumentStore::new());
        let registry = IdRegistry::new(memory.clone(), None).await.unwrap();
        let mut config = SessionConfig::default();
        config.session.stale_policy = StalePolicy::Window;
        config.session.stale_window_secs = 30;
        let manager = SessionManager::new(
            memory,
            registry,
            &config,
            Arc::new(AttributeCodec::new()),
            Arc::new(NoopListener),
        );

        let state = SessionState::new("s1", 0, 0, Some(1), Arc::new(NoopListener));
        assert!(!manager.refresh_due(&state, 30_000));
        assert!(manager.refresh_due(&state, 30_001));
    }

    #[tokio::test]
    async fn test_stop_saves_and_clears() {
        let (memory, manager) = setup(SavePolicy::Never).await;
        let proxy = manager.create_session_with_id("s1").await.unwrap();
        proxy.set_attribute("a", "x").await.unwrap();

        manager.stop().await;
        assert_eq!(manager.session_count(), 0);

        let registry = manager.registry().clone();
        let other = manager_with(&memory, &registry, "/app", SavePolicy::Never).await;
        let loaded = other.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.attribute("a").await, Some("x".into()));
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let (_memory, manager) = setup(SavePolicy::Never).await;
        let _busy = manager.create_session_with_id("busy").await.unwrap();
        let idle = manager.create_session_with_id("idle").await.unwrap();
        idle.complete().await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.evict_idle(Duration::ZERO).await, 1);
        assert_eq!(manager.session_count(), 1);
        assert!(manager.get_session("idle").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_id_held_by_another_context() {
        let (memory, manager) = setup(SavePolicy::Always).await;
        let other_registry = IdRegistry::new(memory.clone(), None).await.unwrap();
        let other = manager_with(&memory, &other_registry, "/other", SavePolicy::Always).await;

        let proxy = manager.create_session_with_id("s1").await.unwrap();
        proxy.complete().await;
        let created = memory.documents().unwrap()[0].get(record::CREATED).cloned();

        assert!(matches!(
            other.create_session_with_id("s1").await,
            Err(SessionError::DuplicateKey { .. })
        ));
        assert_eq!(other.session_count(), 0);
        assert!(!other_registry.is_registered("s1").await);
        assert_eq!(memory.documents().unwrap()[0].get(record::CREATED).cloned(), created);
    }

    #[tokio::test]
    async fn test_create_does_not_revive_invalidated_record() {
        let (memory, manager) = setup(SavePolicy::Always).await;
        let proxy = manager.create_session_with_id("s1").await.unwrap();
        proxy.complete().await;
        assert!(manager.invalidate_session("s1").await);
        let before = memory.documents().unwrap();

        let other_registry = IdRegistry::new(memory.clone(), None).await.unwrap();
        let other = manager_with(&memory, &other_registry, "/other", SavePolicy::Always).await;
        assert!(matches!(
            other.create_session_with_id("s1").await,
            Err(SessionError::DuplicateKey { .. })
        ));
        assert_eq!(other.session_count(), 0);
        assert_eq!(memory.documents().unwrap(), before);
    }

    #[tokio::test]
    async fn test_late_first_save_leaves_invalidated_record() {
        let (memory, manager) = setup(SavePolicy::Always).await;
        let other_registry = IdRegistry::new(memory.clone(), None).await.unwrap();
        let other = manager_with(&memory, &other_registry, "/other", SavePolicy::Always).await;

        let proxy = manager.create_session_with_id("s1").await.unwrap();
        proxy.complete().await;
        let theirs = other.get_session("s1").await.unwrap().unwrap();
        assert!(theirs.access().await);

        assert!(manager.invalidate_session("s1").await);
        let before = memory.documents().unwrap();

        theirs.set_attribute("cart", 1i64).await.unwrap();
        theirs.complete().await;

        assert_eq!(memory.documents().unwrap(), before);
        assert_eq!(
            before[0].get(record::VALID),
            Some(&nosql_session_core::Value::Bool(false))
        );
    }
}
