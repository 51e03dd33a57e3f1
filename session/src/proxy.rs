//! In-memory session objects.
//!
//! A [`SessionProxy`] is what request handlers hold. It counts concurrent
//! requests and, on the first access and the last completion, asks its
//! manager's policies whether to refresh from or save to the store.
//! [`SessionState`] is the lock-protected part the store reads and rewrites.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

use nosql_session_core::{SavePolicy, SessionError, SessionResult};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::AttributeValue;
use crate::lifecycle::SessionListenerRef;
use crate::manager::SessionManager;
use crate::record::now_millis;
use crate::store::RefreshOutcome;

/// Attributes and bookkeeping for one session, as held by this process.
#[derive(Debug)]
pub struct SessionState {
    cluster_id: String,
    created: i64,
    accessed: i64,
    valid: bool,
    attributes: BTreeMap<String, AttributeValue>,
    dirty: BTreeSet<String>,
    version: Option<i64>,
    last_sync: i64,
    listener: SessionListenerRef,
}

impl SessionState {
    pub fn new(
        cluster_id: impl Into<String>,
        created: i64,
        accessed: i64,
        version: Option<i64>,
        listener: SessionListenerRef,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            created,
            accessed,
            valid: true,
            attributes: BTreeMap::new(),
            dirty: BTreeSet::new(),
            version,
            last_sync: accessed,
            listener,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn accessed(&self) -> i64 {
        self.accessed
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Last version this process observed in the store for its context.
    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Option<i64>) {
        self.version = version;
    }

    pub fn last_sync(&self) -> i64 {
        self.last_sync
    }

    pub(crate) fn mark_synced(&mut self, at: i64) {
        self.last_sync = at;
    }

    pub(crate) fn touch(&mut self, at: i64) {
        self.accessed = self.accessed.max(at);
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    pub fn will_passivate(&self) {
        self.listener.will_passivate(&self.cluster_id, &self.attributes);
    }

    pub fn did_activate(&self) {
        self.listener.did_activate(&self.cluster_id, &self.attributes);
    }

    /// Drop every attribute without marking anything dirty.
    pub fn clear_attributes(&mut self) {
        let cleared = std::mem::take(&mut self.attributes);
        for (name, value) in &cleared {
            self.listener.value_unbound(&self.cluster_id, name, value);
        }
    }

    /// Application-level put (`Some`) or remove (`None`). Marks `name` dirty.
    pub fn put_or_remove(
        &mut self,
        name: &str,
        value: Option<AttributeValue>,
    ) -> Option<AttributeValue> {
        self.dirty.insert(name.to_string());
        let old = match value {
            Some(value) => {
                self.bind_value(name, &value);
                self.attributes.insert(name.to_string(), value)
            }
            None => self.attributes.remove(name),
        };
        if let Some(old) = &old {
            self.listener.value_unbound(&self.cluster_id, name, old);
        }
        old
    }

    /// Install a value read from the store. Not a change, so not dirty.
    pub(crate) fn restore_attribute(&mut self, name: String, value: AttributeValue) {
        self.bind_value(&name, &value);
        self.attributes.insert(name, value);
    }

    pub fn bind_value(&self, name: &str, value: &AttributeValue) {
        self.listener.value_bound(&self.cluster_id, name, value);
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Take the names changed since the last save, leaving the set empty.
    pub fn take_dirty(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.dirty)
    }

    /// Put back names whose save failed, so the next save retries them.
    pub(crate) fn restore_dirty(&mut self, names: BTreeSet<String>) {
        self.dirty.extend(names);
    }

    /// Mark the session invalid locally, unbinding every attribute.
    pub fn invalidate(&mut self) {
        if !self.valid {
            return;
        }
        self.clear_attributes();
        self.dirty.clear();
        self.valid = false;
    }
}

/// Handle to an in-memory session shared by concurrent request handlers.
#[derive(Debug)]
pub struct SessionProxy {
    cluster_id: String,
    created: i64,
    active: AtomicUsize,
    state: Mutex<SessionState>,
    manager: Weak<SessionManager>,
}

impl SessionProxy {
    pub(crate) fn new(state: SessionState, active: usize, manager: Weak<SessionManager>) -> Self {
        Self {
            cluster_id: state.cluster_id().to_string(),
            created: state.created(),
            active: AtomicUsize::new(active),
            state: Mutex::new(state),
            manager,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    /// Number of requests currently using this session.
    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Start handling a request. Returns `false` if the session is no longer valid,
    /// in which case the request is not counted and must not be completed.
    ///
    /// The first of several concurrent accesses may refresh from the store,
    /// depending on the stale policy.
    pub async fn access(&self) -> bool {
        let first = self.active.fetch_add(1, Ordering::SeqCst) == 0;
        let now = now_millis();
        let manager = self.manager.upgrade();

        let mut state = self.state.lock().await;
        if first {
            if let Some(manager) = &manager {
                if manager.refresh_due(&state, now) {
                    let outcome = manager.store().refresh(&mut state).await;
                    debug!(session_id = %self.cluster_id, ?outcome, "Refreshed on access");
                    if outcome == RefreshOutcome::Invalidated {
                        drop(state);
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        manager.forget(&self.cluster_id).await;
                        return false;
                    }
                }
            }
        }

        if !state.is_valid() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        state.touch(now);
        true
    }

    /// Finish handling a request. The last concurrent completion applies the save policy.
    pub async fn complete(&self) {
        let previous = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {}
            Ok(_) => return,
            Err(_) => {
                warn!(session_id = %self.cluster_id, "complete() called without a matching access");
                return;
            }
        }

        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut state = self.state.lock().await;
        if !state.is_valid() {
            return;
        }

        let save = match manager.settings().save_policy {
            SavePolicy::Always => true,
            SavePolicy::IfDirty | SavePolicy::OnChange => state.is_dirty(),
            SavePolicy::Never => false,
        };
        if save {
            manager.store().save(&mut state, true).await;
        }
    }

    pub async fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.state.lock().await.attribute(name).cloned()
    }

    pub async fn attribute_names(&self) -> Vec<String> {
        self.state.lock().await.names()
    }

    /// Set an attribute, returning the previous value.
    pub async fn set_attribute(
        &self,
        name: &str,
        value: impl Into<AttributeValue>,
    ) -> SessionResult<Option<AttributeValue>> {
        self.put_or_remove(name, Some(value.into())).await
    }

    /// Remove an attribute, returning the previous value.
    pub async fn remove_attribute(&self, name: &str) -> SessionResult<Option<AttributeValue>> {
        self.put_or_remove(name, None).await
    }

    async fn put_or_remove(
        &self,
        name: &str,
        value: Option<AttributeValue>,
    ) -> SessionResult<Option<AttributeValue>> {
        let mut state = self.state.lock().await;
        if !state.is_valid() {
            return Err(SessionError::Invalidated(self.cluster_id.clone()));
        }
        let old = state.put_or_remove(name, value);

        if let Some(manager) = self.manager.upgrade() {
            if manager.settings().save_policy == SavePolicy::OnChange {
                manager.store().save(&mut state, true).await;
            }
        }
        Ok(old)
    }

    /// Invalidate the session. Always writes `valid=false`, whatever the save policy.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if !state.is_valid() {
            return;
        }
        state.invalidate();

        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        manager.store().save(&mut state, false).await;
        drop(state);
        manager.forget(&self.cluster_id).await;
    }

    /// Drop local state after another component invalidated the id. No store write.
    pub(crate) async fn invalidate_locally(&self) {
        self.state.lock().await.invalidate();
    }

    pub async fn is_valid(&self) -> bool {
        self.state.lock().await.is_valid()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.is_dirty()
    }

    pub async fn version(&self) -> Option<i64> {
        self.state.lock().await.version()
    }

    pub async fn accessed(&self) -> i64 {
        self.state.lock().await.accessed()
    }

    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, SessionState> {
        self.state.lock().await
    }
}
