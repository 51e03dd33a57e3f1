//! Node-wide registry of session ids, the scavenger, and cross-context invalidation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use nosql_session_core::{
    DocumentStoreRef, Filter, Projection, ScavengerConfig, SessionError, SessionResult, Value,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::record::{self, now_millis, ACCESSED, ID};
use crate::schedule::PeriodicTask;
use crate::store::{id_in_use, invalidate_record};

/// Attempts at generating an unused id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

/// Receives invalidate-by-id broadcasts from the registry.
#[async_trait]
pub trait SessionInvalidator: Send + Sync {
    /// Forget the session locally. Must not write the store.
    async fn invalidate_by_id(&self, id: &str);
}

pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy)]
struct ScavengeSettings {
    delay: Duration,
    period: Duration,
}

/// Tracks the session ids this node has handed out or loaded.
///
/// The store stays the source of truth; the registry only scopes which ids
/// the scavenger re-checks.
pub struct IdRegistry {
    documents: DocumentStoreRef,
    ids: Mutex<HashSet<String>>,
    subscribers: RwLock<Vec<(SubscriptionId, Weak<dyn SessionInvalidator>)>>,
    next_subscription: AtomicU64,
    worker_name: Option<String>,
    settings: std::sync::Mutex<ScavengeSettings>,
    task: std::sync::Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for IdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdRegistry")
            .field("worker_name", &self.worker_name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl IdRegistry {
    /// Create a registry over `documents`, ensuring the session indexes exist.
    pub async fn new(
        documents: DocumentStoreRef,
        worker_name: Option<String>,
    ) -> SessionResult<Arc<Self>> {
        record::ensure_indexes(&*documents).await?;
        let defaults = ScavengerConfig::default();
        Ok(Arc::new(Self {
            documents,
            ids: Mutex::new(HashSet::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            worker_name: worker_name.filter(|w| !w.is_empty()),
            settings: std::sync::Mutex::new(ScavengeSettings {
                delay: defaults.delay(),
                period: defaults.period(),
            }),
            task: std::sync::Mutex::new(None),
        }))
    }

    pub async fn from_config(
        documents: DocumentStoreRef,
        worker_name: Option<String>,
        config: &ScavengerConfig,
    ) -> SessionResult<Arc<Self>> {
        let registry = Self::new(documents, worker_name).await?;
        registry.set_scavenge_delay(config.delay())?;
        registry.set_scavenge_period(config.period())?;
        Ok(registry)
    }

    pub async fn add_session(&self, id: &str) {
        self.ids.lock().await.insert(id.to_string());
    }

    pub async fn remove_session(&self, id: &str) {
        self.ids.lock().await.remove(id);
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.ids.lock().await.contains(id)
    }

    pub async fn registered_ids(&self) -> Vec<String> {
        self.ids.lock().await.iter().cloned().collect()
    }

    /// Whether the store holds a valid record for `id`, on any node.
    pub async fn id_in_use(&self, id: &str) -> SessionResult<bool> {
        id_in_use(&*self.documents, id).await
    }

    /// Generate a cluster id no stored valid session uses.
    pub async fn new_session_id(&self) -> SessionResult<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = Uuid::new_v4().simple().to_string();
            if !self.id_in_use(&id).await? {
                return Ok(id);
            }
            debug!(session_id = %id, "Generated id already in use, retrying");
        }
        Err(SessionError::Config(format!(
            "could not generate an unused session id in {} attempts",
            MAX_ID_ATTEMPTS
        )))
    }

    /// Strip a node suffix (`<cluster>.<worker>`). A leading dot is part of the id.
    pub fn cluster_id(&self, node_id: &str) -> String {
        match node_id.rfind('.') {
            Some(pos) if pos > 0 => node_id[..pos].to_string(),
            _ => node_id.to_string(),
        }
    }

    /// Add this node's worker suffix, if one is configured.
    pub fn node_id(&self, cluster_id: &str) -> String {
        match &self.worker_name {
            Some(worker) => format!("{}.{}", cluster_id, worker),
            None => cluster_id.to_string(),
        }
    }

    /// Register a context-level manager for invalidate-by-id broadcasts.
    pub fn subscribe(&self, invalidator: Weak<dyn SessionInvalidator>) -> SessionResult<SubscriptionId> {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .write()
            .map_err(|e| SessionError::Config(format!("subscriber list poisoned: {}", e)))?
            .push((id, invalidator));
        debug!(subscription = id, "Subscribed to invalidations");
        Ok(id)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.retain(|(id, _)| *id != subscription);
        }
    }

    fn live_subscribers(&self) -> Vec<Arc<dyn SessionInvalidator>> {
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                subscribers.retain(|(_, weak)| weak.strong_count() > 0);
                subscribers.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
            }
            Err(e) => {
                warn!(error = %e, "Subscriber list poisoned");
                Vec::new()
            }
        }
    }

    /// Forget `id` on this node and tell every subscribed context to drop it.
    pub async fn invalidate_all(&self, id: &str) {
        self.remove_session(id).await;
        self.broadcast(id).await;
    }

    async fn broadcast(&self, id: &str) {
        let subscribers = self.live_subscribers();
        debug!(session_id = %id, contexts = subscribers.len(), "Broadcasting invalidation");
        for subscriber in subscribers {
            subscriber.invalidate_by_id(id).await;
        }
    }

    /// Invalidate registered ids whose stored `accessed` is older than the scavenge delay.
    ///
    /// Returns how many ids were scavenged.
    pub async fn scavenge(&self) -> SessionResult<usize> {
        let delay = self.settings()?.delay;
        let cutoff = now_millis().saturating_sub(delay.as_millis() as i64);

        let stale = {
            let mut ids = self.ids.lock().await;
            if ids.is_empty() {
                return Ok(0);
            }
            let filter = Filter::new()
                .is_in(ID, ids.iter().map(|id| Value::from(id.as_str())))
                .lt(ACCESSED, cutoff);
            let found = self
                .documents
                .find(&filter, Some(&Projection::of([ID])))
                .await?;

            let stale: Vec<String> = found
                .iter()
                .filter_map(|doc| doc.get(ID).and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            for id in &stale {
                ids.remove(id);
            }
            stale
        };

        for id in &stale {
            if let Err(e) = invalidate_record(&*self.documents, id).await {
                warn!(session_id = %id, error = %e, "Failed to mark scavenged session invalid");
            }
            self.broadcast(id).await;
        }

        if !stale.is_empty() {
            info!(count = stale.len(), "Scavenged stale sessions");
        }
        Ok(stale.len())
    }

    fn settings(&self) -> SessionResult<ScavengeSettings> {
        self.settings
            .lock()
            .map(|s| *s)
            .map_err(|e| SessionError::Config(format!("scavenger settings poisoned: {}", e)))
    }

    fn update_settings(&self, apply: impl FnOnce(&mut ScavengeSettings)) -> SessionResult<()> {
        if self.is_running() {
            return Err(SessionError::Config(
                "cannot change scavenger settings while it is running".to_string(),
            ));
        }
        let mut settings = self
            .settings
            .lock()
            .map_err(|e| SessionError::Config(format!("scavenger settings poisoned: {}", e)))?;
        apply(&mut settings);
        Ok(())
    }

    pub fn scavenge_delay(&self) -> Duration {
        self.settings().map(|s| s.delay).unwrap_or_default()
    }

    pub fn scavenge_period(&self) -> Duration {
        self.settings().map(|s| s.period).unwrap_or_default()
    }

    /// Age after which a registered session counts as stale. Zero disables scavenging.
    pub fn set_scavenge_delay(&self, delay: Duration) -> SessionResult<()> {
        self.update_settings(|s| s.delay = delay)
    }

    pub fn set_scavenge_period(&self, period: Duration) -> SessionResult<()> {
        if period.is_zero() {
            return Err(SessionError::Config(
                "scavenge period must be greater than zero".to_string(),
            ));
        }
        self.update_settings(|s| s.period = period)
    }

    /// Start the scavenger: first run after the scavenge delay, then every period.
    pub fn start(self: &Arc<Self>) -> SessionResult<()> {
        let settings = self.settings()?;
        let mut task = self
            .task
            .lock()
            .map_err(|e| SessionError::Config(format!("scavenger task poisoned: {}", e)))?;
        if task.is_some() {
            return Err(SessionError::Config("scavenger already running".to_string()));
        }
        if settings.delay.is_zero() {
            info!("Scavenging disabled");
            return Ok(());
        }

        let registry = Arc::downgrade(self);
        *task = Some(PeriodicTask::spawn(
            "scavenger",
            settings.delay,
            Some(settings.period),
            move || {
                let registry = registry.clone();
                async move {
                    if let Some(registry) = registry.upgrade() {
                        registry.scavenge_tick().await;
                    }
                }
            },
        ));
        info!(
            delay_secs = settings.delay.as_secs(),
            period_secs = settings.period.as_secs(),
            "Scavenger started"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn scavenge_tick(&self) {
        if let Err(e) = self.scavenge().await {
            warn!(error = %e, "Scavenge failed");
        }
    }

    /// Stop the scavenger, letting a tick in flight finish.
    pub async fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(e) => {
                warn!(error = %e, "Scavenger task poisoned");
                None
            }
        };
        if let Some(task) = task {
            task.stop().await;
            info!("Scavenger stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }
}
