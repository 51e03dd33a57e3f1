use std::sync::{Arc, Mutex};
use std::time::Duration;

use nosql_session_core::{
    DocumentStoreRef, Filter, Projection, PurgerConfig, SessionError, SessionResult, Value,
};
use tracing::{info, instrument, warn};

use crate::record::{self, now_millis, ACCESSED, ID};
use crate::schedule::PeriodicTask;

#[derive(Debug, Clone, Copy)]
struct PurgeSettings {
    delay: Duration,
    period: Option<Duration>,
    minimal_purge_age: Duration,
}

/// Deletes session records nobody has accessed for `minimal_purge_age`, cluster-wide.
#[derive(Debug)]
pub struct SessionPurger {
    documents: DocumentStoreRef,
    settings: Mutex<PurgeSettings>,
    task: Mutex<Option<PeriodicTask>>,
}

impl SessionPurger {
    pub async fn new(documents: DocumentStoreRef) -> SessionResult<Arc<Self>> {
        record::ensure_indexes(&*documents).await?;
        let defaults = PurgerConfig::default();
        Ok(Arc::new(Self {
            documents,
            settings: Mutex::new(PurgeSettings {
                delay: defaults.delay(),
                period: defaults.period(),
                minimal_purge_age: defaults.minimal_purge_age(),
            }),
            task: Mutex::new(None),
        }))
    }

    pub async fn from_config(
        documents: DocumentStoreRef,
        config: &PurgerConfig,
    ) -> SessionResult<Arc<Self>> {
        let purger = Self::new(documents).await?;
        purger.set_purge_delay(config.delay())?;
        purger.set_purge_period(config.period())?;
        purger.set_minimal_purge_age(config.minimal_purge_age())?;
        Ok(purger)
    }

    /// Remove every record last accessed before `now - minimal_purge_age`.
    ///
    /// Each delete re-checks the age, so a record touched since the scan survives.
    pub async fn purge(&self) -> SessionResult<usize> {
        let age = self.settings()?.minimal_purge_age;
        let cutoff = now_millis().saturating_sub(age.as_millis() as i64);

        let found = self
            .documents
            .find(&Filter::new().lt(ACCESSED, cutoff), Some(&Projection::of([ID])))
            .await?;

        let mut purged = 0;
        for doc in &found {
            let Some(id) = doc.get(ID).and_then(Value::as_str) else {
                continue;
            };
            let filter = Filter::new().eq(ID, id).lt(ACCESSED, cutoff);
            match self.documents.remove(&filter).await {
                Ok(n) => purged += n,
                Err(e) => warn!(session_id = %id, error = %e, "Failed to purge session"),
            }
        }

        info!(purged, scanned = found.len(), "Purged old sessions");
        Ok(purged)
    }

    fn settings(&self) -> SessionResult<PurgeSettings> {
        self.settings
            .lock()
            .map(|s| *s)
            .map_err(|e| SessionError::Config(format!("purger settings poisoned: {}", e)))
    }

    fn update_settings(&self, apply: impl FnOnce(&mut PurgeSettings)) -> SessionResult<()> {
        if self.is_running() {
            return Err(SessionError::Config(
                "cannot change purger settings while it is running".to_string(),
            ));
        }
        let mut settings = self
            .settings
            .lock()
            .map_err(|e| SessionError::Config(format!("purger settings poisoned: {}", e)))?;
        apply(&mut settings);
        Ok(())
    }

    pub fn set_purge_delay(&self, delay: Duration) -> SessionResult<()> {
        self.update_settings(|s| s.delay = delay)
    }

    /// `None` runs a single purge after the delay.
    pub fn set_purge_period(&self, period: Option<Duration>) -> SessionResult<()> {
        if period.is_some_and(|p| p.is_zero()) {
            return Err(SessionError::Config(
                "purge period must be greater than zero".to_string(),
            ));
        }
        self.update_settings(|s| s.period = period)
    }

    pub fn set_minimal_purge_age(&self, age: Duration) -> SessionResult<()> {
        self.update_settings(|s| s.minimal_purge_age = age)
    }

    pub fn minimal_purge_age(&self) -> Duration {
        self.settings()
            .map(|s| s.minimal_purge_age)
            .unwrap_or_default()
    }

    pub fn start(self: &Arc<Self>) -> SessionResult<()> {
        let settings = self.settings()?;
        let mut task = self
            .task
            .lock()
            .map_err(|e| SessionError::Config(format!("purger task poisoned: {}", e)))?;
        if task.is_some() {
            return Err(SessionError::Config("purger already running".to_string()));
        }

        let purger = Arc::downgrade(self);
        *task = Some(PeriodicTask::spawn(
            "purger",
            settings.delay,
            settings.period,
            move || {
                let purger = purger.clone();
                async move {
                    if let Some(purger) = purger.upgrade() {
                        purger.purge_tick().await;
                    }
                }
            },
        ));
        info!(
            delay_secs = settings.delay.as_secs(),
            period_secs = ?settings.period.map(|p| p.as_secs()),
            minimal_purge_age_secs = settings.minimal_purge_age.as_secs(),
            "Purger started"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_tick(&self) {
        if let Err(e) = self.purge().await {
            warn!(error = %e, "Purge failed");
        }
    }

    pub async fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(e) => {
                warn!(error = %e, "Purger task poisoned");
                None
            }
        };
        if let Some(task) = task {
            task.stop().await;
            info!("Purger stopped");
        }
    }

    /// True from `start` until `stop`, including after a one-shot purge has run.
    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }
}
