use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

/// A background loop that runs a tick after an initial delay, then optionally on a period.
///
/// A failing or panicking tick is logged and never ends the loop.
#[derive(Debug)]
pub(crate) struct PeriodicTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn the loop. With no `period` the tick runs once.
    pub(crate) fn spawn<F, Fut>(
        name: &'static str,
        delay: Duration,
        period: Option<Duration>,
        tick: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            debug!(task = name, ?delay, ?period, "Periodic task started");

            if !wait_for_delay(delay, &mut rx).await {
                debug!(task = name, "Periodic task stopped before first run");
                return;
            }
            run_tick(name, &tick).await;

            let Some(period) = period else {
                debug!(task = name, "One-shot task finished");
                return;
            };

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.changed() => break,
                }
                if *rx.borrow() {
                    break;
                }
                run_tick(name, &tick).await;
            }
            debug!(task = name, "Periodic task stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it to exit. A tick in flight finishes first.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Periodic task ended abnormally");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Returns `false` if shutdown was requested during the delay.
async fn wait_for_delay(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => return false,
    }
    !*shutdown.borrow()
}

async fn run_tick<F, Fut>(name: &'static str, tick: &F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(tick()).await {
        error!(task = name, error = %e, "Periodic tick panicked");
    }
}
