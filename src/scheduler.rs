//! Recurring background tasks
//!
//! Each task is a named tokio interval loop. All loops share one shutdown
//! signal; a failing run is logged and the loop keeps going.

use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::keystore::KeyStore;
use crate::matching::MatchingOrchestrator;

pub const KEYSTORE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const SUMMARY_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Run `task` every `period`, starting one period from now.
    pub fn spawn_every<F, Fut>(&mut self, name: &str, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task().await {
                            warn!(task = %task_name, "scheduled task failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!(task = %task_name, "scheduled task stopping");
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.push((name.to_string(), handle));
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Signal every loop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = %name, "scheduled task panicked: {}", e);
            }
        }
    }
}

/// Register the service's recurring work.
pub fn spawn_default_tasks(
    scheduler: &mut Scheduler,
    keystore: Arc<dyn KeyStore>,
    orchestrator: Arc<MatchingOrchestrator>,
) {
    scheduler.spawn_every("keystore_sweep", KEYSTORE_SWEEP_INTERVAL, move || {
        let keystore = keystore.clone();
        async move {
            let purged = keystore.purge_expired().await?;
            if purged > 0 {
                debug!(purged, "expired keys purged");
            }
            Ok(())
        }
    });

    scheduler.spawn_every("pacing_summary", SUMMARY_INTERVAL, move || {
        let orchestrator = orchestrator.clone();
        async move { log_summary(&orchestrator).await }
    });
}

async fn log_summary(orchestrator: &MatchingOrchestrator) -> Result<()> {
    let now = Utc::now();
    let version = orchestrator.cache().current_version().await?;
    let remaining_quota = orchestrator.fraud().sivt().remaining_quota(now).await?;
    let report = orchestrator.store().ivt_report(now.date_naive()).await?;

    info!(
        cache_version = version,
        sivt_quota_remaining = remaining_quota,
        impressions = report.total_impressions,
        clicks = report.total_clicks,
        givt = report.givt_events,
        sivt = report.sivt_events,
        ivt_rate = format!("{:.2}%", report.ivt_rate * 100.0),
        "📈 pipeline summary"
    );
    Ok(())
}
