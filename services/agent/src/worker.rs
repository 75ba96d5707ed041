//! Reconciliation background worker.
//!
//! Runs [`Reconciler::tick`] on a periodic interval until shutdown is
//! signaled, the stop file appears, or a driver fault is reported.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::reconciler::{ReconcileError, ReconcileResult, Reconciler, TickStats};

/// Worker that drives the reconciliation loop.
pub struct ReconcileWorker {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    stop_file: PathBuf,
}

impl ReconcileWorker {
    pub fn new(reconciler: Arc<Reconciler>, config: &Config) -> Self {
        Self {
            reconciler,
            interval: Duration::from_secs(config.reconcile_interval_secs),
            stop_file: config.stop_file.clone(),
        }
    }

    /// Run until shutdown. Returns an error only for fatal faults.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ReconcileResult<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            stop_file = %self.stop_file.display(),
            "Starting reconcile worker"
        );

        match self.blocking(|r| r.rescue_lost()).await {
            Ok(rescued) if !rescued.is_empty() => info!(?rescued, "Rescued lost resources"),
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => error!(error = %e, "Lost resource rescue failed"),
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.stop_requested() {
                        break;
                    }
                    match self.blocking(|r| r.tick()).await {
                        Ok(stats) => log_stats(&stats),
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Reconciliation halted");
                            return Err(e);
                        }
                        Err(e) => error!(error = %e, "Reconciliation failed, retrying"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Ticks call driver steps that may block on the network.
    async fn blocking<T, F>(&self, f: F) -> ReconcileResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Reconciler) -> ReconcileResult<T> + Send + 'static,
    {
        let reconciler = Arc::clone(&self.reconciler);
        tokio::task::spawn_blocking(move || f(&reconciler))
            .await
            .map_err(|e| ReconcileError::Panicked(e.to_string()))?
    }

    /// The stop file is removed once seen.
    fn stop_requested(&self) -> bool {
        if !self.stop_file.exists() {
            return false;
        }
        info!(stop_file = %self.stop_file.display(), "Stop file found");
        if let Err(e) = std::fs::remove_file(&self.stop_file) {
            warn!(error = %e, "Failed to remove stop file");
        }
        true
    }
}

fn log_stats(stats: &TickStats) {
    if stats.is_idle() {
        debug!("Nothing to reconcile");
        return;
    }
    info!(
        resumed = stats.resumed,
        swept = stats.swept,
        promoted = stats.promoted,
        executed = stats.executed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        rebooted = stats.rebooted,
        lost = stats.lost,
        "Reconciliation complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{fake, DriverFault, DriverRegistry};
    use crate::state::{Resource, Store};
    use nodepool_engine::{Catalog, StepKind};

    fn worker(dir: &tempfile::TempDir, drivers: DriverRegistry, catalog: Arc<Catalog>) -> ReconcileWorker {
        let config = Config {
            reconcile_interval_secs: 1,
            stop_file: dir.path().join("execstop"),
            ..Config::default()
        };
        let store = Arc::new(Store::open_in_memory().unwrap());
        let reconciler = Arc::new(Reconciler::new(store, catalog, Arc::new(drivers)));
        ReconcileWorker::new(reconciler, &config)
    }

    fn builtin() -> Arc<Catalog> {
        Arc::new(Config::default().load_catalog().unwrap())
    }

    #[tokio::test]
    async fn test_stop_file_stops_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = builtin();
        let worker = worker(&dir, fake::registry(catalog.clone(), 1.0), catalog);
        std::fs::write(dir.path().join("execstop"), "").unwrap();

        let (_tx, rx) = watch::channel(false);
        worker.run(rx).await.unwrap();
        assert!(!dir.path().join("execstop").exists());
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_worker() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = builtin();
        let worker = worker(&dir, fake::registry(catalog.clone(), 1.0), catalog);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_driver_fault_halts_worker() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = builtin();
        let mut drivers = fake::registry(catalog.clone(), 1.0);
        drivers.register("custom1", StepKind::Exec, |_, _| {
            Err(DriverFault::Contract("unexpected reply".into()))
        });
        let worker = worker(&dir, drivers, catalog.clone());

        worker
            .reconciler
            .store()
            .transaction(|tx| {
                tx.insert_resource(&Resource::new("node-1", None))?;
                let mut action = nodepool_engine::Action::new("node-1");
                action
                    .init_process("custom", &catalog, chrono::Utc::now())
                    .unwrap();
                tx.upsert_action(&action)
            })
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let err = worker.run(rx).await.unwrap_err();
        assert!(matches!(err, ReconcileError::DriverFault { .. }));
    }
}
