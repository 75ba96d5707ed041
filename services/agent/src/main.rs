//! nodepool agent
//!
//! Runs the reconciliation loop over the resource pool until interrupted,
//! until the stop file appears, or until a driver fault.

use std::sync::Arc;

use anyhow::{Context, Result};
use nodepool_agent::config::Config;
use nodepool_agent::driver;
use nodepool_agent::reconciler::Reconciler;
use nodepool_agent::state::Store;
use nodepool_agent::worker::ReconcileWorker;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        db_path = %config.db_path.display(),
        driver = %config.driver,
        interval_secs = config.reconcile_interval_secs,
        "Starting nodepool agent"
    );

    let store = Arc::new(
        Store::open(&config.db_path)
            .with_context(|| format!("opening store {}", config.db_path.display()))?,
    );
    let catalog = Arc::new(config.load_catalog()?);
    let drivers = Arc::new(driver::from_config(&config, Arc::clone(&catalog))?);
    info!(driver = %drivers.name(), "Driver registry validated");

    let reconciler = Arc::new(Reconciler::new(store, catalog, drivers));
    let worker = ReconcileWorker::new(reconciler, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            (&mut worker_handle).await
        }
        result = &mut worker_handle => result,
    };

    match result {
        Ok(Ok(())) => {
            info!("Nodepool agent shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Reconciliation loop failed");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Reconciliation task panicked");
            Err(e.into())
        }
    }
}
