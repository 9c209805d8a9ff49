//! Coffer scanner: values every tracked address on a fixed schedule.
//!
//! Flow:
//! 1. Connect to PostgreSQL and apply migrations
//! 2. Build the monitor from the environment (scanners, price sources, notifier)
//! 3. Run a scan cycle every `SCAN_INTERVAL_SECS`
//! 4. On Ctrl-C, cancel the running cycle (its batch is still closed) and exit

use std::sync::Arc;

use coffer_core::{Settings, telemetry};
use coffer_monitor::{AssetMonitor, MonitorError, PgStore};
use coffer_storage as storage;
use eyre::Result;
use tokio::time::MissedTickBehavior;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let settings = Arc::new(Settings::from_env()?);

    tracing::info!(
        interval_secs = settings.scan_interval.as_secs(),
        price_sources = ?settings.price_sources,
        "Starting Coffer scanner"
    );

    let pool = storage::connect(&settings.database_url).await?;
    tracing::info!("Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let store = Arc::new(PgStore::new(pool));
    let monitor = AssetMonitor::new(store, Arc::clone(&settings))?;

    let mut ticker = tokio::time::interval(settings.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !settings.scan_on_start {
        // The first tick fires immediately.
        ticker.tick().await;
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down gracefully…");
                monitor.close().await;
                break;
            }
            _ = ticker.tick() => {}
        }

        let scan = monitor.scan();
        tokio::pin!(scan);
        let (outcome, stopping) = tokio::select! {
            outcome = &mut scan => (outcome, false),
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, cancelling running scan…");
                let (outcome, ()) = tokio::join!(scan, monitor.close());
                (outcome, true)
            }
        };

        match outcome {
            Ok(result) if result.all_failed() => {
                tracing::warn!(batch_id = result.batch_id, "Every scanner failed this cycle");
            }
            Ok(_) => {}
            Err(MonitorError::ScanInProgress) => {
                tracing::warn!("Previous scan still running, skipping tick");
            }
            Err(e) => tracing::error!(error = %e, "Scan cycle failed, retrying next tick"),
        }

        if stopping {
            break;
        }
    }

    tracing::info!("Scanner stopped.");
    Ok(())
}
