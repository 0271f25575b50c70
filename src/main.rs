// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Configuration loaded from the environment
// - schema:     Strongly typed chat and statistics records
// - util:       Shared helpers (target parsing, timestamps, counts)
// - retry:      Bounded exponential-backoff retry policy
// - health:     Shared per-worker health registry
// - metrics:    Process-wide runtime counters
// - store:      Persistence gateway (Postgres)
// - target:     Current-target resolution with fallback
// - feed:       Upstream live chat adapters
// - collector:  Workers and their supervisor
//
mod collector;
mod config;
mod feed;
mod health;
mod metrics;
mod retry;
mod schema;
mod store;
mod target;
mod util;

#[cfg(test)]
mod testing;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use env_logger::Env;
use log::{info, warn};
use rustls::crypto::{CryptoProvider, ring};
use tokio_util::sync::CancellationToken;

use collector::{WorkerContext, supervisor::Supervisor};
use config::Config;
use health::WorkerHealth;
use retry::RetryPolicy;
use store::Gateway;
use target::TargetResolver;

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// This is the runtime for the live chat collector worker.
//
// Responsibilities:
// - Initialize cryptography backend (rustls)
// - Load configuration and logging
// - Construct the persistence gateway (fatal on failure)
// - Start the supervisor and its workers
// - Shut down cleanly on Ctrl-C / SIGTERM
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation. This must be executed exactly once and
    // as early as possible in the process lifecycle.
    //
    // Both reqwest and sqlx share this provider.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    let cfg = Config::from_env().context("invalid configuration")?;

    env_logger::Builder::from_env(Env::default().default_filter_or(cfg.log_level.as_str()))
        .format_timestamp_millis()
        .init();

    info!("Starting live chat collector");
    info!("{cfg:?}");

    // --------------------------------------------------------
    // Persistence gateway
    //
    // NOTE:
    // - Without a database there is nothing to do; any failure
    //   here terminates the process.
    // --------------------------------------------------------
    let gateway = Gateway::connect(&cfg.database)
        .await
        .context("failed to connect to Postgres")?;

    if cfg.database.run_migrations {
        gateway
            .migrate()
            .await
            .context("failed to apply migrations")?;
    }

    let retry = RetryPolicy::from_config(&cfg.retry);

    let feed = feed::build_feed(&cfg.feed, retry).context("failed to build feed client")?;
    info!("Using {} feed", feed.name());

    let store: Arc<dyn store::ChatStore> = Arc::new(gateway.clone());
    let ctx = WorkerContext {
        store: store.clone(),
        feed,
        resolver: TargetResolver::new(
            store,
            cfg.database.target_setting_key.clone(),
            cfg.feed.fallback_target.clone(),
        ),
        health: Arc::new(WorkerHealth::new()),
        retry,
    };

    // --------------------------------------------------------
    // Metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    let reporter_cancel = CancellationToken::new();
    let reporter = (cfg.metrics_interval_secs > 0).then(|| {
        tokio::spawn(metrics::run_reporter(
            Duration::from_secs(cfg.metrics_interval_secs),
            reporter_cancel.clone(),
        ))
    });

    let mut supervisor = Supervisor::new(ctx, cfg.schedule.clone(), cfg.backfill_enabled);
    supervisor.start().await?;

    shutdown_signal().await;
    info!("Shutdown requested");

    supervisor.stop().await;

    reporter_cancel.cancel();
    if let Some(reporter) = reporter {
        if let Err(e) = reporter.await {
            warn!("metrics reporter ended abnormally: {e}");
        }
    }
    info!("[METRICS] final {}", metrics::METRICS.summary());

    gateway.close().await;
    info!("Stopped");

    Ok(())
}

// ------------------------------------------------------------
// Shutdown signal
// ------------------------------------------------------------
//
// Resolves on Ctrl-C, or SIGTERM on unix (container stop).
// A signal handler that cannot be installed is logged and
// treated as never firing.
//
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
