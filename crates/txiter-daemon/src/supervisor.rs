//! Supervisor process assembly.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use txiter_core::checkpoint::SqliteCheckpointStore;
use txiter_core::config::SupervisorConfig;
use txiter_core::observer::SupervisorObserver;
use txiter_core::{IteratorControl, Supervisor};

use crate::control::HttpIteratorControl;
use crate::http;
use crate::metrics::{MetricsRegistry, SupervisorMetrics};

/// Builds a supervisor over HTTP-controlled iterators, reporting to
/// `registry` when given.
///
/// # Errors
///
/// Returns an error if the checkpoint database cannot be opened or a
/// control client cannot be built.
pub fn build(config: &SupervisorConfig, registry: Option<&MetricsRegistry>) -> Result<Supervisor> {
    let checkpoints = Arc::new(SqliteCheckpointStore::open(&config.checkpoint_db).with_context(
        || format!("failed to open checkpoint db {}", config.checkpoint_db.display()),
    )?);

    let controls = config
        .iterators
        .iter()
        .map(|endpoint| {
            HttpIteratorControl::new(endpoint, config.status_timeout)
                .map(|control| Arc::new(control) as Arc<dyn IteratorControl>)
                .with_context(|| format!("failed to build control client for {}", endpoint.id))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut supervisor = Supervisor::new(controls, checkpoints, config.settings());
    if let Some(registry) = registry {
        let metrics: Arc<dyn SupervisorObserver> = Arc::new(
            SupervisorMetrics::new(registry.registry()).context("failed to register metrics")?,
        );
        supervisor = supervisor.with_observer(metrics);
    }
    Ok(supervisor)
}

/// Runs the supervisor (and its metrics listener, if configured) until
/// `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an error if setup fails or the metrics listener cannot bind.
pub async fn run(config: &SupervisorConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let registry = Arc::new(MetricsRegistry::new());
    let supervisor = build(config, config.metrics_addr.map(|_| registry.as_ref()))?;

    let metrics_server = match config.metrics_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind metrics listener {addr}"))?;
            let mut stop = shutdown.clone();
            Some(tokio::spawn(http::serve(
                listener,
                http::metrics_router(Arc::clone(&registry)),
                async move {
                    let _ = stop.wait_for(|stop| *stop).await;
                },
            )))
        },
        None => None,
    };

    info!(
        iterators = config.iterators.len(),
        tie_break = ?config.tie_break,
        checkpoint_floor = ?config.checkpoint_floor,
        "Supervisor starting"
    );
    supervisor.run(shutdown).await;

    if let Some(server) = metrics_server {
        server
            .await
            .context("metrics server task panicked")?
            .context("metrics server failed")?;
    }
    Ok(())
}
