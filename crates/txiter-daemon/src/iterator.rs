//! Iterator process assembly: stores, checkpoint, upstream, runtime and HTTP
//! server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;
use txiter_core::checkpoint::SqliteCheckpointStore;
use txiter_core::config::IteratorConfig;
use txiter_core::failover::FailoverTimer;
use txiter_core::observer::RuntimeObserver;
use txiter_core::runtime::{resume_point, ExitReason, RuntimeError, RuntimeSettings};
use txiter_core::source::SourcePoller;
use txiter_core::{
    DigestStore, IteratorIdentity, IteratorRuntime, ResolutionEngine, RoleMachine, RuntimeHandle,
    SeqNum, SqliteDigestStore,
};

use crate::http::{self, AppState};
use crate::metrics::{IteratorMetrics, MetricsRegistry};
use crate::rpc::JsonRpcSource;

/// A started iterator process.
pub struct RunningIterator {
    /// Control handle.
    pub handle: RuntimeHandle,
    /// Address the HTTP server is bound to.
    pub http_addr: SocketAddr,
    /// Resolves when the runtime loop exits.
    pub runtime: JoinHandle<Result<ExitReason, RuntimeError>>,
    /// Resolves when the HTTP server has shut down.
    pub server: JoinHandle<std::io::Result<()>>,
}

impl RunningIterator {
    /// Waits for the runtime and HTTP server to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if either task failed.
    pub async fn wait(self) -> Result<ExitReason> {
        let exit = self
            .runtime
            .await
            .context("iterator runtime task panicked")?
            .context("iterator runtime failed")?;
        self.server
            .await
            .context("HTTP server task panicked")?
            .context("HTTP server failed")?;
        Ok(exit)
    }
}

/// Opens everything `config` names and starts the runtime plus HTTP server.
///
/// `start_seq` overrides both the checkpoint and `config.start_seq`. The HTTP
/// server binds `listener` when given, otherwise `config.http_addr`.
///
/// # Errors
///
/// Returns an error if a store, the checkpoint, the upstream client or the
/// listener cannot be set up.
pub async fn start(
    config: &IteratorConfig,
    start_seq: Option<SeqNum>,
    listener: Option<TcpListener>,
) -> Result<RunningIterator> {
    let writer: Arc<dyn DigestStore> = Arc::new(
        SqliteDigestStore::open(&config.store.writer).with_context(|| {
            format!("failed to open digest store {}", config.store.writer.display())
        })?,
    );
    let reader: Arc<dyn DigestStore> = match &config.store.reader {
        Some(path) => Arc::new(
            SqliteDigestStore::open(path)
                .with_context(|| format!("failed to open replica {}", path.display()))?,
        ),
        None => Arc::clone(&writer),
    };

    let origin = match (start_seq, &config.checkpoint_db) {
        (Some(seq), _) => {
            info!(start_seq = seq, "Start seq# given on the command line, ignoring checkpoint");
            seq
        },
        (None, Some(path)) => {
            let checkpoints = SqliteCheckpointStore::open(path)
                .with_context(|| format!("failed to open checkpoint db {}", path.display()))?;
            resume_point(&checkpoints, &config.id, config.start_seq)
                .await
                .context("failed to load checkpoint")?
                .seq
        },
        (None, None) => config.start_seq,
    };

    let registry = Arc::new(MetricsRegistry::new());
    let metrics: Arc<dyn RuntimeObserver> = Arc::new(
        IteratorMetrics::new(registry.registry()).context("failed to register metrics")?,
    );

    let source = Arc::new(
        JsonRpcSource::new(&config.upstream, config.entity.clone())
            .context("failed to build upstream client")?,
    );
    let identity = IteratorIdentity {
        id: config.id.clone(),
        region: config.region.clone(),
        upstream_node: config.upstream.url.clone(),
    };
    let engine = ResolutionEngine::new(
        config.entity.clone(),
        writer,
        RoleMachine::new(config.initial_role).context("invalid initial role")?,
        FailoverTimer::new(config.failover_timeout),
        origin,
    )
    .with_reader(reader)
    .with_max_tracked(config.max_tracked)
    .with_observer(Arc::clone(&metrics));
    let poller = SourcePoller::new(source, config.upstream.poller_config(), origin)
        .with_observer(Arc::clone(&metrics));
    let runtime = IteratorRuntime::new(
        identity,
        engine,
        poller,
        RuntimeSettings {
            sweep_interval: config.sweep_interval,
            channel_capacity: config.channel_capacity,
        },
    )
    .with_observer(metrics);
    let handle = runtime.handle();

    let listener = match listener {
        Some(listener) => listener,
        None => TcpListener::bind(config.http_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.http_addr))?,
    };
    let http_addr = listener.local_addr().context("listener has no address")?;

    let mut stopped = handle.subscribe();
    let server = tokio::spawn(http::serve(
        listener,
        http::router(AppState::new(handle.clone(), Some(registry))),
        async move {
            let _ = stopped.wait_for(|status| status.role.is_terminating()).await;
        },
    ));

    info!(
        iterator_id = %config.id,
        entity = %config.entity,
        origin,
        role = %config.initial_role,
        failover_timeout = ?config.failover_timeout,
        %http_addr,
        "Iterator starting"
    );
    let runtime = tokio::spawn(runtime.run());

    Ok(RunningIterator {
        handle,
        http_addr,
        runtime,
        server,
    })
}
