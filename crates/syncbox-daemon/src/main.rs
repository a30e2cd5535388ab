//! Syncbox Daemon - Background synchronization service
//!
//! This binary runs as a user service and handles:
//! - Loading and validating the YAML configuration
//! - Wiring the Local Index, REST adapter, transfer scheduler and engine
//! - Watching the sync root for local changes
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon builds every component once, starts the file system monitor
//! and the sync engine, then waits on a `CancellationToken` that is
//! triggered on receipt of SIGTERM or SIGINT. Shutdown stops the engine
//! (which quiesces the monitor), disposes the transfer schedulers and
//! closes the database.
//!
//! # Usage
//!
//! ```text
//! syncboxd [CONFIG_PATH]
//! ```
//!
//! Without an argument the platform default path is used
//! (`$XDG_CONFIG_HOME/syncbox/config.yaml` on Linux).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use syncbox_cache::DatabasePool;
use syncbox_core::config::Config;
use syncbox_core::domain::{Credentials, DeviceId, SyncboxId};
use syncbox_core::ports::RestSettings;
use syncbox_rest::{HttpClient, RestRemoteStore, DEFAULT_USER_AGENT};
use syncbox_sync::engine::StartStatus;
use syncbox_sync::filesystem::LocalTree;
use syncbox_sync::metrics::SyncMetrics;
use syncbox_sync::{
    EngineEvent, FileSystemMonitor, SyncEngine, SyncboxContext, TransferConfig,
    TransferScheduler,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

// ============================================================================
// DaemonService
// ============================================================================

/// Owns the configuration and the shutdown token for one daemon run
struct DaemonService {
    config: Config,
    shutdown: CancellationToken,
}

impl DaemonService {
    fn new(config: Config, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// Build every component, run until shutdown, then tear down in order
    async fn run(&self) -> Result<()> {
        let config = &self.config;
        let syncbox_id = SyncboxId::new(config.remote.syncbox_id);

        let db_pool = DatabasePool::new(&config.sync.database)
            .await
            .context("Failed to open the local index")?;
        let index = Arc::new(db_pool.index());
        info!(database = %config.sync.database.display(), "Local index opened");

        let credentials = Credentials::new(
            config.remote.api_key.clone().unwrap_or_default(),
            config.remote.api_secret.clone().unwrap_or_default(),
        );
        if !credentials.is_valid() {
            warn!("No API credentials configured; remote requests will be rejected");
        }
        let settings = RestSettings {
            device_id: DeviceId::new(config.sync.device_id.clone())
                .context("Invalid device id")?,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        };
        let base_url = Url::parse(&config.remote.base_url).context("Invalid remote base URL")?;
        let remote = Arc::new(RestRemoteStore::new(
            HttpClient::new().context("Failed to create HTTP client")?,
            base_url,
            settings,
            credentials,
            syncbox_id,
            config.transfers.request_timeout(),
        ));

        let metrics = Arc::new(SyncMetrics::new().context("Failed to register metrics")?);
        let context = Arc::new(SyncboxContext::new(syncbox_id));
        context.configure_scheduler(Arc::new(TransferScheduler::new(
            remote.clone(),
            TransferConfig::from_settings(&config.transfers),
            Some(Arc::clone(&metrics)),
        )))?;

        let tree = LocalTree::new(&config.sync.root);
        let engine = SyncEngine::builder(Arc::clone(&context), index, remote, tree.clone())
            .metrics(Arc::clone(&metrics))
            .poll_interval(config.sync.poll_interval())
            .build()?;

        let monitor = FileSystemMonitor::start(
            tree,
            engine.ids(),
            config.sync.debounce_delay(),
            engine.change_sender(),
        )
        .context("Failed to watch the sync root")?;
        engine.attach_monitor(monitor).await;

        let reporter = tokio::spawn(report_events(engine.subscribe(), self.shutdown.clone()));

        let result = match engine.start().await {
            Ok(StartStatus::Started | StartStatus::AlreadyRunning) => {
                info!(
                    root = %config.sync.root.display(),
                    syncbox = %syncbox_id,
                    poll_interval_secs = config.sync.poll_interval,
                    "Synchronization running"
                );
                self.shutdown.cancelled().await;
                info!("Shutdown signal received");
                Ok(())
            }
            Ok(StartStatus::Reserved) => Err(anyhow::anyhow!(
                "syncbox {syncbox_id} is reserved by another operation"
            )),
            Err(e) => Err(e).context("Failed to start the sync engine"),
        };

        engine.stop().await;
        context.dispose_schedulers().await;
        self.shutdown.cancel();
        if let Err(e) = reporter.await {
            warn!(error = %e, "Event reporter task failed");
        }
        match metrics.encode() {
            Ok(text) => debug!(metrics = %text, "Final metrics"),
            Err(e) => debug!(error = %e, "Failed to encode metrics"),
        }
        db_pool.close().await;

        result
    }
}

/// Log engine events until shutdown
async fn report_events(mut events: broadcast::Receiver<EngineEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(EngineEvent::PassCompleted(report)) => info!(
                counter = %report.counter,
                uploaded = report.uploaded,
                downloaded = report.downloaded,
                deleted = report.deleted_local + report.deleted_remote,
                renamed = report.renamed_local + report.renamed_remote,
                conflicts = report.conflicts.len(),
                errors = report.errors.len(),
                duration_ms = report.duration_ms,
                "Sync cycle completed"
            ),
            Ok(EngineEvent::PassFailed(reason)) => warn!(reason = %reason, "Sync cycle failed"),
            Ok(EngineEvent::Conflict(conflict)) => info!(
                path = %conflict.path,
                winner = conflict.winner.as_str(),
                reason = %conflict.reason(),
                "Conflict resolved"
            ),
            Ok(EngineEvent::StateChanged(state)) => debug!(state = %state, "Engine state"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// Signals and logging
// ============================================================================

/// Wait for SIGINT or SIGTERM, then cancel `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

/// `RUST_LOG` wins; otherwise the configured level
fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config = Config::load_or_default(&path);
    init_tracing(&config);

    info!(config_path = %path.display(), "Syncbox daemon starting (syncboxd)");
    let config = config
        .validated()
        .context("Invalid configuration, refusing to start")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = DaemonService::new(config, shutdown).run().await;
    match &result {
        Ok(()) => info!("Syncbox daemon shut down gracefully"),
        Err(e) => error!(error = %format!("{e:#}"), "Syncbox daemon exiting with error"),
    }
    result
}
