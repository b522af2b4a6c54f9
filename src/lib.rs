//! The Small POS - offline-first order capture and sync engine
//!
//! Orders are captured against a local SQLite store and never wait for the
//! network. Every accepted change becomes a queued sync operation that a
//! background dispatcher ships to the admin dashboard in FIFO batches.
//!
//! The library is built from injected parts: `SqliteStore` behind the
//! `DurableStore` trait, a `SyncQueue` over it, an `OrderSession` for the
//! terminal UI and a `SyncDispatcher` talking to a `RemoteSyncClient`.
//! `run()` and `sync_once()` wire them together for the `pos-sync-agent`
//! binary.

use anyhow::{anyhow, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod fiscal;
pub mod logging;
pub mod order;
pub mod queue;
pub mod remote;
pub mod session;
pub mod store;

pub use config::{DispatcherConfig, RemoteConfig, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use dispatcher::{AckedOperation, CycleOutcome, CycleReport, SyncDispatcher, SyncStatus};
pub use error::{PosError, PosResult};
pub use fiscal::{FiscalReceipt, FiscalSigner};
pub use order::{transition, NewItem, Order, OrderAction, OrderStatus, PaymentMethod};
pub use queue::{RejectionKind, SyncOpType, SyncOperation, SyncQueue, SyncRejection};
pub use remote::{HttpSyncClient, RemoteSyncClient};
pub use session::{DispatchReceipt, Durability, OrderSession};
pub use store::{DurableStore, SqliteStore};

/// Everything `run` and `sync_once` share: logging, database, credentials,
/// remote client and dispatcher.
struct Agent {
    config: SyncConfig,
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteSyncClient>,
    monitor: Arc<ConnectivityMonitor>,
    dispatcher: Arc<SyncDispatcher>,
    _log_guard: WorkerGuard,
}

impl Agent {
    async fn start() -> anyhow::Result<Self> {
        let data_dir = config::resolve_data_dir();
        let log_guard = logging::init_logging(&logging::log_dir(&data_dir))?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            revision = env!("POS_SYNC_REVISION"),
            "Starting POS sync agent"
        );

        let db = Arc::new(db::init(&data_dir).context("Failed to initialize database")?);
        let config = {
            let conn = db
                .conn
                .lock()
                .map_err(|e| anyhow!("database lock poisoned: {e}"))?;
            SyncConfig::load(data_dir.clone(), &conn)?
        };
        let credentials = credentials::load_credentials().context(
            "Terminal not configured: run `pos-sync-agent configure <admin-url> <terminal-id> <api-key>` \
             or set POS_ADMIN_URL, POS_TERMINAL_ID and POS_API_KEY",
        )?;
        info!(
            admin_url = %credentials.admin_url,
            terminal_id = %credentials.terminal_id,
            "Terminal credentials loaded"
        );

        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::new(db));
        let queue = Arc::new(SyncQueue::open(Arc::clone(&store))?);
        let remote: Arc<dyn RemoteSyncClient> =
            Arc::new(HttpSyncClient::new(&RemoteConfig::new(credentials, &config))?);

        let monitor = Arc::new(ConnectivityMonitor::new(remote.is_reachable().await));
        if !monitor.is_online() {
            info!("Network offline; deferring remote sync and keeping queue pending");
        }

        let dispatcher = Arc::new(SyncDispatcher::new(
            queue,
            Arc::clone(&remote),
            Arc::clone(&monitor),
            config.dispatcher.clone(),
        ));

        Ok(Self {
            config,
            store,
            remote,
            monitor,
            dispatcher,
            _log_guard: log_guard,
        })
    }
}

/// Run the sync agent until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let agent = Agent::start().await?;
    let dispatcher = Arc::clone(&agent.dispatcher);

    let shutdown = CancellationToken::new();
    let tasks = vec![
        connectivity::spawn_health_probe(
            Arc::clone(&agent.remote),
            Arc::clone(&agent.monitor),
            agent.config.health_interval,
            shutdown.clone(),
        ),
        dispatcher.spawn(shutdown.clone()),
        spawn_ack_marker(
            dispatcher.subscribe_acks(),
            Arc::clone(&agent.store),
            shutdown.clone(),
        ),
        spawn_status_log(
            Arc::clone(&dispatcher),
            agent.config.status_log_interval,
            shutdown.clone(),
        ),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {e}");
        }
    }

    let status = dispatcher.status();
    info!(
        queue_depth = status.queue_depth,
        "POS sync agent stopped"
    );
    Ok(())
}

/// Run one sync cycle right away, mark acknowledged orders synced and return
/// the dispatcher status. A failed cycle is an error.
pub async fn sync_once() -> anyhow::Result<SyncStatus> {
    let agent = Agent::start().await?;
    let mut acks = agent.dispatcher.subscribe_acks();

    let report = agent.dispatcher.force_sync().await;
    while let Ok(ack) = acks.try_recv() {
        if let Err(e) = session::mark_order_synced(agent.store.as_ref(), &ack) {
            warn!(order_id = %ack.order_id, error = %e, "Failed to mark order synced");
        }
    }

    if let CycleOutcome::Failed { error, .. } = report.outcome {
        return Err(anyhow!(error).context("Sync cycle failed; operations stay queued"));
    }
    Ok(agent.dispatcher.status())
}

/// Store terminal credentials in the OS keyring.
pub fn configure(admin_url: &str, terminal_id: &str, api_key: &str) -> anyhow::Result<()> {
    credentials::store_credentials(&credentials::TerminalCredentials {
        admin_url: admin_url.to_string(),
        terminal_id: terminal_id.to_string(),
        api_key: api_key.to_string(),
    })?;
    Ok(())
}

/// Remove terminal credentials from the OS keyring.
pub fn reset() -> anyhow::Result<()> {
    credentials::clear_credentials()?;
    Ok(())
}

/// Mark stored orders synced as the dispatcher reports acknowledgements.
fn spawn_ack_marker(
    mut acks: broadcast::Receiver<AckedOperation>,
    store: Arc<dyn DurableStore>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let ack = tokio::select! {
                _ = shutdown.cancelled() => break,
                ack = acks.recv() => ack,
            };
            match ack {
                Ok(ack) => {
                    if let Err(e) = session::mark_order_synced(store.as_ref(), &ack) {
                        warn!(order_id = %ack.order_id, error = %e, "Failed to mark order synced");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Acknowledgement listener lagged; some orders stay unsynced locally");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_status_log(
    dispatcher: Arc<SyncDispatcher>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let status = dispatcher.status();
            info!(
                state = ?status.state,
                online = status.is_online,
                queue_depth = status.queue_depth,
                backoff = status.backoff,
                rejected = status.rejected_total,
                conflicts = status.conflicts_total,
                last_error = status.last_error.as_deref().unwrap_or(""),
                "Sync status"
            );
        }
    })
}
