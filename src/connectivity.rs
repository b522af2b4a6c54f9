//! Network connectivity signal.
//!
//! `ConnectivityMonitor` holds the current online/offline state in a tokio
//! `watch` channel. The dispatcher subscribes to it and treats an
//! offline -> online edge as "connectivity restored". The health probe keeps
//! the state current by checking the admin dashboard on an interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::remote::RemoteSyncClient;

#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current state. Returns `true` only on an offline -> online
    /// edge, i.e. when connectivity was restored.
    pub fn set_online(&self, online: bool) -> bool {
        let mut restored = false;
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            restored = online;
            *current = online;
            true
        });
        restored
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Probe the remote every `interval` and publish the result.
pub fn spawn_health_probe(
    remote: Arc<dyn RemoteSyncClient>,
    monitor: Arc<ConnectivityMonitor>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Health probe started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let online = remote.is_reachable().await;
            let was_online = monitor.is_online();
            if monitor.set_online(online) {
                info!("Network restored; resuming queued sync");
            } else if was_online && !online {
                info!("Network offline; deferring remote sync and keeping queue pending");
            }
        }
        info!("Health probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PosResult;
    use crate::queue::SyncOperation;
    use crate::remote::BatchOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_set_online_reports_only_restore_edges() {
        let monitor = ConnectivityMonitor::new(true);
        assert!(!monitor.set_online(true));
        assert!(!monitor.set_online(false));
        assert!(!monitor.is_online());
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }

    struct Toggle(AtomicBool);

    #[async_trait]
    impl RemoteSyncClient for Toggle {
        async fn push_batch(&self, batch: &[SyncOperation]) -> PosResult<BatchOutcome> {
            Ok(BatchOutcome::acknowledge_all(batch))
        }

        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_tracks_remote_reachability() {
        let remote = Arc::new(Toggle(AtomicBool::new(false)));
        let monitor = Arc::new(ConnectivityMonitor::new(true));
        let shutdown = CancellationToken::new();
        let handle = spawn_health_probe(
            remote.clone(),
            monitor.clone(),
            Duration::from_secs(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!monitor.is_online());

        remote.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(monitor.is_online());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
