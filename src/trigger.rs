//! Flush trigger plumbing.
//!
//! Every way a sync can start (app startup with a backlog, the transition
//! back online, the periodic timer, an explicit user request) funnels into
//! one loop that calls [`OfflineSyncStore::flush`]. The store's flush lock
//! makes overlapping triggers coalesce, so this loop never has to dedupe.
//! One subscription, one teardown path.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::sync::OfflineSyncStore;

/// Process-wide online/offline signal. Platform glue (or the CLI) flips it;
/// the store and the trigger loop observe it.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn set_online(&self, online: bool) {
        // send_if_modified: only real transitions wake the trigger loop.
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Handle for the "explicit user request" trigger.
#[derive(Debug, Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<()>,
}

impl FlushHandle {
    pub fn request(&self) {
        // A full channel already has a wakeup queued; dropping is fine.
        let _ = self.tx.try_send(());
    }
}

/// The running trigger loop; dropping the struct leaves the task running,
/// call [`TriggerLoop::shutdown`] for a clean stop.
pub struct TriggerLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TriggerLoop {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the single flush loop. `interval` is the periodic fallback
/// (`app.flush_interval_secs`).
pub fn spawn(
    store: Arc<OfflineSyncStore>,
    connectivity: &Connectivity,
    interval: Duration,
) -> (TriggerLoop, FlushHandle) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (manual_tx, mut manual_rx) = mpsc::channel::<()>(1);
    let mut online_rx = connectivity.subscribe();

    let task = tokio::spawn(async move {
        // Startup trigger: only when a backlog survived the restart.
        match store.pending_count().await {
            Ok(n) if n > 0 => {
                info!(pending = n, "startup backlog detected");
                run_flush(&store).await;
            }
            Ok(_) => {}
            Err(err) => error!(?err, "startup pending count failed"),
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // An interval's first tick completes immediately; the startup check
        // above already covered it.
        ticker.tick().await;

        let mut online_alive = true;
        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("trigger loop shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    run_flush(&store).await;
                }
                changed = online_rx.changed(), if online_alive => {
                    match changed {
                        Ok(()) => {
                            if *online_rx.borrow() {
                                info!("device back online");
                                run_flush(&store).await;
                            }
                        }
                        // Connectivity source dropped; timer keeps the loop useful.
                        Err(_) => online_alive = false,
                    }
                }
                Some(()) = manual_rx.recv() => {
                    info!("manual sync requested");
                    run_flush(&store).await;
                }
            }
        }
    });

    (
        TriggerLoop {
            shutdown: shutdown_tx,
            task,
        },
        FlushHandle { tx: manual_tx },
    )
}

async fn run_flush(store: &OfflineSyncStore) {
    match store.flush().await {
        Ok(report) => info!(%report, "flush trigger handled"),
        Err(err) => error!(?err, "flush failed"),
    }
}
