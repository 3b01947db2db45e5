//! Driver - 一定間隔で `process_due` を回すループ

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::scheduler::Scheduler;

/// Handle to a running driver loop.
/// - `request_shutdown()` stops new passes; a pass already running finishes
/// - `shutdown_and_join()` also waits for the loop to exit
pub struct Driver {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl Driver {
    /// Spawn the loop. The first pass runs immediately.
    pub fn spawn(scheduler: Arc<Scheduler>, poll_interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            driver_loop(scheduler, poll_interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "driver loop ended abnormally");
        }
    }
}

async fn driver_loop(
    scheduler: Arc<Scheduler>,
    poll_interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    // A long pass should not be followed by a burst of catch-up passes.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        worker = %scheduler.worker_id(),
        interval_secs = poll_interval.as_secs_f64(),
        "driver started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped counts as shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = scheduler.process_due().await {
            error!(error = %e, "process_due failed; retrying next tick");
        }
    }

    info!(worker = %scheduler.worker_id(), "driver stopped");
}
