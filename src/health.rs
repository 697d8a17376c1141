//! Background health monitor for the pool.
//!
//! One task per pool, started on first acquire and stopped on shutdown. Each
//! tick shuts down servers idle past the threshold and pings the rest,
//! restarting anything that stops answering.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::Manager;

/// Stop signal plus join handle for the monitor task.
pub(crate) struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the loop to exit and waits for it.
    pub(crate) async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Spawns the monitor loop for the given pool.
pub(crate) fn spawn(manager: Manager) -> MonitorHandle {
    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn(run(manager, stopped));
    MonitorHandle { stop, task }
}

async fn run(manager: Manager, mut stopped: watch::Receiver<bool>) {
    let interval = manager.config().health_check_interval();
    debug!(interval_secs = interval.as_secs(), "health monitor started");

    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        // A failing check must not kill the loop; run_health_checks logs and
        // swallows per-server errors internally.
        manager.run_health_checks().await;
    }

    debug!("health monitor stopped");
}
