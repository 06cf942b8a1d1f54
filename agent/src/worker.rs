//! Small periodic-worker harness: one tokio task per subsystem, each with
//! its own stop signal. Tick bodies must never panic outward; they log and
//! carry on.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn stop(self) {
        let _send_result = self.stop.send(true);
        let _join_result = self.task.await;
    }
}

/// Spawns a fixed-cadence worker. The first tick fires one full interval
/// after spawn, not immediately: callers that need an initial run perform
/// it synchronously before spawning.
pub fn spawn_periodic<F>(name: &'static str, interval: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() + Send + 'static,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut timer = tokio::time::interval_at(start, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => tick(),
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker = name, "worker stopped");
    });
    WorkerHandle {
        stop: stop_tx,
        task,
    }
}
