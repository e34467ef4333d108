//! Recycle scheduler.
//!
//! A tokio task that, once per tick, moves expired in-flight ids back into
//! their line's retry pool and then runs storage maintenance (flush and
//! possibly compaction) on the blocking pool. Maintenance failures are logged
//! and retried on the next tick; they never stop the scheduler.

use super::engine::EngineInner;
use crate::core::error::QueueError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub(crate) struct RecycleScheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RecycleScheduler {
    pub(crate) fn spawn(inner: Arc<EngineInner>, period: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(period_ms = period.as_millis() as u64, "recycle scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => run_tick(&inner).await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("recycle scheduler stopped");
        });

        Self { shutdown, task }
    }

    /// Signal the task and wait for its current tick to finish.
    pub(crate) async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = (&mut self.task).await {
            tracing::warn!(error = %err, "recycle scheduler task failed");
        }
    }
}

impl Drop for RecycleScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_tick(inner: &Arc<EngineInner>) {
    match inner.reclaim_expired() {
        Ok(0) => {}
        Ok(reclaimed) => tracing::debug!(reclaimed, "recycled expired messages"),
        Err(_) => return,
    }

    let maintenance = Arc::clone(inner);
    match tokio::task::spawn_blocking(move || maintenance.maintain()).await {
        Ok(Ok(())) | Ok(Err(QueueError::Closed)) => {}
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "storage maintenance failed; retrying next tick")
        }
        Err(err) => tracing::warn!(error = %err, "storage maintenance task panicked"),
    }
}
