use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::store::SessionStore;
use crate::infra::telemetry::METRIC_SESSION_SWEPT;

/// Shortest interval the loop runs at; smaller requests are raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Background task that periodically calls [`SessionStore::sweep`].
///
/// Call [`SweepTask::stop`] during shutdown to wait for the loop to exit.
/// Dropping a task that was never stopped aborts it.
pub struct SweepTask {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SweepTask {
    /// Start sweeping every `interval`, never more often than [`MIN_SWEEP_INTERVAL`].
    pub fn spawn(store: Arc<dyn SessionStore>, interval: Duration) -> Self {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip the first immediate tick
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => run_sweep(store.as_ref()).await,
                }
            }
            debug!("session sweep task stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the loop and wait for it to exit. A sweep in progress completes first.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            warn!(error = %err, "session sweep task ended abnormally");
        }
    }
}

impl Drop for SweepTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run_sweep(store: &dyn SessionStore) {
    match store.sweep().await {
        Ok(0) => {}
        Ok(removed) => {
            counter!(METRIC_SESSION_SWEPT).increment(removed as u64);
            debug!(removed, "expired sessions swept");
        }
        Err(err) => warn!(error = %err, "session sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::session::store::MemorySessionStore;

    #[tokio::test]
    async fn sweeps_expired_sessions_until_stopped() {
        let store = Arc::new(MemorySessionStore::new());
        store
            .save(&Session::new(Duration::from_millis(5)))
            .await
            .expect("save");
        store
            .save(&Session::new(Duration::from_secs(60)))
            .await
            .expect("save");

        let task = SweepTask::spawn(store.clone(), Duration::from_millis(20));
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.len(), 1);

        task.stop().await;
    }

    #[tokio::test]
    async fn zero_interval_is_raised_to_the_minimum() {
        let store = Arc::new(MemorySessionStore::new());
        store
            .save(&Session::new(Duration::from_millis(1)))
            .await
            .expect("save");

        let task = SweepTask::spawn(store.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.is_running());
        assert_eq!(store.len(), 0);

        task.stop().await;
    }

    #[tokio::test]
    async fn first_tick_does_not_sweep() {
        let store = Arc::new(MemorySessionStore::new());
        let task = SweepTask::spawn(store.clone(), Duration::from_secs(60));

        store
            .save(&Session::new(Duration::from_millis(1)))
            .await
            .expect("save");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.len(), 1);

        task.stop().await;
    }

    #[tokio::test]
    async fn dropping_a_running_task_aborts_it() {
        let store = Arc::new(MemorySessionStore::new());
        let task = SweepTask::spawn(store.clone(), Duration::from_millis(10));
        drop(task);

        store
            .save(&Session::new(Duration::from_millis(1)))
            .await
            .expect("save");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.len(), 1);
    }
}
