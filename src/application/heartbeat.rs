//! Background heartbeat checker.
//!
//! Runs a sweep on a fixed interval until cancelled. The registry supplies
//! the sweep; this module only owns the task and its shutdown.

use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error returned when the checker task did not stop cleanly.
#[derive(Debug, Error)]
#[error("heartbeat checker task failed: {0}")]
pub struct ShutdownError(#[from] tokio::task::JoinError);

/// Handle to a running heartbeat checker.
#[derive(Debug)]
pub struct CheckerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl CheckerHandle {
    /// Stop the checker and wait for the task to finish.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        self.cancel.cancel();
        self.join.await?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Spawn a task calling `sweep` every `period`.
///
/// The first sweep happens one full period after spawning. The task stops
/// when `cancel` fires or when `sweep` returns `false`.
pub fn spawn_checker<F>(period: Duration, cancel: CancellationToken, mut sweep: F) -> CheckerHandle
where
    F: FnMut() -> bool + Send + 'static,
{
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !sweep() {
                        break;
                    }
                }
            }
        }
        debug!("heartbeat checker stopped");
    });

    CheckerHandle { cancel, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_on_interval() {
        let sweeps = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sweeps);
        let handle = spawn_checker(Duration::from_secs(10), CancellationToken::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sweeps.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sweeps.load(Ordering::SeqCst), 3);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_sweeping() {
        let sweeps = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sweeps);
        let handle = spawn_checker(Duration::from_secs(1), CancellationToken::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown().await.unwrap();
        let after_shutdown = sweeps.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sweeps.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_returning_false_ends_task() {
        let handle = spawn_checker(Duration::from_secs(1), CancellationToken::new(), || false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_checker() {
        let parent = CancellationToken::new();
        let handle = spawn_checker(Duration::from_secs(1), parent.child_token(), || true);
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }
}
