//! Cancellable periodic background tasks.
//!
//! Registry refresh, delta flushing and cache sweeping all run as a
//! [`PeriodicJob`] on a fixed interval until the process-wide
//! [`CancellationToken`] fires. Tests call [`PeriodicJob::tick`] directly
//! instead of waiting on the timer.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Work run on every interval tick
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Run one iteration
    async fn tick(&self);

    /// Called once after cancellation, before the task exits
    async fn on_shutdown(&self) {}
}

/// Spawn `job` on a fixed interval until `shutdown` is cancelled.
///
/// The first tick fires one full interval after spawn.
pub fn spawn_periodic<J>(job: Arc<J>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()>
where
    J: PeriodicJob + ?Sized,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            job = job.name(),
            interval_secs = interval.as_secs_f64(),
            "Starting periodic task"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(job = job.name(), "Periodic task cancelled");
                    job.on_shutdown().await;
                    break;
                }
                _ = ticker.tick() => {
                    job.tick().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingJob {
        ticks: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval_and_stops_on_cancel() {
        let job = Arc::new(CountingJob::default());
        let token = CancellationToken::new();
        let handle = spawn_periodic(job.clone(), Duration::from_secs(5), token.clone());

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10_200)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(job.shutdowns.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), 3);
    }
}
