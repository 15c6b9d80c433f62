//! Graceful shutdown handling for the gateway.
//!
//! Shutdown runs in three steps. The server's token stops accepting
//! connections. [`InFlightRelays`] then waits for spawned relays to settle,
//! cancelling any still running after the grace period so they refund.
//! Only after that does [`BackgroundTasks`] stop the periodic jobs, so the
//! accumulator's final flush sees every delta the relays produced.

use gateway_core::{spawn_periodic, PeriodicJob};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Relay tasks spawned by request handlers.
///
/// Relays are detached from the request so a disconnect can still settle.
/// They run under their own root token, separate from the server's, so
/// stopping the listener does not cut them off.
#[derive(Debug, Clone, Default)]
pub struct InFlightRelays {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl InFlightRelays {
    /// Empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancellation token for one relay
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Spawn a tracked relay
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Relays still running
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// No relay running
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Cancel every relay; each refunds its reservation
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait up to `grace` for relays to finish, then cancel the rest and
    /// wait up to `grace` again for them to refund.
    ///
    /// Returns `true` when every relay finished.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        if self.tracker.is_empty() {
            return true;
        }

        info!(in_flight = self.tracker.len(), "Waiting for in-flight relays");
        if timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }

        warn!(
            in_flight = self.tracker.len(),
            "Relays still running after grace period, cancelling"
        );
        self.token.cancel();
        let finished = timeout(grace, self.tracker.wait()).await.is_ok();
        if !finished {
            error!(in_flight = self.tracker.len(), "Relays did not stop after cancellation");
        }
        finished
    }
}

/// Owner of the long-lived periodic jobs
#[derive(Debug)]
pub struct BackgroundTasks {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Jobs stop when `token` is cancelled
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
        }
    }

    /// Run `job` every `interval`
    pub fn spawn<J: PeriodicJob>(&mut self, job: J, interval: Duration) {
        let name = job.name();
        let handle = spawn_periodic(Arc::new(job), interval, self.token.clone());
        self.handles.push((name, handle));
    }

    /// Number of jobs owned
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// No jobs owned
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel the token and wait up to `grace` for every job to finish.
    ///
    /// Jobs still running after the deadline are aborted.
    pub async fn shutdown(self, grace: Duration) {
        self.token.cancel();
        info!(count = self.handles.len(), "Stopping background tasks");

        for (name, mut handle) in self.handles {
            match timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(job = name, error = %e, "Background task failed"),
                Err(_) => {
                    warn!(job = name, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

/// Wait for Ctrl+C or, on unix, SIGTERM / SIGQUIT.
///
/// A handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        "ctrl+c"
    };

    #[cfg(unix)]
    let sigterm = unix_signal(signal::unix::SignalKind::terminate(), "sigterm");
    #[cfg(unix)]
    let sigquit = unix_signal(signal::unix::SignalKind::quit(), "sigquit");

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<&'static str>();
    #[cfg(not(unix))]
    let sigquit = std::future::pending::<&'static str>();

    let signal_name = tokio::select! {
        name = ctrl_c => name,
        name = sigterm => name,
        name = sigquit => name,
    };

    info!(signal = signal_name, "Received shutdown signal");
    signal_name
}

#[cfg(unix)]
async fn unix_signal(kind: signal::unix::SignalKind, name: &'static str) -> &'static str {
    match signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!(signal = name, error = %e, "Failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        ticks: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    struct CountingJob(Arc<Counters>);

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_shutdown(&self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StuckJob;

    #[async_trait]
    impl PeriodicJob for StuckJob {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn tick(&self) {}

        async fn on_shutdown(&self) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_tick_and_stop() {
        let counters = Arc::new(Counters::default());
        let token = CancellationToken::new();
        let mut tasks = BackgroundTasks::new(token.clone());
        tasks.spawn(CountingJob(counters.clone()), Duration::from_secs(1));
        tasks.spawn(CountingJob(counters.clone()), Duration::from_secs(1));
        assert_eq!(tasks.len(), 2);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        tasks.shutdown(Duration::from_secs(1)).await;

        assert_eq!(counters.ticks.load(Ordering::SeqCst), 4);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 2);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_running_relays() {
        let relays = InFlightRelays::new();
        let done = Arc::new(AtomicUsize::new(0));
        for delay in [100, 400] {
            let done = done.clone();
            relays.spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(relays.len(), 2);

        assert!(relays.drain(Duration::from_secs(5)).await);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert!(relays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_cancels_relays_past_grace() {
        let relays = InFlightRelays::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let token = relays.child_token();
        let seen = cancelled.clone();
        relays.spawn(async move {
            token.cancelled().await;
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let started = tokio::time::Instant::now();
        assert!(relays.drain(Duration::from_secs(2)).await);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_job_is_aborted() {
        let mut tasks = BackgroundTasks::new(CancellationToken::new());
        tasks.spawn(StuckJob, Duration::from_secs(60));

        let started = tokio::time::Instant::now();
        tasks.shutdown(Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
