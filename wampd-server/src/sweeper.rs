//! Periodic dealer-side call timeout sweep.

use crate::metrics::Metrics;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use wampd_core::Dealer;

/// Runs [`Dealer::check_timeouts`] on a fixed interval.
pub struct TimeoutSweeper {
    dealer: Arc<Dealer>,
    interval: Option<Duration>,
    metrics: Option<Arc<Metrics>>,
    sweeps: AtomicU64,
    timed_out: AtomicU64,
    shutdown: AtomicBool,
    notify: Notify,
}

impl TimeoutSweeper {
    /// Creates a sweeper. `None` disables sweeping.
    pub fn new(dealer: Arc<Dealer>, interval: Option<Duration>) -> Self {
        Self {
            dealer,
            interval,
            metrics: None,
            sweeps: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs one sweep immediately. Returns the number of calls timed out.
    pub fn sweep(&self) -> usize {
        let expired = self.dealer.check_timeouts();
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        if expired > 0 {
            self.timed_out.fetch_add(expired as u64, Ordering::Relaxed);
            tracing::debug!("Timed out {} call(s)", expired);
            if let Some(ref metrics) = self.metrics {
                metrics.timeouts_total.inc_by(expired as f64);
            }
        }
        if let Some(ref metrics) = self.metrics {
            metrics
                .pending_invocations
                .set(self.dealer.pending_invocations() as f64);
        }
        expired
    }

    /// Runs the sweep loop (call from a background task).
    pub async fn run(&self) {
        let Some(interval) = self.interval else {
            tracing::info!("Dealer-side call timeouts are disabled");
            return;
        };

        tracing::info!("Timeout sweeper started (interval={:?})", interval);

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.sweep();
        }

        tracing::info!("Timeout sweeper stopped");
    }

    /// Signals the sweeper to shut down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Returns sweeper statistics.
    pub fn stats(&self) -> SweeperStats {
        SweeperStats {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Sweeper statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub timed_out: u64,
}
