//! Per-procedure call statistics with hierarchical aggregation.
//!
//! Every procedure name gets a [`CallStats`] node whose parent is the
//! dealer-wide total; recording on a node also records on all ancestors.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters for one node.
#[derive(Debug)]
pub struct CallStats {
    name: String,
    parent: Option<Arc<CallStats>>,
    attempted: AtomicU64,
    invoked: AtomicU64,
    completed: AtomicU64,
    errored: AtomicU64,
    canceled: AtomicU64,
    duration_micros: AtomicU64,
}

/// Point-in-time copy of a node's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub attempted: u64,
    pub invoked: u64,
    pub completed: u64,
    pub errored: u64,
    pub canceled: u64,
    pub duration_micros: u64,
}

impl CallStats {
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name.into(), None))
    }

    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name.into(), Some(Arc::clone(self))))
    }

    fn new(name: String, parent: Option<Arc<CallStats>>) -> Self {
        Self {
            name,
            parent,
            attempted: AtomicU64::new(0),
            invoked: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
            duration_micros: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn bump(&self, counter: fn(&CallStats) -> &AtomicU64, by: u64) {
        let mut node = Some(self);
        while let Some(stats) = node {
            counter(stats).fetch_add(by, Ordering::Relaxed);
            node = stats.parent.as_deref();
        }
    }

    pub fn record_attempt(&self) {
        self.bump(|s| &s.attempted, 1);
    }

    pub fn record_invoked(&self) {
        self.bump(|s| &s.invoked, 1);
    }

    pub fn record_completed(&self, elapsed: Duration) {
        self.bump(|s| &s.completed, 1);
        self.bump(|s| &s.duration_micros, elapsed.as_micros() as u64);
    }

    pub fn record_errored(&self) {
        self.bump(|s| &s.errored, 1);
    }

    pub fn record_canceled(&self) {
        self.bump(|s| &s.canceled, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            invoked: self.invoked.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            duration_micros: self.duration_micros.load(Ordering::Relaxed),
        }
    }
}

/// Distinct unknown procedure names counted individually.
pub const DEFAULT_NOT_FOUND_LIMIT: usize = 1024;

/// Dealer-wide statistics: a total node, one child per procedure name and
/// a counter of calls that found no procedure.
///
/// Unknown names come from callers, so only the first `not_found_limit`
/// distinct names get their own counter. Misses on any further name land
/// in a single overflow counter.
#[derive(Debug)]
pub struct DealerStats {
    total: Arc<CallStats>,
    procedures: DashMap<String, Arc<CallStats>>,
    not_found: DashMap<String, u64>,
    not_found_limit: usize,
    not_found_overflow: AtomicU64,
}

impl DealerStats {
    pub fn new() -> Self {
        Self {
            total: CallStats::root("total"),
            procedures: DashMap::new(),
            not_found: DashMap::new(),
            not_found_limit: DEFAULT_NOT_FOUND_LIMIT,
            not_found_overflow: AtomicU64::new(0),
        }
    }

    pub fn with_not_found_limit(mut self, limit: usize) -> Self {
        self.not_found_limit = limit;
        self
    }

    pub fn total(&self) -> &Arc<CallStats> {
        &self.total
    }

    /// Returns the node for `name`, creating it on first use.
    pub fn procedure(&self, name: &str) -> Arc<CallStats> {
        if let Some(stats) = self.procedures.get(name) {
            return Arc::clone(&stats);
        }
        self.procedures
            .entry(name.to_string())
            .or_insert_with(|| self.total.child(name))
            .clone()
    }

    pub fn record_not_found(&self, name: &str) {
        if let Some(mut count) = self.not_found.get_mut(name) {
            *count += 1;
            return;
        }
        if self.not_found.len() >= self.not_found_limit {
            self.not_found_overflow.fetch_add(1, Ordering::Relaxed);
            return;
        }
        *self.not_found.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn not_found(&self, name: &str) -> u64 {
        self.not_found.get(name).map(|n| *n).unwrap_or(0)
    }

    /// Misses on names past the tracked limit.
    pub fn not_found_overflow(&self) -> u64 {
        self.not_found_overflow.load(Ordering::Relaxed)
    }

    pub fn not_found_names(&self) -> usize {
        self.not_found.len()
    }

    pub fn snapshot(&self, name: &str) -> Option<StatsSnapshot> {
        self.procedures.get(name).map(|s| s.snapshot())
    }
}

impl Default for DealerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_records_into_parent() {
        let stats = DealerStats::new();
        let echo = stats.procedure("com.echo");
        let add = stats.procedure("com.add");

        echo.record_attempt();
        echo.record_invoked();
        echo.record_completed(Duration::from_millis(2));
        add.record_attempt();
        add.record_errored();

        assert_eq!(echo.snapshot().completed, 1);
        assert_eq!(echo.snapshot().duration_micros, 2000);
        assert_eq!(add.snapshot().errored, 1);

        let total = stats.total().snapshot();
        assert_eq!(total.attempted, 2);
        assert_eq!(total.completed, 1);
        assert_eq!(total.errored, 1);
    }

    #[test]
    fn test_procedure_node_is_shared() {
        let stats = DealerStats::new();
        stats.procedure("com.echo").record_canceled();
        stats.procedure("com.echo").record_canceled();
        assert_eq!(stats.snapshot("com.echo").unwrap().canceled, 2);
        assert!(stats.snapshot("com.other").is_none());
    }

    #[test]
    fn test_not_found_bucket() {
        let stats = DealerStats::default();
        assert_eq!(stats.not_found("com.missing"), 0);
        stats.record_not_found("com.missing");
        stats.record_not_found("com.missing");
        assert_eq!(stats.not_found("com.missing"), 2);
        assert_eq!(stats.not_found_overflow(), 0);
    }

    #[test]
    fn test_not_found_bucket_is_bounded() {
        let stats = DealerStats::new().with_not_found_limit(2);
        for i in 0..100 {
            stats.record_not_found(&format!("com.missing.{i}"));
        }
        stats.record_not_found("com.missing.0");

        assert_eq!(stats.not_found_names(), 2);
        assert_eq!(stats.not_found("com.missing.0"), 2);
        assert_eq!(stats.not_found("com.missing.1"), 1);
        assert_eq!(stats.not_found("com.missing.2"), 0);
        assert_eq!(stats.not_found_overflow(), 98);
    }
}
