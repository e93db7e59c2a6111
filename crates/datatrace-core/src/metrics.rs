//! Filter metrics
//!
//! Lock-free counters updated on the request/response paths, rendered in
//! Prometheus text format on demand.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one filter instance
#[derive(Debug)]
pub struct FilterMetrics {
    /// When the collector was started
    start_time: Instant,
    /// Requests seen
    pub requests: AtomicU64,
    /// Requests passed through without a trace id
    pub requests_untraced: AtomicU64,
    /// Requests that opened a trace
    pub traces_opened: AtomicU64,
    /// Requests that joined an open trace
    pub child_requests: AtomicU64,
    /// Responses belonging to a trace
    pub responses: AtomicU64,
    /// Traces closed by their parent response
    pub traces_closed: AtomicU64,
    /// Exchanges rejected by policy or override
    pub rejections: AtomicU64,
    /// Override tokens dropped as malformed
    pub malformed_overrides: AtomicU64,
    /// Traces evicted by the expiry sweeper
    pub traces_evicted: AtomicU64,
}

impl Default for FilterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`FilterMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub requests: u64,
    pub requests_untraced: u64,
    pub traces_opened: u64,
    pub child_requests: u64,
    pub responses: u64,
    pub traces_closed: u64,
    pub rejections: u64,
    pub malformed_overrides: u64,
    pub traces_evicted: u64,
}

impl FilterMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests: AtomicU64::new(0),
            requests_untraced: AtomicU64::new(0),
            traces_opened: AtomicU64::new(0),
            child_requests: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            traces_closed: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            malformed_overrides: AtomicU64::new(0),
            traces_evicted: AtomicU64::new(0),
        }
    }

    /// Increment a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`
    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            requests: self.requests.load(Ordering::Relaxed),
            requests_untraced: self.requests_untraced.load(Ordering::Relaxed),
            traces_opened: self.traces_opened.load(Ordering::Relaxed),
            child_requests: self.child_requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            traces_closed: self.traces_closed.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            malformed_overrides: self.malformed_overrides.load(Ordering::Relaxed),
            traces_evicted: self.traces_evicted.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} {}\n", name, kind));
            output.push_str(&format!("{} {}\n\n", name, value));
        };

        metric(
            "datatrace_uptime_seconds",
            "gauge",
            "Time since filter started",
            snap.uptime_seconds,
        );
        metric(
            "datatrace_requests_total",
            "counter",
            "Total requests seen",
            snap.requests,
        );
        metric(
            "datatrace_requests_untraced_total",
            "counter",
            "Requests without a trace id",
            snap.requests_untraced,
        );
        metric(
            "datatrace_traces_opened_total",
            "counter",
            "Traces opened by a parent request",
            snap.traces_opened,
        );
        metric(
            "datatrace_child_requests_total",
            "counter",
            "Requests joining an open trace",
            snap.child_requests,
        );
        metric(
            "datatrace_responses_total",
            "counter",
            "Traced responses seen",
            snap.responses,
        );
        metric(
            "datatrace_traces_closed_total",
            "counter",
            "Traces closed by their parent response",
            snap.traces_closed,
        );
        metric(
            "datatrace_rejections_total",
            "counter",
            "Exchanges rejected by policy",
            snap.rejections,
        );
        metric(
            "datatrace_malformed_overrides_total",
            "counter",
            "Override tokens dropped as malformed",
            snap.malformed_overrides,
        );
        metric(
            "datatrace_traces_evicted_total",
            "counter",
            "Orphaned traces evicted by expiry",
            snap.traces_evicted,
        );

        output
    }
}
