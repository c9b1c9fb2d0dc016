//! Metrics for the repair engine.

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Counters of the repair engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub triggers_fired: Counter,
    pub triggers_skipped: Counter,
    pub sessions_started: Counter,
    pub sessions_completed: Counter,
    pub sessions_aborted: Counter,
    pub sessions_failed: Counter,
    pub entries_updated: Counter,
    pub entries_regenerated: Counter,
    pub conflicts: Counter,
    pub resolve_sent: Counter,
    pub resolve_recv: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            triggers_fired: Counter::new("Number of repair triggers fired"),
            triggers_skipped: Counter::new("Number of triggers skipped (probability, backpressure or busy quadrant)"),
            sessions_started: Counter::new("Number of reconciliation sessions opened"),
            sessions_completed: Counter::new("Number of sessions that completed successfully"),
            sessions_aborted: Counter::new("Number of sessions aborted (ttl, conflict, unreachable peer)"),
            sessions_failed: Counter::new("Number of sessions failed on structural errors"),
            entries_updated: Counter::new("Number of stale entries replaced by a newer version"),
            entries_regenerated: Counter::new("Number of missing entries recreated from a replica"),
            conflicts: Counter::new("Number of equal-version value conflicts detected"),
            resolve_sent: Counter::new("Number of resolve messages sent"),
            resolve_recv: Counter::new("Number of resolve messages received"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "rrepair"
    }
}
