//! Query manager metrics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters updated on the dispatch paths
#[derive(Debug, Default)]
pub struct QueryMetrics {
    requests_issued: AtomicU64,
    requests_answered: AtomicU64,
    requests_unhandled: AtomicU64,
    requests_rejected: AtomicU64,
    responses_delivered: AtomicU64,
    responses_dropped: AtomicU64,
    gathers_completed: AtomicU64,
    gathers_partial: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl QueryMetrics {
    counter!(record_request_issued, requests_issued);
    counter!(record_request_answered, requests_answered);
    counter!(record_request_unhandled, requests_unhandled);
    counter!(record_request_rejected, requests_rejected);
    counter!(record_response_delivered, responses_delivered);
    counter!(record_response_dropped, responses_dropped);
    counter!(record_gather_completed, gathers_completed);
    counter!(record_gather_partial, gathers_partial);

    pub fn snapshot(&self, pending_queries: usize) -> QueryMetricsSnapshot {
        QueryMetricsSnapshot {
            pending_queries,
            requests_issued: self.requests_issued.load(Ordering::Relaxed),
            requests_answered: self.requests_answered.load(Ordering::Relaxed),
            requests_unhandled: self.requests_unhandled.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            gathers_completed: self.gathers_completed.load(Ordering::Relaxed),
            gathers_partial: self.gathers_partial.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`QueryMetrics`] for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueryMetricsSnapshot {
    pub pending_queries: usize,
    pub requests_issued: u64,
    pub requests_answered: u64,
    pub requests_unhandled: u64,
    /// Inbound messages rejected before reaching a handler (bad ssid, bad channel, unknown peer)
    pub requests_rejected: u64,
    pub responses_delivered: u64,
    /// Responses for unknown ids or full conduits
    pub responses_dropped: u64,
    pub gathers_completed: u64,
    /// Gathers that returned fewer responses than expected
    pub gathers_partial: u64,
}
