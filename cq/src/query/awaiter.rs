//! Correlation table and the awaiter for one outstanding query

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::metrics::QueryMetrics;

/// Outcome of handing a response to the correlation table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Already gathered, timed out, or never issued here
    UnknownId,
    /// The awaiter already holds as many responses as it will read
    Full,
}

/// Concurrent map of correlation id to the conduit of a pending awaiter
///
/// Insert, lookup and delete each lock a single shard; no lock is shared
/// across all query traffic.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: DashMap<u32, mpsc::Sender<Bytes>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conduit for `id`; an existing entry (after id wraparound) is replaced
    pub fn register(&self, id: u32, conduit: mpsc::Sender<Bytes>) {
        if self.pending.insert(id, conduit).is_some() {
            warn!(id, "CorrelationTable::register: replaced pending awaiter after id wraparound");
        }
    }

    /// Hand a payload to the awaiter registered for `id` without ever blocking
    pub fn deliver(&self, id: u32, payload: Bytes) -> Delivery {
        let Some(conduit) = self.pending.get(&id) else {
            return Delivery::UnknownId;
        };

        match conduit.try_send(payload) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::UnknownId,
        }
    }

    /// Remove `id` only if it still belongs to `conduit`
    pub fn remove(&self, id: u32, conduit: &mpsc::Sender<Bytes>) -> bool {
        self.pending.remove_if(&id, |_, current| current.same_channel(conduit)).is_some()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// One in-flight scatter-gather operation
///
/// The awaiter is registered in the [`CorrelationTable`] at creation and
/// removed exactly once when it is dropped, which `gather` does on every
/// return path.
#[derive(Debug)]
pub struct QueryAwaiter {
    id: u32,
    maximum: usize,
    receive: mpsc::Receiver<Bytes>,
    conduit: mpsc::Sender<Bytes>,
    table: Arc<CorrelationTable>,
    metrics: Arc<QueryMetrics>,
}

impl QueryAwaiter {
    /// Create an awaiter expecting up to `maximum` responses and register it under `id`
    pub(crate) fn register(id: u32, maximum: usize, table: Arc<CorrelationTable>, metrics: Arc<QueryMetrics>) -> Self {
        debug!(id, maximum, "QueryAwaiter::register: called");
        // Sized to the expected count so delivery never has to wait on gather
        let (conduit, receive) = mpsc::channel(maximum.max(1));
        table.register(id, conduit.clone());

        Self {
            id,
            maximum,
            receive,
            conduit,
            table,
            metrics,
        }
    }

    /// Correlation id of this query
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of responses this awaiter waits for
    pub fn maximum(&self) -> usize {
        self.maximum
    }

    /// Collect responses until `maximum` arrived or `timeout` elapsed
    ///
    /// Responses are returned in arrival order. A result shorter than
    /// [`maximum`](Self::maximum) means some peers did not answer in time;
    /// that is not an error. With `maximum == 0` this returns immediately.
    pub async fn gather(mut self, timeout: Duration) -> Vec<Bytes> {
        debug!(id = self.id, maximum = self.maximum, ?timeout, "QueryAwaiter::gather: called");
        let mut responses = Vec::with_capacity(self.maximum.min(64));
        if self.maximum == 0 {
            self.metrics.record_gather_completed();
            return responses;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while responses.len() < self.maximum {
            match tokio::time::timeout_at(deadline, self.receive.recv()).await {
                Ok(Some(payload)) => responses.push(payload),
                Ok(None) => break,
                Err(_) => {
                    debug!(id = self.id, received = responses.len(), "QueryAwaiter::gather: timed out");
                    break;
                }
            }
        }

        if responses.len() < self.maximum {
            self.metrics.record_gather_partial();
        }
        self.metrics.record_gather_completed();
        debug!(id = self.id, received = responses.len(), "QueryAwaiter::gather: done");
        responses
    }
}

impl Drop for QueryAwaiter {
    fn drop(&mut self) {
        if self.table.remove(self.id, &self.conduit) {
            debug!(id = self.id, "QueryAwaiter::drop: unregistered");
        }
    }
}
