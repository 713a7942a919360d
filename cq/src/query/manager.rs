//! QueryManager - cluster-wide request/response over the pub/sub bus

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::awaiter::{CorrelationTable, Delivery, QueryAwaiter};
use super::channel::{Channel, RESPONSE_CHANNEL, RequestChannel};
use super::error::{QueryError, QueryResult};
use super::handler::{HandlerRegistry, QueryHandler};
use super::metrics::{QueryMetrics, QueryMetricsSnapshot};
use super::ssid::{QUERY_SSID_LEN, Ssid, correlated_ssid, query_ssid};
use crate::cluster::{Broker, Cluster, Subscriber, SubscriberKind};

/// Sends, receives and routes query traffic for one node
///
/// Register handlers with [`handle_func`](Self::handle_func) before calling
/// [`start`](Self::start); after that the manager is driven by the broker
/// through its [`Subscriber`] implementation.
pub struct QueryManager {
    /// Locally unique id of this subscriber
    luid: String,
    broker: Arc<dyn Broker>,
    cluster: Arc<dyn Cluster>,
    /// Last issued correlation id; wraps after 2^32 queries
    next: AtomicU32,
    awaiters: Arc<CorrelationTable>,
    /// Replaced wholesale on registration; dispatch works on a snapshot
    handlers: RwLock<Arc<HandlerRegistry>>,
    metrics: Arc<QueryMetrics>,
    started: AtomicBool,
}

impl QueryManager {
    pub fn new(broker: Arc<dyn Broker>, cluster: Arc<dyn Cluster>) -> Arc<Self> {
        let luid = Uuid::now_v7().to_string();
        debug!(%luid, local = %cluster.local_name(), "QueryManager::new: called");
        Arc::new(Self {
            luid,
            broker,
            cluster,
            next: AtomicU32::new(0),
            awaiters: Arc::new(CorrelationTable::new()),
            handlers: RwLock::new(Arc::new(HandlerRegistry::new())),
            metrics: Arc::new(QueryMetrics::default()),
            started: AtomicBool::new(false),
        })
    }

    /// Subscribe to the query ssid and announce the subscription to the cluster
    ///
    /// Returns false if the broker refused the subscription. The broker keeps
    /// the manager alive until [`stop`](Self::stop) is called.
    pub fn start(self: &Arc<Self>) -> bool {
        let ssid = query_ssid();
        let subscriber: Arc<dyn Subscriber> = self.clone();
        if !self.broker.subscribe(ssid.clone(), subscriber) {
            warn!(luid = %self.luid, %ssid, "QueryManager::start: subscription refused");
            return false;
        }

        self.cluster.notify_subscribe(&self.luid, &ssid);
        self.started.store(true, Ordering::Release);
        info!(luid = %self.luid, local = %self.cluster.local_name(), "Query manager started");
        true
    }

    /// Leave the query ssid; pending awaiters still time out normally
    pub fn stop(&self) {
        let ssid = query_ssid();
        if self.broker.unsubscribe(&ssid, &self.luid) {
            self.cluster.notify_unsubscribe(&self.luid, &ssid);
        }
        self.started.store(false, Ordering::Release);
        info!(luid = %self.luid, "Query manager stopped");
    }

    /// Append a handler; handlers are consulted in registration order
    pub fn handle_func(&self, handler: QueryHandler) {
        if self.started.load(Ordering::Acquire) {
            warn!(luid = %self.luid, ?handler, "QueryManager::handle_func: registering after start");
        }
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut *handlers).push(handler);
    }

    /// Answer every query of `query_type` with `respond`
    pub fn handle<F>(&self, query_type: impl Into<String>, respond: F)
    where
        F: Fn(&Bytes) -> Bytes + Send + Sync + 'static,
    {
        self.handle_func(QueryHandler::typed(query_type, respond));
    }

    /// Issue a cluster-wide query
    ///
    /// The returned awaiter expects one response per peer known right now;
    /// the count is not updated if peers join or leave later. Publication is
    /// fire-and-forget.
    pub fn request(&self, query_type: &str, payload: impl Into<Bytes>) -> QueryResult<QueryAwaiter> {
        let channel = RequestChannel::new(query_type, self.cluster.local_name())?;
        let id = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let maximum = self.cluster.num_peers();
        debug!(id, %query_type, maximum, "QueryManager::request: called");

        // Registered before publishing so no response can beat the table insert
        let awaiter = QueryAwaiter::register(id, maximum, self.awaiters.clone(), self.metrics.clone());

        self.broker.publish(correlated_ssid(id), channel.encode(), payload.into());
        self.metrics.record_request_issued();
        Ok(awaiter)
    }

    /// Route a response into the awaiter waiting on `id`
    ///
    /// Responses for unknown or completed queries are dropped silently.
    pub fn on_response(&self, id: u32, payload: Bytes) -> QueryResult<()> {
        match self.awaiters.deliver(id, payload) {
            Delivery::Delivered => {
                self.metrics.record_response_delivered();
            }
            Delivery::UnknownId => {
                debug!(id, "QueryManager::on_response: no awaiter, dropping");
                self.metrics.record_response_dropped();
            }
            Delivery::Full => {
                debug!(id, "QueryManager::on_response: awaiter already satisfied, dropping");
                self.metrics.record_response_dropped();
            }
        }
        Ok(())
    }

    /// Answer a request with the first claiming handler and reply to its origin
    pub fn on_request(&self, ssid: &Ssid, channel: &str, payload: Bytes) -> QueryResult<()> {
        let request = RequestChannel::parse(channel).inspect_err(|_| self.metrics.record_request_rejected())?;

        let Some(peer) = self.cluster.find_peer(request.reply_to) else {
            self.metrics.record_request_rejected();
            return Err(QueryError::PeerNotFound {
                peer: request.reply_to,
            });
        };

        // Handlers run without the lock held so they may register further handlers
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        let response = handlers.dispatch(&request.query_type, &payload);

        match response {
            Some(response) => {
                debug!(%ssid, query_type = %request.query_type, reply_to = %request.reply_to, "QueryManager::on_request: answering");
                self.metrics.record_request_answered();
                peer.send(ssid.clone(), RESPONSE_CHANNEL, response)
            }
            None => {
                self.metrics.record_request_unhandled();
                Err(QueryError::NoHandlerFound {
                    channel: channel.to_string(),
                })
            }
        }
    }

    /// Number of queries still waiting to be gathered
    pub fn pending_queries(&self) -> usize {
        self.awaiters.len()
    }

    pub fn metrics(&self) -> QueryMetricsSnapshot {
        self.metrics.snapshot(self.awaiters.len())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, next: u32) {
        self.next.store(next, Ordering::Relaxed);
    }
}

impl Subscriber for QueryManager {
    fn id(&self) -> String {
        self.luid.clone()
    }

    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Direct
    }

    /// Single inbound entry point for query traffic
    fn send(&self, ssid: &Ssid, channel: &str, payload: Bytes) -> QueryResult<()> {
        let Some(id) = ssid.correlation_id() else {
            self.metrics.record_request_rejected();
            return Err(QueryError::InvalidQuery { segments: ssid.len() });
        };
        debug_assert_eq!(ssid.len(), QUERY_SSID_LEN);

        match Channel::classify(channel) {
            Channel::Response => self.on_response(id, payload),
            Channel::Request(channel) => self.on_request(ssid, channel, payload),
        }
    }
}

impl std::fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryManager")
            .field("luid", &self.luid)
            .field("local", &self.cluster.local_name())
            .field("pending", &self.awaiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemNetwork;
    use crate::query::PeerName;
    use std::time::Duration;

    fn node(network: &MemNetwork, name: u64) -> Arc<QueryManager> {
        let node = Arc::new(network.join(PeerName(name)));
        QueryManager::new(node.clone(), node)
    }

    #[tokio::test]
    async fn test_start_subscribes_and_announces() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);

        assert!(manager.start());
        assert!(manager.is_started());
        assert!(network.is_announced(PeerName(1), &manager.id()));
        assert_eq!(manager.kind(), SubscriberKind::Direct);

        // A second start is refused by the broker and announces nothing new
        assert!(!manager.start());

        manager.stop();
        assert!(!network.is_announced(PeerName(1), &manager.id()));
    }

    #[tokio::test]
    async fn test_invalid_ssid_rejected_without_invoking_handlers() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        manager.handle_func(QueryHandler::predicate(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Some(Bytes::new())
        }));

        for segments in [vec![], vec![0], query_ssid().segments().to_vec(), vec![0, 1, 2, 3]] {
            let ssid = Ssid::new(segments.clone());
            let err = manager.send(&ssid, "ping/1", Bytes::new()).unwrap_err();
            assert!(matches!(err, QueryError::InvalidQuery { segments: n } if n == segments.len()));
        }
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_response_for_unknown_id_is_noop() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);

        manager
            .send(&correlated_ssid(12345), RESPONSE_CHANNEL, Bytes::from_static(b"stray"))
            .unwrap();
        assert_eq!(manager.pending_queries(), 0);
        assert_eq!(manager.metrics().responses_dropped, 1);
    }

    #[tokio::test]
    async fn test_request_allocates_increasing_ids() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);

        let first = manager.request("ping", "a").unwrap();
        let second = manager.request("ping", "b").unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(manager.pending_queries(), 2);

        drop(first);
        drop(second);
        assert_eq!(manager.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_correlation_id_wraps() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);
        manager.set_next_id(u32::MAX - 1);

        assert_eq!(manager.request("ping", "a").unwrap().id(), u32::MAX);
        assert_eq!(manager.request("ping", "b").unwrap().id(), 0);
    }

    #[tokio::test]
    async fn test_request_rejects_query_type_with_separator() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);

        let err = manager.request("a/b", "x").unwrap_err();
        assert!(matches!(err, QueryError::InvalidQueryType { .. }));
        assert_eq!(manager.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_request_snapshots_peer_count() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);
        network.join(PeerName(2));

        let awaiter = manager.request("ping", "x").unwrap();
        network.join(PeerName(3));
        assert_eq!(awaiter.maximum(), 2);
    }

    #[tokio::test]
    async fn test_unknown_reply_peer_sends_nothing() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);
        manager.handle("ping", |_| Bytes::from_static(b"pong"));

        let err = manager
            .on_request(&correlated_ssid(1), "ping/999", Bytes::new())
            .unwrap_err();
        assert!(matches!(err, QueryError::PeerNotFound { peer } if peer == PeerName(999)));
        assert_eq!(manager.metrics().requests_answered, 0);
    }

    #[tokio::test]
    async fn test_self_query_round_trip() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);
        manager.handle("ping", |payload| {
            let mut out = b"pong:".to_vec();
            out.extend_from_slice(payload);
            Bytes::from(out)
        });
        assert!(manager.start());

        let responses = manager
            .request("ping", "x")
            .unwrap()
            .gather(Duration::from_secs(2))
            .await;
        assert_eq!(responses, vec![Bytes::from_static(b"pong:x")]);
        assert_eq!(manager.pending_queries(), 0);

        let metrics = manager.metrics();
        assert_eq!(metrics.requests_issued, 1);
        assert_eq!(metrics.requests_answered, 1);
        assert_eq!(metrics.responses_delivered, 1);
        assert_eq!(metrics.gathers_partial, 0);
        manager.stop();
    }

    #[test]
    fn test_awaiter_registered_before_publish() {
        // Outside a runtime the network delivers inline, so the answer arrives during publish
        let network = MemNetwork::new();
        let manager = node(&network, 1);
        manager.handle("ping", |_| Bytes::from_static(b"pong"));
        assert!(manager.start());

        let awaiter = manager.request("ping", "x").unwrap();
        assert_eq!(manager.metrics().responses_delivered, 1);
        assert_eq!(manager.metrics().responses_dropped, 0);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let responses = runtime.block_on(awaiter.gather(Duration::from_millis(100)));
        assert_eq!(responses, vec![Bytes::from_static(b"pong")]);
        manager.stop();
    }

    #[test]
    fn test_handler_may_register_another_handler() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);
        let weak = Arc::downgrade(&manager);
        manager.handle_func(QueryHandler::predicate(move |query_type, _| {
            if query_type != "x" {
                return None;
            }
            if let Some(manager) = weak.upgrade() {
                manager.handle("late", |_| Bytes::from_static(b"late"));
            }
            Some(Bytes::from_static(b"x"))
        }));

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = manager.clone();
        std::thread::spawn(move || {
            let first = worker.on_request(&correlated_ssid(1), "x/1", Bytes::new());
            let second = worker.on_request(&correlated_ssid(2), "late/1", Bytes::new());
            let _ = tx.send((first.is_ok(), second.is_ok()));
        });

        let (first, second) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("on_request blocked on handler registration");
        assert!(first);
        assert!(second);
        assert_eq!(manager.metrics().requests_answered, 2);
    }

    #[test]
    fn test_stop_releases_broker_reference() {
        let network = MemNetwork::new();
        let manager = node(&network, 1);

        assert!(manager.start());
        assert_eq!(Arc::strong_count(&manager), 2);
        manager.stop();
        assert_eq!(Arc::strong_count(&manager), 1);
    }
}
