//! In-process pub/sub and membership substrate
//!
//! This is NOT a production transport. Every node lives in the same process
//! and messages are handed over through tokio tasks, optionally delayed per
//! link so tests can control arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::{Broker, Cluster, Peer, Subscriber};
use crate::query::{PeerName, QueryError, QueryResult, Ssid};

type SubscriptionKey = (String, Ssid);

#[derive(Default)]
struct NodeState {
    subscriptions: DashMap<SubscriptionKey, Arc<dyn Subscriber>>,
    /// Subscriptions this node has announced to the cluster
    announced: DashMap<String, Ssid>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: DashMap<PeerName, Arc<NodeState>>,
    latency: DashMap<(PeerName, PeerName), Duration>,
    default_latency_us: AtomicU64,
}

impl NetworkInner {
    fn latency(&self, from: PeerName, to: PeerName) -> Duration {
        self.latency
            .get(&(from, to))
            .map(|l| *l)
            .unwrap_or_else(|| Duration::from_micros(self.default_latency_us.load(Ordering::Relaxed)))
    }

    /// Deliver to every subscriber on `to` whose subscription prefixes `ssid`
    fn deliver(self: &Arc<Self>, from: PeerName, to: PeerName, ssid: Ssid, channel: String, payload: Bytes) -> bool {
        if !self.nodes.contains_key(&to) {
            return false;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Outside a runtime there is nothing to delay on
            self.dispatch(to, &ssid, &channel, payload);
            return true;
        };

        let latency = self.latency(from, to);
        let inner = self.clone();
        handle.spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            inner.dispatch(to, &ssid, &channel, payload);
        });
        true
    }

    fn dispatch(&self, to: PeerName, ssid: &Ssid, channel: &str, payload: Bytes) {
        // The node may have left while the message was in flight
        let Some(node) = self.nodes.get(&to).map(|n| n.clone()) else {
            trace!(%to, "MemNetwork::dispatch: target left, dropping");
            return;
        };

        let targets: Vec<Arc<dyn Subscriber>> = node
            .subscriptions
            .iter()
            .filter(|entry| entry.key().1.is_prefix_of(ssid))
            .map(|entry| entry.value().clone())
            .collect();

        for subscriber in targets {
            if let Err(e) = subscriber.send(ssid, channel, payload.clone()) {
                debug!(%to, subscriber = %subscriber.id(), %ssid, %channel, error = %e, "MemNetwork::dispatch: subscriber rejected message");
            }
        }
    }
}

/// A set of in-process nodes that can reach each other
#[derive(Clone, Default)]
pub struct MemNetwork {
    inner: Arc<NetworkInner>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the cluster and return its local view
    pub fn join(&self, name: PeerName) -> MemNode {
        debug!(%name, "MemNetwork::join: called");
        self.inner.nodes.entry(name).or_default();
        MemNode {
            name,
            network: self.inner.clone(),
        }
    }

    /// Remove a node; in-flight messages addressed to it are dropped
    pub fn leave(&self, name: PeerName) {
        debug!(%name, "MemNetwork::leave: called");
        self.inner.nodes.remove(&name);
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Delay every message travelling from `from` to `to`
    pub fn set_latency(&self, from: PeerName, to: PeerName, latency: Duration) {
        self.inner.latency.insert((from, to), latency);
    }

    /// Delay applied to links without an explicit latency
    pub fn set_default_latency(&self, latency: Duration) {
        self.inner
            .default_latency_us
            .store(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Whether `name` has announced a subscription held by `subscriber_id`
    pub fn is_announced(&self, name: PeerName, subscriber_id: &str) -> bool {
        self.inner
            .nodes
            .get(&name)
            .is_some_and(|node| node.announced.contains_key(subscriber_id))
    }
}

impl std::fmt::Debug for MemNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemNetwork").field("nodes", &self.inner.nodes.len()).finish()
    }
}

/// One node's handle on a [`MemNetwork`]: its broker and its membership view
#[derive(Clone)]
pub struct MemNode {
    name: PeerName,
    network: Arc<NetworkInner>,
}

impl MemNode {
    pub fn name(&self) -> PeerName {
        self.name
    }

    fn state(&self) -> Option<Arc<NodeState>> {
        self.network.nodes.get(&self.name).map(|n| n.clone())
    }
}

impl std::fmt::Debug for MemNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemNode").field("name", &self.name).finish()
    }
}

impl Broker for MemNode {
    fn subscribe(&self, ssid: Ssid, subscriber: Arc<dyn Subscriber>) -> bool {
        let Some(state) = self.state() else {
            warn!(name = %self.name, "MemNode::subscribe: node is not part of the network");
            return false;
        };

        let key = (subscriber.id(), ssid);
        if state.subscriptions.contains_key(&key) {
            debug!(name = %self.name, subscriber = %key.0, "MemNode::subscribe: already subscribed");
            return false;
        }
        state.subscriptions.insert(key, subscriber);
        true
    }

    fn unsubscribe(&self, ssid: &Ssid, subscriber_id: &str) -> bool {
        self.state()
            .and_then(|state| state.subscriptions.remove(&(subscriber_id.to_string(), ssid.clone())))
            .is_some()
    }

    fn publish(&self, ssid: Ssid, channel: String, payload: Bytes) {
        trace!(from = %self.name, %ssid, %channel, "MemNode::publish: called");
        let names: Vec<PeerName> = self.network.nodes.iter().map(|n| *n.key()).collect();
        for to in names {
            self.network
                .deliver(self.name, to, ssid.clone(), channel.clone(), payload.clone());
        }
    }
}

impl Cluster for MemNode {
    fn local_name(&self) -> PeerName {
        self.name
    }

    fn num_peers(&self) -> usize {
        self.network.nodes.len()
    }

    fn find_peer(&self, name: PeerName) -> Option<Arc<dyn Peer>> {
        if !self.network.nodes.contains_key(&name) {
            return None;
        }
        let peer: Arc<dyn Peer> = Arc::new(MemPeer {
            from: self.name,
            to: name,
            network: self.network.clone(),
        });
        Some(peer)
    }

    fn notify_subscribe(&self, subscriber_id: &str, ssid: &Ssid) {
        debug!(name = %self.name, %subscriber_id, %ssid, "MemNode::notify_subscribe: called");
        if let Some(state) = self.state() {
            state.announced.insert(subscriber_id.to_string(), ssid.clone());
        }
    }

    fn notify_unsubscribe(&self, subscriber_id: &str, ssid: &Ssid) {
        debug!(name = %self.name, %subscriber_id, %ssid, "MemNode::notify_unsubscribe: called");
        if let Some(state) = self.state() {
            state.announced.remove(subscriber_id);
        }
    }
}

/// Point-to-point link from one node to another
struct MemPeer {
    from: PeerName,
    to: PeerName,
    network: Arc<NetworkInner>,
}

impl Peer for MemPeer {
    fn name(&self) -> PeerName {
        self.to
    }

    fn send(&self, ssid: Ssid, channel: &str, payload: Bytes) -> QueryResult<()> {
        if self
            .network
            .deliver(self.from, self.to, ssid, channel.to_string(), payload)
        {
            Ok(())
        } else {
            Err(QueryError::Delivery(format!("peer {} is unreachable", self.to)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SubscriberKind;
    use crate::query::{correlated_ssid, query_ssid};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Recorder {
        id: String,
        tx: mpsc::UnboundedSender<(Ssid, String, Bytes)>,
    }

    impl Subscriber for Recorder {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn kind(&self) -> SubscriberKind {
            SubscriberKind::Direct
        }

        fn send(&self, ssid: &Ssid, channel: &str, payload: Bytes) -> QueryResult<()> {
            let _ = self.tx.send((ssid.clone(), channel.to_string(), payload));
            Ok(())
        }
    }

    fn recorder(id: &str) -> (Arc<Recorder>, mpsc::UnboundedReceiver<(Ssid, String, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { id: id.to_string(), tx }), rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_prefix_subscribers_on_all_nodes() {
        let network = MemNetwork::new();
        let a = network.join(PeerName(1));
        let b = network.join(PeerName(2));

        let (ra, mut rx_a) = recorder("a");
        let (rb, mut rx_b) = recorder("b");
        assert!(a.subscribe(query_ssid(), ra));
        assert!(b.subscribe(query_ssid(), rb));

        a.publish(correlated_ssid(9), "ping/1".to_string(), Bytes::from_static(b"x"));

        let (ssid, channel, payload) = rx_a.recv().await.unwrap();
        assert_eq!(ssid, correlated_ssid(9));
        assert_eq!(channel, "ping/1");
        assert_eq!(payload, Bytes::from_static(b"x"));
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_rejected() {
        let network = MemNetwork::new();
        let a = network.join(PeerName(1));
        let (ra, _rx) = recorder("a");

        assert!(a.subscribe(query_ssid(), ra.clone()));
        assert!(!a.subscribe(query_ssid(), ra));
        assert!(a.unsubscribe(&query_ssid(), "a"));
        assert!(!a.unsubscribe(&query_ssid(), "a"));
    }

    #[tokio::test]
    async fn test_peer_send_only_reaches_target() {
        let network = MemNetwork::new();
        let a = network.join(PeerName(1));
        let b = network.join(PeerName(2));
        let (ra, mut rx_a) = recorder("a");
        let (rb, mut rx_b) = recorder("b");
        a.subscribe(query_ssid(), ra);
        b.subscribe(query_ssid(), rb);

        let peer = a.find_peer(PeerName(2)).unwrap();
        assert_eq!(peer.name(), PeerName(2));
        peer.send(correlated_ssid(1), "response", Bytes::new()).unwrap();

        assert!(rx_b.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_peer_not_found() {
        let network = MemNetwork::new();
        let a = network.join(PeerName(1));
        assert!(a.find_peer(PeerName(77)).is_none());
        assert_eq!(a.num_peers(), 1);
    }

    #[tokio::test]
    async fn test_latency_orders_arrival() {
        let network = MemNetwork::new();
        let a = network.join(PeerName(1));
        let b = network.join(PeerName(2));
        let (rb, mut rx_b) = recorder("b");
        b.subscribe(query_ssid(), rb);

        network.set_latency(PeerName(1), PeerName(2), Duration::from_millis(40));
        let slow = a.find_peer(PeerName(2)).unwrap();
        slow.send(correlated_ssid(1), "response", Bytes::from_static(b"slow")).unwrap();
        // Same node delivering to itself has no delay configured
        let fast = b.find_peer(PeerName(2)).unwrap();
        fast.send(correlated_ssid(1), "response", Bytes::from_static(b"fast")).unwrap();

        assert_eq!(rx_b.recv().await.unwrap().2, Bytes::from_static(b"fast"));
        assert_eq!(rx_b.recv().await.unwrap().2, Bytes::from_static(b"slow"));
    }

    #[tokio::test]
    async fn test_left_node_unreachable() {
        let network = MemNetwork::new();
        let a = network.join(PeerName(1));
        network.join(PeerName(2));
        let peer = a.find_peer(PeerName(2)).unwrap();

        network.leave(PeerName(2));
        assert!(peer.send(correlated_ssid(1), "response", Bytes::new()).is_err());
        assert_eq!(network.node_count(), 1);
    }

    #[tokio::test]
    async fn test_notify_subscribe_records_announcement() {
        let network = MemNetwork::new();
        let a = network.join(PeerName(1));
        a.notify_subscribe("mgr", &query_ssid());
        assert!(network.is_announced(PeerName(1), "mgr"));
        a.notify_unsubscribe("mgr", &query_ssid());
        assert!(!network.is_announced(PeerName(1), "mgr"));
    }

    #[test]
    fn test_default_latency_saturates() {
        let network = MemNetwork::new();
        network.set_default_latency(Duration::MAX);
        assert_eq!(
            network.inner.latency(PeerName(1), PeerName(2)),
            Duration::from_micros(u64::MAX)
        );

        network.set_default_latency(Duration::from_millis(5));
        assert_eq!(network.inner.latency(PeerName(1), PeerName(2)), Duration::from_millis(5));
    }

    #[test]
    fn test_delivery_outside_runtime_is_inline() {
        let network = MemNetwork::new();
        let a = network.join(PeerName(1));
        let seen = Arc::new(Mutex::new(0usize));

        struct Counter(Arc<Mutex<usize>>);
        impl Subscriber for Counter {
            fn id(&self) -> String {
                "counter".to_string()
            }
            fn kind(&self) -> SubscriberKind {
                SubscriberKind::Direct
            }
            fn send(&self, _: &Ssid, _: &str, _: Bytes) -> QueryResult<()> {
                *self.0.lock().unwrap() += 1;
                Ok(())
            }
        }

        a.subscribe(query_ssid(), Arc::new(Counter(seen.clone())));
        a.publish(correlated_ssid(3), "ping/1".to_string(), Bytes::new());
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
