//! Collaborator interfaces consumed by the query manager
//!
//! The pub/sub substrate ([`Broker`]) and the membership layer ([`Cluster`])
//! live outside this crate; the query manager only needs the capabilities
//! described here. [`mem`] provides an in-process implementation of both.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::query::{PeerName, QueryResult, Ssid};

pub mod mem;

pub use mem::{MemNetwork, MemNode};

/// How a subscriber is attached to the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberKind {
    /// A local, non-pattern subscriber
    Direct,
    /// A remote peer holding the subscription
    Remote,
}

/// Receives messages delivered by the pub/sub substrate
pub trait Subscriber: Send + Sync {
    /// Locally unique identifier of the subscriber
    fn id(&self) -> String;

    fn kind(&self) -> SubscriberKind;

    /// Inbound entry point, invoked once per delivered message
    fn send(&self, ssid: &Ssid, channel: &str, payload: Bytes) -> QueryResult<()>;
}

/// Publish/subscribe delivery substrate
pub trait Broker: Send + Sync {
    /// Register `subscriber` for every message whose ssid starts with `ssid`.
    /// Returns false if the subscription was not added.
    fn subscribe(&self, ssid: Ssid, subscriber: Arc<dyn Subscriber>) -> bool;

    /// Returns false if no such subscription existed
    fn unsubscribe(&self, ssid: &Ssid, subscriber_id: &str) -> bool;

    /// Fan a message out to every subscribed peer; fire-and-forget
    fn publish(&self, ssid: Ssid, channel: String, payload: Bytes);
}

/// A remote cluster member reachable through the transport
pub trait Peer: Send + Sync {
    fn name(&self) -> PeerName;

    fn send(&self, ssid: Ssid, channel: &str, payload: Bytes) -> QueryResult<()>;
}

/// Gossip-based membership view of the cluster
pub trait Cluster: Send + Sync {
    /// This node's stable address
    fn local_name(&self) -> PeerName;

    /// Number of currently known cluster members
    fn num_peers(&self) -> usize;

    fn find_peer(&self, name: PeerName) -> Option<Arc<dyn Peer>>;

    /// Tell the rest of the cluster this node now carries `ssid`
    fn notify_subscribe(&self, subscriber_id: &str, ssid: &Ssid);

    fn notify_unsubscribe(&self, subscriber_id: &str, ssid: &Ssid);
}
