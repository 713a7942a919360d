//! Subscription identifiers and cluster addresses used by query traffic

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved namespace for system (non-user) subscriptions.
/// Every node in the cluster must agree on this value.
pub const SYSTEM_NAMESPACE: u32 = 0;

/// Reserved namespace for query traffic inside [`SYSTEM_NAMESPACE`].
/// Every node in the cluster must agree on this value.
pub const QUERY_NAMESPACE: u32 = 3_939_663_052;

/// Number of segments carried by every query message: system, query, correlation id.
pub const QUERY_SSID_LEN: usize = 3;

/// Subscription identifier: an ordered tuple of numeric segments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ssid(Vec<u32>);

impl Ssid {
    pub fn new(segments: impl Into<Vec<u32>>) -> Self {
        Self(segments.into())
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `self` is a (non-strict) prefix of `other`
    ///
    /// The pub/sub substrate delivers a message to a subscriber when the
    /// subscribed ssid is a prefix of the message's ssid.
    pub fn is_prefix_of(&self, other: &Ssid) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Correlation id carried by a query ssid (third segment)
    pub fn correlation_id(&self) -> Option<u32> {
        if self.0.len() == QUERY_SSID_LEN {
            Some(self.0[2])
        } else {
            None
        }
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

impl From<Vec<u32>> for Ssid {
    fn from(segments: Vec<u32>) -> Self {
        Self(segments)
    }
}

/// The ssid every query manager subscribes to
pub fn query_ssid() -> Ssid {
    Ssid(vec![SYSTEM_NAMESPACE, QUERY_NAMESPACE])
}

/// The ssid addressing one outstanding query
pub fn correlated_ssid(correlation_id: u32) -> Ssid {
    Ssid(vec![SYSTEM_NAMESPACE, QUERY_NAMESPACE, correlation_id])
}

/// Stable numeric address of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerName(pub u64);

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerName {
    fn from(name: u64) -> Self {
        Self(name)
    }
}
