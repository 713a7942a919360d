//! Query error types

use std::num::ParseIntError;

use thiserror::Error;

use super::ssid::PeerName;

/// Errors raised while routing or issuing cluster queries
///
/// Every variant is local to a single message; none of them abort the manager.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid query received: expected 3 ssid segments, got {segments}")]
    InvalidQuery { segments: usize },

    #[error("Malformed reply address in channel '{channel}'")]
    MalformedReplyAddress {
        channel: String,
        #[source]
        source: Option<ParseIntError>,
    },

    #[error("No query handler found for {channel}")]
    NoHandlerFound { channel: String },

    #[error("Invalid query type '{query_type}': must not contain '/'")]
    InvalidQueryType { query_type: String },

    #[error("Reply peer {peer} is not a known cluster member")]
    PeerNotFound { peer: PeerName },

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Result alias for query operations
pub type QueryResult<T> = Result<T, QueryError>;
