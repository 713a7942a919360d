//! clusterquery - cluster-wide request/response over a pub/sub bus
//!
//! A node broadcasts a query to every peer subscribed to a reserved system
//! channel; each peer's registered handlers may answer, answers are routed
//! back to the originator by correlation id, and the originator gathers as
//! many answers as it knows peers, bounded by a timeout.
//!
//! # Modules
//!
//! - [`query`] - Query manager, awaiter, handlers and wire encoding
//! - [`cluster`] - Pub/sub and membership interfaces, plus an in-process network
//! - [`sim`] - In-process cluster simulation used by the CLI
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod cluster;
pub mod config;
pub mod query;
pub mod sim;

// Re-export commonly used types
pub use cluster::{Broker, Cluster, MemNetwork, MemNode, Peer, Subscriber, SubscriberKind};
pub use config::Config;
pub use query::{
    PeerName, QueryAwaiter, QueryError, QueryHandler, QueryManager, QueryMetricsSnapshot, QueryResult, Ssid,
};
pub use sim::{Simulation, SimulationReport};
