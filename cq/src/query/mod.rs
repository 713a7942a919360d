//! Cluster-wide scatter-gather queries
//!
//! A node issues a query with [`QueryManager::request`]; the query is
//! published on the reserved query ssid, every peer's manager walks its
//! handlers and answers the originator directly, and the originator collects
//! the answers with [`QueryAwaiter::gather`]:
//! - **Request:** allocate a correlation id, register an awaiter, publish
//! - **Respond:** first claiming handler answers on the `"response"` channel
//! - **Gather:** wait for one answer per known peer or until the timeout
//!
//! There is no acknowledgement or retry; partial results are normal.

mod awaiter;
mod channel;
mod error;
mod handler;
mod manager;
mod metrics;
mod ssid;

pub use awaiter::{CorrelationTable, Delivery, QueryAwaiter};
pub use channel::{Channel, RESPONSE_CHANNEL, RequestChannel};
pub use error::{QueryError, QueryResult};
pub use handler::{HandlerRegistry, QueryHandler};
pub use manager::QueryManager;
pub use metrics::{QueryMetrics, QueryMetricsSnapshot};
pub use ssid::{PeerName, QUERY_NAMESPACE, QUERY_SSID_LEN, SYSTEM_NAMESPACE, Ssid, correlated_ssid, query_ssid};
