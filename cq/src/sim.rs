//! In-process cluster simulation
//!
//! Builds a [`MemNetwork`] of query managers where every node except the
//! configured silent ones answers one query type, then issues that query from
//! the first node and gathers the answers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::MemNetwork;
use crate::config::SimulationConfig;
use crate::query::{PeerName, QueryManager, QueryMetricsSnapshot, QueryResult};

/// Result of one simulated query
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimulationReport {
    pub query_type: String,
    pub expected: usize,
    /// Responses in arrival order, lossily decoded as UTF-8
    pub responses: Vec<String>,
    pub elapsed_ms: u64,
    pub metrics: QueryMetricsSnapshot,
}

impl SimulationReport {
    pub fn is_complete(&self) -> bool {
        self.responses.len() == self.expected
    }
}

/// A running set of simulated nodes
pub struct Simulation {
    network: MemNetwork,
    managers: Vec<Arc<QueryManager>>,
}

impl Simulation {
    /// Start `config.peers` nodes; the last `config.silent_peers` answer nothing
    pub fn start(config: &SimulationConfig, query_type: &str) -> Self {
        debug!(?config, %query_type, "Simulation::start: called");
        let network = MemNetwork::new();
        network.set_default_latency(Duration::from_millis(config.latency_ms));

        let answering = config.peers.saturating_sub(config.silent_peers);
        let managers = (1..=config.peers as u64)
            .map(|name| {
                let node = Arc::new(network.join(PeerName(name)));
                let manager = QueryManager::new(node.clone(), node);
                if name as usize <= answering {
                    manager.handle(query_type, move |payload| {
                        Bytes::from(format!("{}:{}", name, String::from_utf8_lossy(payload)))
                    });
                }
                if !manager.start() {
                    warn!(%name, "Simulation::start: node refused the query subscription");
                }
                manager
            })
            .collect();

        Self { network, managers }
    }

    pub fn network(&self) -> &MemNetwork {
        &self.network
    }

    /// The node issuing queries
    pub fn origin(&self) -> Option<&Arc<QueryManager>> {
        self.managers.first()
    }

    /// Issue one query from the origin node and gather the answers
    pub async fn run(&self, query_type: &str, payload: &str, timeout: Duration) -> QueryResult<SimulationReport> {
        let Some(origin) = self.origin() else {
            return Ok(SimulationReport {
                query_type: query_type.to_string(),
                expected: 0,
                responses: Vec::new(),
                elapsed_ms: 0,
                metrics: QueryMetricsSnapshot::default(),
            });
        };

        let started = Instant::now();
        let awaiter = origin.request(query_type, payload.to_string())?;
        let expected = awaiter.maximum();
        let responses: Vec<String> = awaiter
            .gather(timeout)
            .await
            .iter()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .collect();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(%query_type, expected, received = responses.len(), elapsed_ms, "Simulation::run: gathered");
        Ok(SimulationReport {
            query_type: query_type.to_string(),
            expected,
            responses,
            elapsed_ms,
            metrics: origin.metrics(),
        })
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        // Subscriptions hold the managers; release them with the network
        for manager in &self.managers {
            manager.stop();
        }
    }
}
