// src/core/monitor/health.rs

//! The background health-check engine.
//!
//! Every period the engine lists all known nodes and fans out one
//! lightweight reachability probe per node. The probes of a round run
//! concurrently behind a single multiplexed wait, never on the decision
//! path: the state machine only ever consumes the health flag the engine
//! maintains.
//!
//! A probe does not authenticate. Only reachability matters here, not data
//! access: the monitored engines accept the TCP connection before any
//! authentication exchange, so a completed handshake within the timeout
//! proves the process is alive.

use super::catalog::Catalog;
use super::notifications::{Event, Notifier, StateNotification};
use super::state::NodeHealth;
use crate::config::HealthCheckConfig;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info};

/// Lifecycle of one node's probe within a round. `Ok` and `Dead` are
/// terminal for the round; the engine re-arms every node on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Initial,
    Connecting,
    Retry,
    Ok,
    Dead,
}

/// The background task probing every known node.
pub struct HealthCheckEngine {
    catalog: Arc<dyn Catalog>,
    notifier: Arc<Notifier>,
    config: HealthCheckConfig,
}

impl HealthCheckEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        notifier: Arc<Notifier>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            catalog,
            notifier,
            config,
        }
    }

    /// The main run loop. Suspends only on the period timer and on the
    /// multiplexed probe wait.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Health check engine started with period {:?} and connect timeout {:?}.",
            self.config.period, self.config.connect_timeout
        );

        let mut tick = interval(self.config.period);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_round().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Health check engine shutting down.");
                    return;
                }
            }
        }
    }

    /// Probes every known node once. Each node is independent: a probe
    /// failure only ever degrades that node's flag, never the engine.
    pub async fn run_round(&self) {
        let nodes = self.catalog.all_nodes();

        if nodes.is_empty() {
            return;
        }

        let mut probes: FuturesUnordered<_> = nodes
            .into_iter()
            .map(|node| {
                let config = self.config.clone();
                async move {
                    let verdict = probe_node(&node.host, node.port, &config).await;
                    (node, verdict)
                }
            })
            .collect();

        while let Some((node, verdict)) = probes.next().await {
            record_health_state(self.catalog.as_ref(), &self.notifier, node.node_id, verdict);
        }
    }
}

/// Drives the probe state machine for a single node and returns the
/// verdict for this round.
pub async fn probe_node(host: &str, port: u16, config: &HealthCheckConfig) -> NodeHealth {
    let mut state = ProbeState::Initial;
    let mut attempts: u32 = 0;

    loop {
        match state {
            ProbeState::Initial | ProbeState::Retry => {
                if state == ProbeState::Retry {
                    if attempts > config.max_retries {
                        state = ProbeState::Dead;
                        continue;
                    }

                    sleep(config.retry_delay).await;
                }

                attempts += 1;
                state = ProbeState::Connecting;
            }
            ProbeState::Connecting => {
                // A probe exceeding its deadline is abandoned: dropping the
                // connect future closes the socket.
                match timeout(config.connect_timeout, TcpStream::connect((host, port))).await {
                    Ok(Ok(stream)) => {
                        drop(stream);
                        state = ProbeState::Ok;
                    }
                    Ok(Err(e)) => {
                        debug!("health probe of {host}:{port} failed: {e}");
                        state = ProbeState::Retry;
                    }
                    Err(_) => {
                        debug!("health probe of {host}:{port} timed out");
                        state = ProbeState::Retry;
                    }
                }
            }
            ProbeState::Ok => return NodeHealth::Good,
            ProbeState::Dead => return NodeHealth::Bad,
        }
    }
}

/// Records a health verdict. A flip gets the new health written with an
/// event and a notification; a no-flip verdict only refreshes the check
/// timestamp.
pub fn record_health_state(
    catalog: &dyn Catalog,
    notifier: &Notifier,
    node_id: i64,
    health: NodeHealth,
) {
    // The node might have been removed while its probe was in flight.
    let Some(before) = catalog.node_by_id(node_id) else {
        return;
    };

    catalog.set_health(node_id, health, Instant::now());

    if before.health != health {
        let Some(after) = catalog.node_by_id(node_id) else {
            return;
        };

        let description = format!(
            "Node {} ({}:{}) is marked \"{}\" by the health check",
            after.node_id,
            after.host,
            after.port,
            if health == NodeHealth::Good {
                "healthy"
            } else {
                "unhealthy"
            }
        );

        notifier.log_and_notify(&description);

        catalog.append_event(Event::for_node(&after, &description));
        notifier.notify_state_change(StateNotification::from_transition(
            &before,
            &after,
            &description,
        ));
    }
}
