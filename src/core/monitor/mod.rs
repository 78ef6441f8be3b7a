// src/core/monitor/mod.rs

//! The main module for steward's high-availability monitor.
//!
//! The monitor is the single logical decision-maker for one or more
//! formations of replicated database nodes. It is responsible for:
//! - Consuming the periodic state reports of every node's agent.
//! - Independently probing node reachability in the background.
//! - Running the group state machine that decides which node is writable,
//!   which are replicas, and when to fail over, promote, demote, or
//!   quarantine a node.
//! - Recording every decision as an event and publishing change
//!   notifications.

use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

// Declare all sub-modules that make up the monitor functionality.
pub mod catalog;
pub mod fsm;
pub mod health;
pub mod locks;
pub mod notifications;
pub mod quorum;
pub mod service;
pub mod state;

use self::catalog::{Catalog, MemoryCatalog};
use self::fsm::GroupStateMachine;
use self::health::HealthCheckEngine;
use self::locks::LockCoordinator;
use self::notifications::{Notifier, StateNotification};
use self::state::NodeHealth;
use crate::config::{Config, HealthCheckConfig, TimingConfig};

/// The monitor engine. All operations are async methods on this type; see
/// the `service` module for the operation implementations.
pub struct Monitor {
    catalog: Arc<dyn Catalog>,
    notifier: Arc<Notifier>,
    locks: LockCoordinator,
    timing: TimingConfig,
    health_config: HealthCheckConfig,
    /// When this monitor instance started; gates the startup grace period.
    started_at: Instant,
}

impl Monitor {
    /// Creates a monitor backed by the in-memory catalog.
    pub fn new(config: &Config) -> Self {
        Self::with_catalog(Arc::new(MemoryCatalog::new()), config)
    }

    /// Creates a monitor on top of an existing catalog.
    pub fn with_catalog(catalog: Arc<dyn Catalog>, config: &Config) -> Self {
        Self {
            catalog,
            notifier: Arc::new(Notifier::new()),
            locks: LockCoordinator::new(),
            timing: config.timing.clone(),
            health_config: config.health.clone(),
            started_at: Instant::now(),
        }
    }

    /// One evaluation context of the group state machine, bound to this
    /// monitor's catalog, notifier, and tunables.
    fn fsm(&self) -> GroupStateMachine<'_> {
        GroupStateMachine {
            catalog: self.catalog.as_ref(),
            notifier: &self.notifier,
            timing: &self.timing,
            started_at: self.started_at,
        }
    }

    /// Subscribes to the structured state-change channel.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateNotification> {
        self.notifier.subscribe_state()
    }

    /// Subscribes to the free-text log channel.
    pub fn subscribe_log(&self) -> broadcast::Receiver<String> {
        self.notifier.subscribe_log()
    }

    /// The health-check engine bound to this monitor's catalog. Run it as
    /// its own task: probing must never share a task with goal-state
    /// computation.
    pub fn health_check_engine(&self) -> HealthCheckEngine {
        HealthCheckEngine::new(
            self.catalog.clone(),
            self.notifier.clone(),
            self.health_config.clone(),
        )
    }

    /// Records a health verdict for a node: the write path of the
    /// health-check engine. A verdict flip is recorded as an event; a
    /// no-flip verdict only refreshes the check timestamp.
    pub fn set_node_health(&self, node_id: i64, node_health: NodeHealth) {
        health::record_health_state(self.catalog.as_ref(), &self.notifier, node_id, node_health);
    }
}

/// The main entry point for running the monitor with its background tasks.
pub async fn run(config: Config) -> Result<()> {
    let monitor = Arc::new(Monitor::new(&config));

    info!("Monitor starting with health check period {:?}.", config.health.period);

    // A JoinSet to manage all spawned asynchronous tasks.
    let mut tasks: JoinSet<()> = JoinSet::new();

    let (shutdown_tx, _) = broadcast::channel(1);

    tasks.spawn(monitor.health_check_engine().run(shutdown_tx.subscribe()));

    // Tail the state channel into the process log, so every decision is
    // visible even without a connected subscriber.
    let mut state_rx = monitor.subscribe_state();
    tasks.spawn(async move {
        loop {
            match state_rx.recv().await {
                Ok(notification) => match serde_json::to_string(&notification) {
                    Ok(payload) => info!(target: "steward::state", "{payload}"),
                    Err(e) => warn!("failed to encode state notification: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("state notification tail lagged by {missed} messages");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    // In normal operation these tasks run forever; any of them exiting is
    // a monitor-level failure.
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(()) => warn!("A monitor task completed unexpectedly."),
            Err(e) => error!("A monitor task panicked: {e}"),
        }
    }

    Err(anyhow!("All monitor tasks have terminated. Shutting down."))
}
