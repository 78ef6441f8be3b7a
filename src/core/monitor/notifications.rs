// src/core/monitor/notifications.rs

//! Events and change notifications emitted for every monitor decision.
//!
//! Every accepted state mutation is first appended to the catalog's event
//! log (durable, the source of truth an auditing client can replay), then
//! broadcast on two channels: a structured "state" channel for machines and
//! a free-text "log" channel for humans. Broadcasts happen under the group
//! lock, in decision order, so per-node ordering is guaranteed.

use super::state::{Lsn, Node, NodeHealth, ReplicationState, SyncState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// Capacity of the state and log broadcast channels. Subscribers that lag
/// behind miss broadcasts but can replay from the event log.
const NOTIFICATION_BUS_CAPACITY: usize = 1024;

/// An immutable, append-only audit record of one monitor decision or
/// observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monitor-assigned, zero until the event is appended to the log.
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    pub formation_id: String,
    pub node_id: i64,
    pub group_id: i32,
    pub node_name: String,
    pub node_host: String,
    pub node_port: u16,
    pub reported_state: ReplicationState,
    pub goal_state: ReplicationState,
    pub sync_state: SyncState,
    pub reported_lsn: Lsn,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
    pub description: String,
}

impl Event {
    /// Captures the current observable state of a node along with the
    /// decision description.
    pub fn for_node(node: &Node, description: impl Into<String>) -> Event {
        Event {
            event_id: 0,
            timestamp: Utc::now(),
            formation_id: node.formation_id.clone(),
            node_id: node.node_id,
            group_id: node.group_id,
            node_name: node.name.clone(),
            node_host: node.host.clone(),
            node_port: node.port,
            reported_state: node.reported_state,
            goal_state: node.goal_state,
            sync_state: node.sync_state,
            reported_lsn: node.reported_lsn,
            candidate_priority: node.candidate_priority,
            replication_quorum: node.replication_quorum,
            description: description.into(),
        }
    }
}

/// The structured payload published on the state channel whenever the
/// monitor accepts a state mutation for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateNotification {
    pub formation_id: String,
    pub node_id: i64,
    pub group_id: i32,
    pub node_name: String,
    pub node_host: String,
    pub node_port: u16,
    pub old_reported_state: ReplicationState,
    pub old_goal_state: ReplicationState,
    pub reported_state: ReplicationState,
    pub goal_state: ReplicationState,
    pub health: NodeHealth,
    pub description: String,
}

impl StateNotification {
    pub fn from_transition(before: &Node, after: &Node, description: impl Into<String>) -> Self {
        StateNotification {
            formation_id: after.formation_id.clone(),
            node_id: after.node_id,
            group_id: after.group_id,
            node_name: after.name.clone(),
            node_host: after.host.clone(),
            node_port: after.port,
            old_reported_state: before.reported_state,
            old_goal_state: before.goal_state,
            reported_state: after.reported_state,
            goal_state: after.goal_state,
            health: after.health,
            description: description.into(),
        }
    }
}

/// The notification hub: a broadcast sender per logical channel.
#[derive(Debug)]
pub struct Notifier {
    state_tx: broadcast::Sender<StateNotification>,
    log_tx: broadcast::Sender<String>,
}

impl Notifier {
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(NOTIFICATION_BUS_CAPACITY);
        let (log_tx, _) = broadcast::channel(NOTIFICATION_BUS_CAPACITY);
        Self { state_tx, log_tx }
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateNotification> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_log(&self) -> broadcast::Receiver<String> {
        self.log_tx.subscribe()
    }

    /// Emits the given message both as a log entry and on the log channel.
    pub fn log_and_notify(&self, message: &str) {
        info!("{message}");

        // A send error only means nobody is listening right now.
        let _ = self.log_tx.send(message.to_string());
    }

    /// Publishes a state change on the state channel.
    pub fn notify_state_change(&self, notification: StateNotification) {
        let _ = self.state_tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
