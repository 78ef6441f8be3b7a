// src/core/monitor/catalog.rs

//! The monitor's catalog: formations, nodes, and the append-only event log
//! behind a narrow storage interface.
//!
//! The group state machine and the health-check engine are written against
//! the `Catalog` trait, not a concrete store, so they stay storage-agnostic
//! and unit-testable. This module ships the in-memory implementation used by
//! the monitor process.

use super::notifications::Event;
use super::state::{Formation, FormationKind, Lsn, Node, NodeHealth, ReplicationState, SyncState};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// The storage interface of the monitor.
///
/// All mutation happens under the lock coordinator, so implementations only
/// need each individual method to be atomic.
pub trait Catalog: Send + Sync {
    fn add_formation(&self, formation: Formation);
    fn formation(&self, formation_id: &str) -> Option<Formation>;
    fn remove_formation(&self, formation_id: &str);
    fn set_formation_kind(&self, formation_id: &str, kind: FormationKind);
    fn set_formation_dbname(&self, formation_id: &str, dbname: &str);
    fn set_formation_opt_secondary(&self, formation_id: &str, opt_secondary: bool);
    fn set_formation_number_sync_standbys(&self, formation_id: &str, number_sync_standbys: i32);

    /// Inserts the node and returns its monitor-assigned id.
    fn insert_node(&self, node: Node) -> i64;
    fn node_by_id(&self, node_id: i64) -> Option<Node>;
    fn node_by_host_port(&self, host: &str, port: u16) -> Option<Node>;
    fn node_by_name(&self, formation_id: &str, name: &str) -> Option<Node>;
    fn nodes_in_group(&self, formation_id: &str, group_id: i32) -> Vec<Node>;
    fn nodes_in_formation(&self, formation_id: &str) -> Vec<Node>;
    fn all_nodes(&self) -> Vec<Node>;
    fn remove_node(&self, node_id: i64);

    /// Writes a new goal state; only the group state machine calls this.
    fn set_goal_state(&self, node_id: i64, goal_state: ReplicationState);

    /// Records an agent report; always refreshes the report time, whether
    /// the reported state changed or not.
    fn record_report(
        &self,
        node_id: i64,
        reported_state: ReplicationState,
        pg_is_running: bool,
        sync_state: SyncState,
        reported_tli: u32,
        reported_lsn: Lsn,
    );

    /// Writes a health verdict; only the health-check engine calls this.
    fn set_health(&self, node_id: i64, health: NodeHealth, at: Instant);

    fn set_replication_settings(
        &self,
        node_id: i64,
        candidate_priority: i32,
        replication_quorum: bool,
    );
    fn set_node_name(&self, node_id: i64, name: &str);

    /// Appends the event to the log and returns its assigned id.
    fn append_event(&self, event: Event) -> i64;
    fn last_events(&self, formation_id: &str, count: usize) -> Vec<Event>;
}

/// The in-memory catalog backing a monitor process.
#[derive(Debug)]
pub struct MemoryCatalog {
    formations: DashMap<String, Formation>,
    nodes: DashMap<i64, Node>,
    events: RwLock<Vec<Event>>,
    node_id_seq: AtomicI64,
    event_id_seq: AtomicI64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            formations: DashMap::new(),
            nodes: DashMap::new(),
            events: RwLock::new(Vec::new()),
            node_id_seq: AtomicI64::new(1),
            event_id_seq: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for MemoryCatalog {
    fn add_formation(&self, formation: Formation) {
        self.formations
            .insert(formation.formation_id.clone(), formation);
    }

    fn formation(&self, formation_id: &str) -> Option<Formation> {
        self.formations.get(formation_id).map(|f| f.clone())
    }

    fn remove_formation(&self, formation_id: &str) {
        self.formations.remove(formation_id);
    }

    fn set_formation_kind(&self, formation_id: &str, kind: FormationKind) {
        if let Some(mut formation) = self.formations.get_mut(formation_id) {
            formation.kind = kind;
        }
    }

    fn set_formation_dbname(&self, formation_id: &str, dbname: &str) {
        if let Some(mut formation) = self.formations.get_mut(formation_id) {
            formation.dbname = dbname.to_string();
        }
    }

    fn set_formation_opt_secondary(&self, formation_id: &str, opt_secondary: bool) {
        if let Some(mut formation) = self.formations.get_mut(formation_id) {
            formation.opt_secondary = opt_secondary;
        }
    }

    fn set_formation_number_sync_standbys(&self, formation_id: &str, number_sync_standbys: i32) {
        if let Some(mut formation) = self.formations.get_mut(formation_id) {
            formation.number_sync_standbys = number_sync_standbys;
        }
    }

    fn insert_node(&self, mut node: Node) -> i64 {
        let node_id = self.node_id_seq.fetch_add(1, Ordering::SeqCst);
        node.node_id = node_id;
        self.nodes.insert(node_id, node);
        node_id
    }

    fn node_by_id(&self, node_id: i64) -> Option<Node> {
        self.nodes.get(&node_id).map(|n| n.clone())
    }

    fn node_by_host_port(&self, host: &str, port: u16) -> Option<Node> {
        self.nodes
            .iter()
            .find(|n| n.host == host && n.port == port)
            .map(|n| n.clone())
    }

    fn node_by_name(&self, formation_id: &str, name: &str) -> Option<Node> {
        self.nodes
            .iter()
            .find(|n| n.formation_id == formation_id && n.name == name)
            .map(|n| n.clone())
    }

    fn nodes_in_group(&self, formation_id: &str, group_id: i32) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.formation_id == formation_id && n.group_id == group_id)
            .map(|n| n.clone())
            .collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    fn nodes_in_formation(&self, formation_id: &str) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.formation_id == formation_id)
            .map(|n| n.clone())
            .collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    fn all_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    fn remove_node(&self, node_id: i64) {
        self.nodes.remove(&node_id);
    }

    fn set_goal_state(&self, node_id: i64, goal_state: ReplicationState) {
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            node.goal_state = goal_state;
            node.state_change_time = Instant::now();
        }
    }

    fn record_report(
        &self,
        node_id: i64,
        reported_state: ReplicationState,
        pg_is_running: bool,
        sync_state: SyncState,
        reported_tli: u32,
        reported_lsn: Lsn,
    ) {
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            node.reported_state = reported_state;
            node.pg_is_running = pg_is_running;
            node.sync_state = sync_state;
            node.reported_tli = reported_tli;
            node.reported_lsn = reported_lsn;
            node.report_time = Some(Instant::now());
        }
    }

    fn set_health(&self, node_id: i64, health: NodeHealth, at: Instant) {
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            node.health = health;
            node.health_check_time = Some(at);
        }
    }

    fn set_replication_settings(
        &self,
        node_id: i64,
        candidate_priority: i32,
        replication_quorum: bool,
    ) {
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            node.candidate_priority = candidate_priority;
            node.replication_quorum = replication_quorum;
        }
    }

    fn set_node_name(&self, node_id: i64, name: &str) {
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            node.name = name.to_string();
        }
    }

    fn append_event(&self, mut event: Event) -> i64 {
        let event_id = self.event_id_seq.fetch_add(1, Ordering::SeqCst);
        event.event_id = event_id;
        self.events.write().push(event);
        event_id
    }

    fn last_events(&self, formation_id: &str, count: usize) -> Vec<Event> {
        let events = self.events.read();
        events
            .iter()
            .rev()
            .filter(|e| e.formation_id == formation_id)
            .take(count)
            .cloned()
            .collect()
    }
}
