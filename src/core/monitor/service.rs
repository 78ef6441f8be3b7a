// src/core/monitor/service.rs

//! The monitor operations: registration, reporting, removal, manual
//! failover, maintenance, and replication settings.
//!
//! Every operation validates its inputs first, then takes the formation
//! and group locks in that order, mutates the catalog, runs the group
//! state machine, and returns the resulting assignment synchronously. The
//! state machine itself never errors; a returned error means no state
//! mutation is visible to anyone.

use super::Monitor;
use super::fsm::{assign_goal_state, notify_current_state};
use super::notifications::Event;
use super::quorum;
use super::state::{
    Formation, FormationKind, Lsn, MAX_USER_CANDIDATE_PRIORITY, Node, NodeHealth,
    ReplicationState, SyncState, count_sync_standbys, find_candidate_being_promoted,
    find_node_to_failover_from, find_primary_node, find_primary_or_demoted_node,
};
use crate::core::errors::StewardError;
use std::time::Instant;

use ReplicationState::*;

/// A registration request, as sent by a node's agent.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub formation_id: String,
    /// Empty lets the monitor pick a name derived from the node id.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    /// Negative lets the monitor pick the group.
    pub group_id: i32,
    /// `init` lets the monitor pick whatever is needed now.
    pub requested_state: ReplicationState,
    pub node_kind: String,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
}

/// A periodic report from a node's agent.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node_id: i64,
    pub group_id: i32,
    pub reported_state: ReplicationState,
    pub pg_is_running: bool,
    pub reported_tli: u32,
    pub reported_lsn: Lsn,
    pub sync_state: SyncState,
}

/// The assignment returned to an agent after registration or a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAssignment {
    pub node_id: i64,
    pub group_id: i32,
    pub goal_state: ReplicationState,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
    pub name: String,
}

impl From<&Node> for NodeAssignment {
    fn from(node: &Node) -> Self {
        NodeAssignment {
            node_id: node.node_id,
            group_id: node.group_id,
            goal_state: node.goal_state,
            candidate_priority: node.candidate_priority,
            replication_quorum: node.replication_quorum,
            name: node.name.clone(),
        }
    }
}

impl Monitor {
    /// Creates a new formation. Nodes can only register into an existing
    /// formation.
    pub async fn create_formation(
        &self,
        formation_id: &str,
        kind: FormationKind,
        dbname: &str,
        opt_secondary: bool,
        number_sync_standbys: i32,
    ) -> Result<Formation, StewardError> {
        if number_sync_standbys < 0 {
            return Err(StewardError::InvalidParameter(format!(
                "invalid value for number_sync_standbys \"{number_sync_standbys}\", \
                 expected a non-negative integer"
            )));
        }

        let _formation_lock = self.locks.formation_exclusive(formation_id).await;

        if self.catalog.formation(formation_id).is_some() {
            return Err(StewardError::InvalidState(format!(
                "formation \"{formation_id}\" already exists"
            )));
        }

        let formation = Formation {
            formation_id: formation_id.to_string(),
            kind,
            dbname: dbname.to_string(),
            opt_secondary,
            number_sync_standbys,
        };

        self.catalog.add_formation(formation.clone());

        self.notifier.log_and_notify(&format!(
            "Created formation \"{formation_id}\" of kind {kind} with dbname \"{dbname}\""
        ));

        Ok(formation)
    }

    /// Drops a formation. Only legal once no nodes reference it.
    pub async fn drop_formation(&self, formation_id: &str) -> Result<(), StewardError> {
        let _formation_lock = self.locks.formation_exclusive(formation_id).await;

        if self.catalog.formation(formation_id).is_none() {
            return Err(StewardError::FormationNotFound(formation_id.to_string()));
        }

        let nodes = self.catalog.nodes_in_formation(formation_id);

        if !nodes.is_empty() {
            return Err(StewardError::InvalidState(format!(
                "cannot drop formation \"{formation_id}\": {} node(s) are still registered",
                nodes.len()
            )));
        }

        self.catalog.remove_formation(formation_id);
        self.notifier
            .log_and_notify(&format!("Dropped formation \"{formation_id}\""));

        Ok(())
    }

    /// Allows standby nodes to join the formation.
    pub async fn enable_secondary(&self, formation_id: &str) -> Result<(), StewardError> {
        let _formation_lock = self.locks.formation_exclusive(formation_id).await;

        if self.catalog.formation(formation_id).is_none() {
            return Err(StewardError::FormationNotFound(formation_id.to_string()));
        }

        self.catalog.set_formation_opt_secondary(formation_id, true);
        self.notifier
            .log_and_notify(&format!("Enabled secondary nodes for formation \"{formation_id}\""));

        Ok(())
    }

    /// Forbids standby nodes. Only legal while no group has any.
    pub async fn disable_secondary(&self, formation_id: &str) -> Result<(), StewardError> {
        let _formation_lock = self.locks.formation_exclusive(formation_id).await;

        if self.catalog.formation(formation_id).is_none() {
            return Err(StewardError::FormationNotFound(formation_id.to_string()));
        }

        let nodes = self.catalog.nodes_in_formation(formation_id);
        let mut group_ids: Vec<i32> = nodes.iter().map(|n| n.group_id).collect();
        group_ids.sort_unstable();
        group_ids.dedup();

        for group_id in group_ids {
            let group_size = nodes.iter().filter(|n| n.group_id == group_id).count();

            if group_size > 1 {
                return Err(StewardError::InvalidState(format!(
                    "cannot disable secondary nodes in formation \"{formation_id}\": \
                     group {group_id} has {group_size} nodes"
                )));
            }
        }

        self.catalog.set_formation_opt_secondary(formation_id, false);
        self.notifier
            .log_and_notify(&format!("Disabled secondary nodes for formation \"{formation_id}\""));

        Ok(())
    }

    /// Changes the formation's number of required synchronous standbys.
    ///
    /// Zero is always legal (it trades durability for write availability).
    /// Any other value N requires N+1 standbys participating in the
    /// replication quorum, keeping one spare.
    pub async fn set_formation_number_sync_standbys(
        &self,
        formation_id: &str,
        number_sync_standbys: i32,
    ) -> Result<(), StewardError> {
        if number_sync_standbys < 0 {
            return Err(StewardError::InvalidParameter(format!(
                "invalid value for number_sync_standbys \"{number_sync_standbys}\", \
                 expected a non-negative integer"
            )));
        }

        let _formation_lock = self.locks.formation_exclusive(formation_id).await;

        let Some(formation) = self.catalog.formation(formation_id) else {
            return Err(StewardError::FormationNotFound(formation_id.to_string()));
        };

        let nodes = self.catalog.nodes_in_formation(formation_id);

        if nodes.is_empty() && number_sync_standbys > 0 {
            return Err(StewardError::InvalidParameter(format!(
                "at least {} standby nodes are required in formation \"{}\" with \
                 number_sync_standbys = {}, and none are registered",
                number_sync_standbys + 1,
                formation_id,
                number_sync_standbys
            )));
        }

        let mut group_ids: Vec<i32> = nodes.iter().map(|n| n.group_id).collect();
        group_ids.sort_unstable();
        group_ids.dedup();

        for group_id in &group_ids {
            let group_nodes: Vec<Node> = nodes
                .iter()
                .filter(|n| n.group_id == *group_id)
                .cloned()
                .collect();

            let Some(primary) = find_primary_node(&group_nodes) else {
                continue;
            };

            let standbys: Vec<Node> = group_nodes
                .iter()
                .filter(|n| n.node_id != primary.node_id)
                .cloned()
                .collect();

            let (valid, participating) =
                quorum::number_sync_standbys_is_valid(number_sync_standbys, &standbys);

            if !valid {
                return Err(StewardError::InvalidParameter(format!(
                    "at least {} standby nodes are required in formation \"{}\" with \
                     number_sync_standbys = {}, and only {} are participating in the \
                     replication quorum",
                    number_sync_standbys + 1,
                    formation_id,
                    number_sync_standbys,
                    participating
                )));
            }
        }

        self.catalog
            .set_formation_number_sync_standbys(formation_id, number_sync_standbys);

        self.notifier.log_and_notify(&format!(
            "Setting number_sync_standbys to {} for formation \"{}\"",
            number_sync_standbys, formation.formation_id
        ));

        // Each primary has to apply the new replication settings.
        for group_id in &group_ids {
            let group_nodes = self.catalog.nodes_in_group(formation_id, *group_id);

            if let Some(primary) = find_primary_node(&group_nodes) {
                if primary.is_in_primary_state() && !primary.is_current_state(ApplySettings) {
                    let message = format!(
                        "Setting goal state of {} to apply_settings after updating \
                         number_sync_standbys to {} for formation \"{}\".",
                        primary.label(),
                        number_sync_standbys,
                        formation_id
                    );

                    self.notifier.log_and_notify(&message);
                    assign_goal_state(
                        self.catalog.as_ref(),
                        &self.notifier,
                        primary.node_id,
                        ApplySettings,
                        &message,
                    );
                }
            }
        }

        Ok(())
    }

    /// Registers a node into a formation and returns its assignment.
    ///
    /// Fails on formation, kind, or dbname mismatch (the first node of a
    /// formation may adopt kind and dbname), and with a retryable conflict
    /// when another join is already in progress for the target group.
    pub async fn register_node(
        &self,
        request: RegisterRequest,
    ) -> Result<NodeAssignment, StewardError> {
        if !(0..=MAX_USER_CANDIDATE_PRIORITY).contains(&request.candidate_priority) {
            return Err(StewardError::InvalidParameter(format!(
                "invalid value for candidate_priority \"{}\", expected an integer \
                 value between 0 and {}",
                request.candidate_priority, MAX_USER_CANDIDATE_PRIORITY
            )));
        }

        let _formation_lock = self.locks.formation_exclusive(&request.formation_id).await;

        let Some(mut formation) = self.catalog.formation(&request.formation_id) else {
            return Err(StewardError::FormationNotFound(request.formation_id.clone()));
        };

        let Some(expected_kind) = FormationKind::from_node_kind(&request.node_kind) else {
            return Err(StewardError::InvalidParameter(format!(
                "unknown node kind \"{}\"",
                request.node_kind
            )));
        };

        // The default formation might get used to manage any kind of
        // cluster: the first node registered decides.
        if formation.kind != expected_kind {
            if self.catalog.nodes_in_formation(&formation.formation_id).is_empty() {
                self.catalog
                    .set_formation_kind(&formation.formation_id, expected_kind);
                formation.kind = expected_kind;
            } else {
                return Err(StewardError::InvalidState(format!(
                    "node {}:{} of kind \"{}\" can not be registered in formation \
                     \"{}\" of kind {}",
                    request.host,
                    request.port,
                    request.node_kind,
                    formation.formation_id,
                    formation.kind
                )));
            }
        }

        if formation.dbname != request.dbname {
            if self.catalog.nodes_in_formation(&formation.formation_id).is_empty() {
                self.catalog
                    .set_formation_dbname(&formation.formation_id, &request.dbname);
                formation.dbname = request.dbname.clone();
            } else {
                return Err(StewardError::InvalidState(format!(
                    "node {}:{} with dbname \"{}\" can not be registered in formation \
                     \"{}\" which expects dbname \"{}\"",
                    request.host,
                    request.port,
                    request.dbname,
                    formation.formation_id,
                    formation.dbname
                )));
            }
        }

        let (group_id, initial_state) = self.join_formation(&formation, &request)?;

        let node = Node {
            node_id: 0,
            formation_id: formation.formation_id.clone(),
            group_id,
            name: request.name.clone(),
            host: request.host.clone(),
            port: request.port,
            goal_state: initial_state,
            reported_state: request.requested_state,
            pg_is_running: false,
            sync_state: SyncState::Unknown,
            reported_tli: 0,
            reported_lsn: Lsn::INVALID,
            health: NodeHealth::Unknown,
            health_check_time: None,
            report_time: None,
            state_change_time: Instant::now(),
            candidate_priority: request.candidate_priority,
            replication_quorum: request.replication_quorum,
        };

        let node_id = self.catalog.insert_node(node);

        if request.name.is_empty() {
            self.catalog.set_node_name(node_id, &format!("node_{node_id}"));
        }

        let _group_lock = self
            .locks
            .group_exclusive(&formation.formation_id, group_id)
            .await;

        let Some(node) = self.catalog.node_by_id(node_id) else {
            return Err(StewardError::Internal(format!(
                "node {}:{} could not be registered in formation \"{}\"",
                request.host, request.port, formation.formation_id
            )));
        };

        self.notifier.log_and_notify(&format!(
            "Registering {} to formation \"{}\" with replication quorum {} and \
             candidate priority {}",
            node.label(),
            node.formation_id,
            node.replication_quorum,
            node.candidate_priority
        ));

        // number_sync_standbys zero is the default for a single standby.
        // Adding a second sync standby switches the default to one, so that
        // losing a standby at any point still leaves writes possible.
        if node.goal_state == WaitStandby && formation.number_sync_standbys == 0 {
            let group_nodes = self
                .catalog
                .nodes_in_group(&formation.formation_id, group_id);

            if let Some(primary) = find_primary_node(&group_nodes) {
                let standbys: Vec<Node> = group_nodes
                    .iter()
                    .filter(|n| n.node_id != primary.node_id)
                    .cloned()
                    .collect();

                if count_sync_standbys(&standbys) == 2 {
                    self.catalog
                        .set_formation_number_sync_standbys(&formation.formation_id, 1);

                    self.notifier.log_and_notify(&format!(
                        "Setting number_sync_standbys to 1 for formation \"{}\" now \
                         that we have 2/{} standby nodes set with replication-quorum.",
                        formation.formation_id,
                        standbys.len()
                    ));
                }
            }
        }

        // The agent might face an already existing database running as a
        // primary and ask to register as single. Better reject than ask the
        // agent to remove data it holds.
        if request.requested_state != Init && request.requested_state != node.goal_state {
            self.catalog.remove_node(node_id);

            return Err(StewardError::InvalidState(format!(
                "node {}:{} can not be registered in state {}, it should be in state {}",
                request.host, request.port, request.requested_state, node.goal_state
            )));
        }

        let fsm = self.fsm();
        fsm.proceed_group_state(node_id);

        // The primary's side of the join is decided right away rather than
        // on its next report.
        let group_nodes = self
            .catalog
            .nodes_in_group(&formation.formation_id, group_id);

        if let Some(primary) = find_primary_node(&group_nodes) {
            if primary.node_id != node_id {
                fsm.proceed_group_state(primary.node_id);
            }
        }

        let Some(node) = self.catalog.node_by_id(node_id) else {
            return Err(StewardError::Internal(format!(
                "node {node_id} disappeared during registration"
            )));
        };

        Ok(NodeAssignment::from(&node))
    }

    /// Picks the group and initial state for a registering node.
    fn join_formation(
        &self,
        formation: &Formation,
        request: &RegisterRequest,
    ) -> Result<(i32, ReplicationState), StewardError> {
        match formation.kind {
            FormationKind::Standalone => {
                // A standalone formation has a single group, group 0.
                if request.group_id > 0 {
                    return Err(StewardError::InvalidState(format!(
                        "node {}:{} can not be registered in group {} in formation \
                         \"{}\" of kind standalone: there can be only one group, \
                         with group 0",
                        request.host, request.port, request.group_id, formation.formation_id
                    )));
                }

                Ok((0, self.initial_state_for_group(formation, 0)?))
            }
            FormationKind::Sharded => {
                if request.group_id >= 0 {
                    Ok((
                        request.group_id,
                        self.initial_state_for_group(formation, request.group_id)?,
                    ))
                } else if request.node_kind == "coordinator" {
                    // the coordinator always lives in group 0
                    Ok((0, self.initial_state_for_group(formation, 0)?))
                } else {
                    self.assign_group_id(formation)
                }
            }
        }
    }

    /// The register policy: the first node of a group is its primary, any
    /// other node is a standby. Only one join is tracked at a time per
    /// group.
    fn initial_state_for_group(
        &self,
        formation: &Formation,
        group_id: i32,
    ) -> Result<ReplicationState, StewardError> {
        let group_nodes = self
            .catalog
            .nodes_in_group(&formation.formation_id, group_id);

        if group_nodes.is_empty() {
            return Ok(Single);
        }

        if !formation.opt_secondary {
            return Err(StewardError::InvalidState(format!(
                "formation \"{}\" does not allow secondary nodes",
                formation.formation_id
            )));
        }

        // Another standby mid-join would leave the machine with two
        // concurrent joins to track; the caller backs off and retries.
        if group_nodes
            .iter()
            .any(|n| n.reported_state == WaitStandby || n.goal_state == WaitStandby)
        {
            return Err(StewardError::ObjectInUse(format!(
                "another standby is already joining group {} of formation \"{}\", \
                 retry registering in a moment",
                group_id, formation.formation_id
            )));
        }

        if find_primary_node(&group_nodes).is_some() {
            return Ok(WaitStandby);
        }

        // We might be in the middle of a failover, with a candidate already
        // being promoted.
        if find_candidate_being_promoted(&group_nodes).is_some() {
            return Ok(WaitStandby);
        }

        // All that is left might be nodes with candidate priority zero,
        // parked in report_lsn. One of those is a valid upstream for a new
        // node that could then be promoted.
        if group_nodes
            .iter()
            .any(|n| n.candidate_priority == 0 && n.is_current_state(ReportLsn))
        {
            return Ok(ReportLsn);
        }

        Err(StewardError::ObjectInUse(format!(
            "couldn't find the primary node in formation \"{}\", group {}, \
             retry registering in a moment",
            formation.formation_id, group_id
        )))
    }

    /// Builds sharded groups of a primary and a secondary each: workers
    /// fill the first group that is not complete yet, starting at group 1.
    fn assign_group_id(
        &self,
        formation: &Formation,
    ) -> Result<(i32, ReplicationState), StewardError> {
        let mut candidate_group_id = 1;

        loop {
            let group_nodes = self
                .catalog
                .nodes_in_group(&formation.formation_id, candidate_group_id);

            if group_nodes.is_empty() {
                return Ok((candidate_group_id, Single));
            }

            if formation.opt_secondary && group_nodes.len() == 1 {
                return Ok((
                    candidate_group_id,
                    self.initial_state_for_group(formation, candidate_group_id)?,
                ));
            }

            candidate_group_id += 1;
        }
    }

    /// The main entry point of the reporting protocol. Nodes call this
    /// periodically to communicate their observed state and obtain their
    /// assigned goal state.
    pub async fn node_active(
        &self,
        formation_id: &str,
        report: NodeReport,
    ) -> Result<NodeAssignment, StewardError> {
        let Some(node) = self.catalog.node_by_id(report.node_id) else {
            return Err(StewardError::NodeNotFound(format!(
                "couldn't find node with node id {}; the node must register again",
                report.node_id
            )));
        };

        if node.formation_id != formation_id {
            return Err(StewardError::InvalidState(format!(
                "node {} does not belong to formation {}",
                report.node_id, formation_id
            )));
        }

        let _formation_lock = self.locks.formation_shared(formation_id).await;

        // The agent reached a new state: record it as an event before
        // running the machine.
        let state_change_message = if node.reported_state != report.reported_state {
            Some(if node.goal_state == ReportLsn {
                format!(
                    "New state is reported by {} with LSN {}: \"{}\"",
                    node.label(),
                    report.reported_lsn,
                    report.reported_state
                )
            } else {
                format!(
                    "New state is reported by {}: \"{}\"",
                    node.label(),
                    report.reported_state
                )
            })
        } else {
            None
        };

        // The state might not have changed; the report time is refreshed
        // either way.
        self.catalog.record_report(
            report.node_id,
            report.reported_state,
            report.pg_is_running,
            report.sync_state,
            report.reported_tli,
            report.reported_lsn,
        );

        if let Some(message) = state_change_message {
            self.notifier.log_and_notify(&message);
            notify_current_state(self.catalog.as_ref(), &self.notifier, report.node_id, &message);
        }

        let _group_lock = self
            .locks
            .group_exclusive(formation_id, node.group_id)
            .await;

        self.fsm().proceed_group_state(report.node_id);

        match self.catalog.node_by_id(report.node_id) {
            Some(node) => Ok(NodeAssignment::from(&node)),
            None => {
                // The node reported dropped and was removed just now; the
                // agent gets the final assignment one last time.
                let mut assignment = NodeAssignment::from(&node);
                assignment.goal_state = Dropped;
                Ok(assignment)
            }
        }
    }

    /// Removes a node. Idempotent: false when no such node exists.
    ///
    /// Removal is a two-step process: the node is first assigned the
    /// `dropped` goal state, and physically removed once its agent reports
    /// having reached it (or right away with `force`). The remaining peers
    /// re-evaluate their group either way.
    pub async fn remove_node(
        &self,
        host: &str,
        port: u16,
        force: bool,
    ) -> Result<bool, StewardError> {
        let Some(node) = self.catalog.node_by_host_port(host, port) else {
            return Ok(false);
        };

        let _formation_lock = self.locks.formation_exclusive(&node.formation_id).await;

        // the node might have reported dropped while we waited on the lock
        let Some(node) = self.catalog.node_by_host_port(host, port) else {
            return Ok(false);
        };

        let Some(formation) = self.catalog.formation(&node.formation_id) else {
            return Err(StewardError::Internal(format!(
                "formation \"{}\" of {} could not be found",
                node.formation_id,
                node.label()
            )));
        };

        let node_is_primary = node.goal_state.can_take_writes();

        let others: Vec<Node> = self
            .catalog
            .nodes_in_group(&node.formation_id, node.group_id)
            .into_iter()
            .filter(|n| n.node_id != node.node_id)
            .collect();

        if node.is_current_state(Dropped) || force {
            self.catalog.remove_node(node.node_id);

            self.notifier.log_and_notify(&format!(
                "Removing {} from formation \"{}\" and group {}",
                node.label(),
                node.formation_id,
                node.group_id
            ));

            // Removing a primary from a larger group leaves the standbys
            // without an upstream: have them report their positions so a
            // failover can be orchestrated.
            if node_is_primary && others.len() > 1 {
                for other in &others {
                    if other.is_in_maintenance() {
                        continue;
                    }

                    let message = format!(
                        "Setting goal state of {} to report_lsn after primary node removal.",
                        other.label()
                    );

                    self.notifier.log_and_notify(&message);
                    assign_goal_state(
                        self.catalog.as_ref(),
                        &self.notifier,
                        other.node_id,
                        ReportLsn,
                        &message,
                    );
                }
            }

            if let Some(first) = others.first() {
                self.fsm().proceed_group_state(first.node_id);
            }

            return Ok(true);
        }

        // a removal already in progress is politely acknowledged
        if node.goal_state == Dropped {
            return Ok(true);
        }

        if node_is_primary {
            for other in &others {
                // skip nodes that are currently in maintenance
                if other.is_in_maintenance() {
                    continue;
                }

                let message = format!(
                    "Setting goal state of {} to report_lsn after primary node removal.",
                    other.label()
                );

                self.notifier.log_and_notify(&message);
                assign_goal_state(
                    self.catalog.as_ref(),
                    &self.notifier,
                    other.node_id,
                    ReportLsn,
                    &message,
                );
            }
        }

        let message = format!(
            "Setting goal state of {} from formation \"{}\" and group {} to \
             \"dropped\" to implement node removal.",
            node.label(),
            node.formation_id,
            node.group_id
        );

        self.notifier.log_and_notify(&message);
        assign_goal_state(
            self.catalog.as_ref(),
            &self.notifier,
            node.node_id,
            Dropped,
            &message,
        );

        // Keep number_sync_standbys feasible with the remaining standbys;
        // the others list still includes the current primary.
        let remaining_sync_standbys = count_sync_standbys(&others) as i32 - 1;

        if remaining_sync_standbys < formation.number_sync_standbys + 1 {
            let new_number = (remaining_sync_standbys - 1).max(0);

            self.catalog
                .set_formation_number_sync_standbys(&formation.formation_id, new_number);

            self.notifier.log_and_notify(&format!(
                "Setting number_sync_standbys to {} for formation \"{}\" now that \
                 we have {} standby nodes set with replication-quorum.",
                new_number, formation.formation_id, remaining_sync_standbys
            ));
        }

        if node_is_primary {
            // proceed with the failover, starting with the first standby
            if let Some(first) = others.first() {
                self.fsm().proceed_group_state(first.node_id);
            }
        } else {
            let group_nodes = self
                .catalog
                .nodes_in_group(&node.formation_id, node.group_id);

            if let Some(primary) = find_primary_node(&group_nodes) {
                let goal_before = primary.goal_state;
                let primary_id = primary.node_id;

                self.fsm().proceed_group_state(primary_id);

                // Even when removing the standby changes nothing for the
                // primary's state, its replication settings have to be
                // adjusted to the new list of standbys.
                if let Some(primary) = self.catalog.node_by_id(primary_id) {
                    if primary.goal_state == goal_before && goal_before != ApplySettings {
                        let message = format!(
                            "Setting goal state of {} to apply_settings after \
                             removing standby {} from formation {}.",
                            primary.label(),
                            node.label(),
                            formation.formation_id
                        );

                        self.notifier.log_and_notify(&message);
                        assign_goal_state(
                            self.catalog.as_ref(),
                            &self.notifier,
                            primary_id,
                            ApplySettings,
                            &message,
                        );
                    }
                }
            }
        }

        Ok(true)
    }

    /// Manually triggers a failover. Requires exactly two nodes in the
    /// group, a primary that converged to `primary` and a standby that
    /// converged to `secondary`; a stable pair must be observed before the
    /// roles can be swapped on purpose.
    pub async fn perform_failover(
        &self,
        formation_id: &str,
        group_id: i32,
    ) -> Result<(), StewardError> {
        let _formation_lock = self.locks.formation_shared(formation_id).await;
        let _group_lock = self.locks.group_exclusive(formation_id, group_id).await;

        let group_nodes = self.catalog.nodes_in_group(formation_id, group_id);

        if group_nodes.len() != 2 {
            return Err(StewardError::InvalidState(format!(
                "cannot fail over: group {} in formation {} currently has {} \
                 node(s) registered, and a manual failover requires exactly 2",
                group_id,
                formation_id,
                group_nodes.len()
            )));
        }

        let Some(primary) = find_node_to_failover_from(&group_nodes) else {
            return Err(StewardError::InvalidState(format!(
                "couldn't find the primary node in formation \"{formation_id}\", \
                 group {group_id}"
            )));
        };

        let Some(secondary) = group_nodes.iter().find(|n| n.node_id != primary.node_id) else {
            return Err(StewardError::InvalidState(format!(
                "couldn't find the standby node in formation \"{}\", group {} \
                 with primary {}",
                formation_id,
                group_id,
                primary.label()
            )));
        };

        if secondary.goal_state != Secondary {
            return Err(StewardError::InvalidState(format!(
                "standby {} is in state \"{}\", which prevents the node from \
                 being a failover candidate",
                secondary.label(),
                secondary.goal_state
            )));
        }

        // The transition to primary waits until the observed write position
        // made it to the secondary, a needed guarantee against data loss:
        // both nodes must have fully converged before swapping on purpose.
        if !primary.is_current_state(Primary) || !secondary.is_current_state(Secondary) {
            return Err(StewardError::InvalidState(format!(
                "cannot fail over: primary node is not in a stable state: {} has \
                 reported state \"{}\" and is assigned state \"{}\", and {} has \
                 reported state \"{}\" and is assigned state \"{}\"",
                primary.label(),
                primary.reported_state,
                primary.goal_state,
                secondary.label(),
                secondary.reported_state,
                secondary.goal_state
            )));
        }

        let message = format!(
            "Setting goal state of {} to draining and {} to prepare_promotion \
             after a user-initiated failover.",
            primary.label(),
            secondary.label()
        );

        self.notifier.log_and_notify(&message);

        assign_goal_state(
            self.catalog.as_ref(),
            &self.notifier,
            primary.node_id,
            Draining,
            &message,
        );
        assign_goal_state(
            self.catalog.as_ref(),
            &self.notifier,
            secondary.node_id,
            PreparePromotion,
            &message,
        );

        Ok(())
    }

    /// Promotes a specific node of a two-node group. Returns false when
    /// the node already is a primary.
    pub async fn perform_promotion(
        &self,
        formation_id: &str,
        node_name: &str,
    ) -> Result<bool, StewardError> {
        let Some(node) = self.catalog.node_by_name(formation_id, node_name) else {
            return Err(StewardError::NodeNotFound(format!(
                "node \"{node_name}\" is not registered in formation \"{formation_id}\""
            )));
        };

        let group_id = node.group_id;

        {
            let _formation_lock = self.locks.formation_shared(formation_id).await;
            let _group_lock = self.locks.group_exclusive(formation_id, group_id).await;

            let Some(node) = self.catalog.node_by_id(node.node_id) else {
                return Err(StewardError::NodeNotFound(format!(
                    "node \"{node_name}\" is not registered in formation \"{formation_id}\""
                )));
            };

            if node.is_current_state(Single) || node.is_current_state(Primary) {
                self.notifier.log_and_notify(&format!(
                    "cannot perform promotion: node {} in formation {} is already \
                     a primary.",
                    node_name, formation_id
                ));

                return Ok(false);
            }

            if !node.is_current_state(Secondary) {
                return Err(StewardError::InvalidState(format!(
                    "cannot perform promotion: node {} in formation {} has reported \
                     state \"{}\" and is assigned state \"{}\", promotion can only \
                     be performed when in state \"secondary\"",
                    node_name, formation_id, node.reported_state, node.goal_state
                )));
            }

            let group_nodes = self.catalog.nodes_in_group(formation_id, group_id);

            if group_nodes.len() > 2 {
                return Err(StewardError::InvalidState(format!(
                    "cannot perform promotion: group {} in formation {} has {} \
                     nodes, and a directed promotion requires exactly 2",
                    group_id,
                    formation_id,
                    group_nodes.len()
                )));
            }
        }

        self.perform_failover(formation_id, group_id).await?;

        Ok(true)
    }

    /// Puts a standby into maintenance. Only legal on a node in a stable
    /// secondary-like state whose primary converged to `primary`, and only
    /// when enough quorum standbys remain for writes to keep flowing.
    pub async fn start_maintenance(
        &self,
        formation_id: &str,
        node_name: &str,
    ) -> Result<bool, StewardError> {
        let Some(node) = self.catalog.node_by_name(formation_id, node_name) else {
            return Ok(false);
        };

        let _formation_lock = self.locks.formation_shared(formation_id).await;
        let _group_lock = self
            .locks
            .group_exclusive(formation_id, node.group_id)
            .await;

        let Some(node) = self.catalog.node_by_id(node.node_id) else {
            return Ok(false);
        };

        let Some(formation) = self.catalog.formation(formation_id) else {
            return Err(StewardError::FormationNotFound(formation_id.to_string()));
        };

        // already in maintenance is fine
        if node.reported_state == Maintenance || node.goal_state == Maintenance {
            return Ok(true);
        }

        let secondary_like = matches!(node.reported_state, Secondary | Catchingup);

        if !secondary_like {
            return Err(StewardError::InvalidState(format!(
                "cannot start maintenance: {} has reported state \"{}\" and is \
                 assigned state \"{}\", expected either \"secondary\" or \"catchingup\"",
                node.label(),
                node.reported_state,
                node.goal_state
            )));
        }

        let group_nodes = self.catalog.nodes_in_group(formation_id, node.group_id);

        let Some(primary) = find_primary_node(&group_nodes) else {
            return Err(StewardError::InvalidState(format!(
                "couldn't find the primary node in formation \"{}\", group {}",
                formation_id, node.group_id
            )));
        };

        // Going to maintenance must not block writes: we keep at least
        // number_sync_standbys nodes in the secondary state.
        let secondary_count = group_nodes
            .iter()
            .filter(|n| n.node_id != primary.node_id && n.is_current_state(Secondary))
            .count() as i32;

        if formation.number_sync_standbys > 0
            && secondary_count <= formation.number_sync_standbys
        {
            return Err(StewardError::InvalidState(format!(
                "cannot start maintenance: we currently have {} node(s) in the \
                 \"secondary\" state and require at least {} sync standbys in \
                 formation \"{}\"",
                secondary_count, formation.number_sync_standbys, formation_id
            )));
        }

        // Also keep at least one failover candidate around.
        if node.candidate_priority > 0 {
            let candidate_count = group_nodes
                .iter()
                .filter(|n| {
                    n.node_id != node.node_id
                        && n.node_id != primary.node_id
                        && n.candidate_priority > 0
                        && n.is_current_state(Secondary)
                })
                .count();

            if formation.number_sync_standbys > 0 && candidate_count < 1 {
                return Err(StewardError::InvalidState(format!(
                    "cannot start maintenance: we would then have {candidate_count} \
                     node(s) that would be candidate for promotion"
                )));
            }
        }

        if !primary.is_current_state(Primary) {
            return Err(StewardError::InvalidState(format!(
                "cannot start maintenance: current state for {} is \"{}\", and \
                 current state for primary {} is \"{}\" \u{279c} \"{}\"",
                node.label(),
                node.reported_state,
                primary.label(),
                primary.reported_state,
                primary.goal_state
            )));
        }

        // Putting the last standby to maintenance means disabling
        // synchronous replication on the primary. No standby state changed
        // yet, so the last one shows as a count of one.
        let primary_goal_state = if secondary_count == 1 {
            WaitPrimary
        } else {
            JoinPrimary
        };

        let message = format!(
            "Setting goal state of {} to {} and {} to wait_maintenance after a \
             user-initiated start_maintenance call.",
            primary.label(),
            primary_goal_state,
            node.label()
        );

        self.notifier.log_and_notify(&message);

        assign_goal_state(
            self.catalog.as_ref(),
            &self.notifier,
            primary.node_id,
            primary_goal_state,
            &message,
        );
        assign_goal_state(
            self.catalog.as_ref(),
            &self.notifier,
            node.node_id,
            WaitMaintenance,
            &message,
        );

        Ok(true)
    }

    /// Brings a node back from maintenance, through catching up.
    pub async fn stop_maintenance(
        &self,
        formation_id: &str,
        node_name: &str,
    ) -> Result<bool, StewardError> {
        let Some(node) = self.catalog.node_by_name(formation_id, node_name) else {
            return Ok(false);
        };

        let _formation_lock = self.locks.formation_shared(formation_id).await;
        let _group_lock = self
            .locks
            .group_exclusive(formation_id, node.group_id)
            .await;

        let Some(node) = self.catalog.node_by_id(node.node_id) else {
            return Ok(false);
        };

        if !node.is_current_state(Maintenance) {
            return Err(StewardError::InvalidState(format!(
                "cannot stop maintenance when current state for {} is not \
                 \"maintenance\": reported state is \"{}\" and assigned state \
                 is \"{}\"",
                node.label(),
                node.reported_state,
                node.goal_state
            )));
        }

        // The primary is needed even mid-failover, when it is already set
        // to draining: rejoining and reporting our position helps the group
        // reach a consistent state again.
        let group_nodes = self.catalog.nodes_in_group(formation_id, node.group_id);

        if find_primary_or_demoted_node(&group_nodes).is_none() {
            return Err(StewardError::InvalidState(format!(
                "couldn't find the primary node in formation \"{}\", group {}",
                formation_id, node.group_id
            )));
        }

        let message = format!(
            "Setting goal state of {} to catchingup after a user-initiated \
             stop_maintenance call.",
            node.label()
        );

        self.notifier.log_and_notify(&message);
        assign_goal_state(
            self.catalog.as_ref(),
            &self.notifier,
            node.node_id,
            Catchingup,
            &message,
        );

        Ok(true)
    }

    /// Changes a node's candidate priority, and has the primary apply the
    /// new replication settings.
    pub async fn set_candidate_priority(
        &self,
        formation_id: &str,
        node_name: &str,
        candidate_priority: i32,
    ) -> Result<bool, StewardError> {
        let Some(node) = self.catalog.node_by_name(formation_id, node_name) else {
            return Err(StewardError::NodeNotFound(format!(
                "node \"{node_name}\" is not registered in formation \"{formation_id}\""
            )));
        };

        let _formation_lock = self.locks.formation_shared(formation_id).await;
        let _group_lock = self
            .locks
            .group_exclusive(formation_id, node.group_id)
            .await;

        if !(0..=MAX_USER_CANDIDATE_PRIORITY).contains(&candidate_priority) {
            return Err(StewardError::InvalidParameter(format!(
                "invalid value for candidate_priority \"{candidate_priority}\" \
                 expected an integer value between 0 and {MAX_USER_CANDIDATE_PRIORITY}"
            )));
        }

        let group_nodes = self.catalog.nodes_in_group(formation_id, node.group_id);
        let nodes_count = group_nodes.len();

        let primary = find_primary_node(&group_nodes).cloned();

        // Accepting setting changes while the primary is still applying a
        // previous one opens a race where we can't tell which change took
        // effect; reject those.
        if nodes_count > 1 {
            if let Some(primary) = &primary {
                if primary.is_current_state(ApplySettings) {
                    return Err(StewardError::InvalidState(format!(
                        "cannot set candidate priority when current state for \
                         primary {} is \"{}\"",
                        primary.label(),
                        primary.reported_state
                    )));
                }
            }
        }

        // Setting the last priorities to zero prevents automated failover;
        // allowed, but worth a loud warning. The count includes the
        // current primary.
        if candidate_priority == 0 && node.candidate_priority != 0 {
            let non_zero_count = group_nodes
                .iter()
                .filter(|n| n.candidate_priority > 0)
                .count()
                .saturating_sub(1);

            if non_zero_count < 2 {
                self.notifier.log_and_notify(&format!(
                    "setting candidate priority to zero, preventing automated \
                     failover: group {} in formation \"{}\" would have no \
                     failover candidate",
                    node.group_id, formation_id
                ));
            }
        }

        self.catalog.set_replication_settings(
            node.node_id,
            candidate_priority,
            node.replication_quorum,
        );

        if nodes_count == 1 {
            let message = format!(
                "Updating candidate priority to {} for {}",
                candidate_priority,
                node.label()
            );

            self.notifier.log_and_notify(&message);
            notify_current_state(self.catalog.as_ref(), &self.notifier, node.node_id, &message);
        } else if let Some(primary) = &primary {
            let message = format!(
                "Setting goal state of {} to apply_settings after updating {} \
                 candidate priority to {}.",
                primary.label(),
                node.label(),
                candidate_priority
            );

            self.notifier.log_and_notify(&message);
            assign_goal_state(
                self.catalog.as_ref(),
                &self.notifier,
                primary.node_id,
                ApplySettings,
                &message,
            );
        }

        Ok(true)
    }

    /// Changes whether a node participates in the synchronous replication
    /// quorum. Opting out is validated against the formation's
    /// number_sync_standbys first.
    pub async fn set_replication_quorum(
        &self,
        formation_id: &str,
        node_name: &str,
        replication_quorum: bool,
    ) -> Result<bool, StewardError> {
        let Some(node) = self.catalog.node_by_name(formation_id, node_name) else {
            return Err(StewardError::NodeNotFound(format!(
                "node \"{node_name}\" is not registered in formation \"{formation_id}\""
            )));
        };

        let _formation_lock = self.locks.formation_shared(formation_id).await;
        let _group_lock = self
            .locks
            .group_exclusive(formation_id, node.group_id)
            .await;

        let Some(formation) = self.catalog.formation(formation_id) else {
            return Err(StewardError::FormationNotFound(formation_id.to_string()));
        };

        let group_nodes = self.catalog.nodes_in_group(formation_id, node.group_id);
        let nodes_count = group_nodes.len();

        let primary = find_primary_node(&group_nodes).cloned();

        if nodes_count > 1 {
            if let Some(primary) = &primary {
                if primary.is_current_state(ApplySettings) {
                    return Err(StewardError::InvalidState(format!(
                        "cannot set replication quorum when current state for \
                         primary {} is \"{}\"",
                        primary.label(),
                        primary.reported_state
                    )));
                }
            }
        }

        // It's not always possible to opt out from the quorum.
        if !replication_quorum && nodes_count > 1 {
            let Some(primary) = &primary else {
                return Err(StewardError::InvalidState(format!(
                    "couldn't find the primary node in formation \"{}\", group {}",
                    formation_id, node.group_id
                )));
            };

            let standbys: Vec<Node> = group_nodes
                .iter()
                .filter(|n| n.node_id != primary.node_id && n.node_id != node.node_id)
                .cloned()
                .collect();

            let (valid, participating) =
                quorum::number_sync_standbys_is_valid(formation.number_sync_standbys, &standbys);

            if !valid {
                return Err(StewardError::InvalidParameter(format!(
                    "can't set replication quorum to false: at least {} standby \
                     nodes are required in formation {} with number_sync_standbys \
                     = {}, and only {} would be participating in the replication \
                     quorum",
                    formation.number_sync_standbys + 1,
                    formation_id,
                    formation.number_sync_standbys,
                    participating
                )));
            }
        }

        self.catalog.set_replication_settings(
            node.node_id,
            node.candidate_priority,
            replication_quorum,
        );

        if nodes_count == 1 {
            let message = format!(
                "Updating replication quorum to {} for {}",
                replication_quorum,
                node.label()
            );

            self.notifier.log_and_notify(&message);
            notify_current_state(self.catalog.as_ref(), &self.notifier, node.node_id, &message);
        } else if let Some(primary) = &primary {
            let message = format!(
                "Setting goal state of {} to apply_settings after updating {} \
                 replication quorum to {}.",
                primary.label(),
                node.label(),
                replication_quorum
            );

            self.notifier.log_and_notify(&message);
            assign_goal_state(
                self.catalog.as_ref(),
                &self.notifier,
                primary.node_id,
                ApplySettings,
                &message,
            );
        }

        Ok(true)
    }

    /// Computes the synchronous standby expression the group's primary
    /// should be configured with. Read-only.
    pub async fn synchronous_standby_names(
        &self,
        formation_id: &str,
        group_id: i32,
    ) -> Result<String, StewardError> {
        let _formation_lock = self.locks.formation_shared(formation_id).await;

        let Some(formation) = self.catalog.formation(formation_id) else {
            return Err(StewardError::FormationNotFound(formation_id.to_string()));
        };

        let group_nodes = self.catalog.nodes_in_group(formation_id, group_id);

        if group_nodes.is_empty() {
            return Err(StewardError::InvalidState(format!(
                "no nodes found in group {group_id} of formation \"{formation_id}\""
            )));
        }

        quorum::synchronous_standby_names(&formation, &group_nodes)
    }

    /// Returns the writable node of a group.
    pub async fn get_primary(
        &self,
        formation_id: &str,
        group_id: i32,
    ) -> Result<Node, StewardError> {
        let _formation_lock = self.locks.formation_shared(formation_id).await;

        let group_nodes = self.catalog.nodes_in_group(formation_id, group_id);

        find_primary_node(&group_nodes).cloned().ok_or_else(|| {
            StewardError::NodeNotFound(format!(
                "couldn't find the primary node in formation \"{formation_id}\", \
                 group {group_id}"
            ))
        })
    }

    /// Returns the nodes of a group.
    pub fn get_nodes(&self, formation_id: &str, group_id: i32) -> Vec<Node> {
        self.catalog.nodes_in_group(formation_id, group_id)
    }

    /// Returns a node by name.
    pub fn get_node(&self, formation_id: &str, node_name: &str) -> Option<Node> {
        self.catalog.node_by_name(formation_id, node_name)
    }

    /// Returns the formation, if it exists.
    pub fn get_formation(&self, formation_id: &str) -> Option<Formation> {
        self.catalog.formation(formation_id)
    }

    /// Returns the most recent events of a formation, newest first.
    pub fn last_events(&self, formation_id: &str, count: usize) -> Vec<Event> {
        self.catalog.last_events(formation_id, count)
    }
}
