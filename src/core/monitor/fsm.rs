// src/core/monitor/fsm.rs

//! The group state machine: given a node's report and its peers' stored
//! states plus health, computes the next goal state for one or more nodes
//! of the group.
//!
//! Evaluation is first-match: rules are checked in a fixed priority order
//! and the evaluation returns after the rule that wrote a goal state, so
//! the machine converges one step per report instead of computing
//! multi-step plans. Repeated evaluation with unchanged inputs is a no-op,
//! the overwhelmingly common case. Evaluation itself never fails: all
//! validation happens in the operation layer before the machine runs.

use super::catalog::Catalog;
use super::notifications::{Event, Notifier, StateNotification};
use super::state::{
    CANDIDATE_PRIORITY_INCREMENT, FormationKind, Lsn, MAX_USER_CANDIDATE_PRIORITY, Node,
    ReplicationState, find_candidate_being_promoted, find_primary_or_demoted_node,
    group_list_candidates, is_failover_in_progress, list_most_advanced_standby_nodes,
    wal_difference_within,
};
use crate::config::TimingConfig;
use std::time::Instant;
use tracing::{debug, warn};

use ReplicationState::*;

/// Bookkeeping shared by the candidate-selection steps of a multi-standby
/// failover.
#[derive(Debug, Default)]
struct CandidateList {
    number_sync_standbys: i32,
    /// Healthy standbys that reached `report_lsn`.
    candidates: Vec<Node>,
    /// Candidates that also participate in the replication quorum.
    quorum_candidate_count: usize,
    /// Nodes that are due to report their position but have not yet. Any
    /// missing node postpones the election.
    missing_nodes_count: usize,
}

/// One evaluation context of the group state machine.
pub struct GroupStateMachine<'a> {
    pub catalog: &'a dyn Catalog,
    pub notifier: &'a Notifier,
    pub timing: &'a TimingConfig,
    pub started_at: Instant,
}

impl<'a> GroupStateMachine<'a> {
    /// Proceeds the state machine of the group the given node is part of.
    /// Returns true when a goal state was written.
    pub fn proceed_group_state(&self, node_id: i64) -> bool {
        let Some(active) = self.catalog.node_by_id(node_id) else {
            return false;
        };

        let Some(formation) = self.catalog.formation(&active.formation_id) else {
            warn!(
                "Formation \"{}\" of {} could not be found",
                active.formation_id,
                active.label()
            );
            return false;
        };

        let nodes = self
            .catalog
            .nodes_in_group(&active.formation_id, active.group_id);
        let nodes_count = nodes.len();

        // A node that reached the dropped state is now actually removed.
        if active.is_current_state(Dropped) {
            self.catalog.remove_node(active.node_id);

            self.notifier.log_and_notify(&format!(
                "Removing {} from formation \"{}\" and group {}",
                active.label(),
                active.formation_id,
                active.group_id
            ));

            return true;
        }

        if active.goal_state == Dropped {
            return true;
        }

        // A node that is alone in its group should be single, unless its
        // candidate priority forbids writes, in which case it holds at
        // report_lsn until settings change or another node joins.
        if nodes_count == 1 && !active.is_current_state(Single) && active.candidate_priority > 0 {
            let message = format!(
                "Setting goal state of {} to single as there is no other node.",
                active.label()
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, Single, &message);

            return true;
        } else if nodes_count == 1
            && !active.is_current_state(Single)
            && !active.is_current_state(ReportLsn)
            && active.candidate_priority == 0
        {
            let message = format!(
                "Setting goal state of {} to report_lsn as there is no other node \
                 and candidate priority is {}.",
                active.label(),
                active.candidate_priority
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, ReportLsn, &message);

            return true;
        }

        // The primary has to loop over every other node to take decisions,
        // which is best managed in a specialized function.
        if active.is_in_primary_state() {
            return self.proceed_for_primary_node(&active);
        }

        let mut primary = find_primary_or_demoted_node(&nodes).cloned();

        // The primary might have been removed by hand in the middle of a
        // failover; otherwise a group without an identified primary is not
        // actionable.
        if primary.is_none() && !is_failover_in_progress(&nodes) {
            warn!(
                "Couldn't find the primary node in formation \"{}\", group {} \
                 while proceeding from {} in state {}",
                active.formation_id,
                active.group_id,
                active.label(),
                active.goal_state
            );
            return false;
        }

        // Multiple-standby failover is handled in its own function.
        if nodes_count > 2 && self.unhealthy_opt(primary.as_ref()) {
            if let Some(p) = &primary {
                // wait_primary encodes that there is no failover candidate,
                // so there is no point in orchestrating a failover then.
                if p.is_in_primary_state() && !p.is_current_state(WaitPrimary) {
                    let message = format!(
                        "Setting goal state of {} to draining after it became unhealthy.",
                        p.label()
                    );

                    self.notifier.log_and_notify(&message);
                    self.assign(p.node_id, Draining, &message);
                }
            }

            if self.proceed_for_ms_failover(&active, primary.as_ref()) {
                return true;
            }

            // The draining assignment above may have changed the group.
            let nodes = self
                .catalog
                .nodes_in_group(&active.formation_id, active.group_id);
            primary = find_primary_or_demoted_node(&nodes).cloned();
        }

        // report_lsn -> secondary, when the promotion already happened and
        // the new primary is reachable.
        if active.is_current_state(ReportLsn)
            && let Some(p) = primary.as_ref()
            && (p.is_current_state(WaitPrimary) || p.is_current_state(JoinPrimary))
            && p.is_healthy()
        {
            let message = format!(
                "Setting goal state of {} to secondary after {} converged to {} \
                 and has been marked healthy.",
                active.label(),
                p.label(),
                p.reported_state
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, Secondary, &message);

            return true;
        }

        if active.is_current_state(ReportLsn)
            && let Some(p) = primary.as_ref()
            && p.is_current_state(Primary)
            && p.is_healthy()
        {
            let message = format!(
                "Setting goal state of {} to secondary after {} got selected \
                 as the failover candidate.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, Secondary, &message);

            return true;
        }

        // The candidate is done fast forwarding the missing WAL, promote it.
        if active.is_current_state(FastForward) {
            let message = format!(
                "Setting goal state of {} to prepare_promotion",
                active.label()
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, PreparePromotion, &message);

            return true;
        }

        // Other cases where an already started failover must be continued.
        if active.is_current_state(ReportLsn) || active.is_current_state(FastForward) {
            return self.proceed_for_ms_failover(&active, primary.as_ref());
        }

        // The primary is ready for replication: wait_standby -> catchingup.
        if active.is_current_state(WaitStandby)
            && let Some(p) = primary.as_ref()
            && (p.is_current_state(WaitPrimary) || p.is_current_state(JoinPrimary))
        {
            let message = format!(
                "Setting goal state of {} to catchingup after {} converged to {}.",
                active.label(),
                p.label(),
                p.reported_state
            );

            self.notifier.log_and_notify(&message);

            // start replication
            self.assign(active.node_id, Catchingup, &message);

            return true;
        }

        // The standby caught up close enough: catchingup -> secondary. The
        // primary-side loop then takes care of wait_primary -> primary.
        if active.is_current_state(Catchingup)
            && let Some(p) = primary.as_ref()
            && (p.is_current_state(WaitPrimary)
                || p.is_current_state(JoinPrimary)
                || p.is_current_state(Primary))
            && active.is_healthy()
            && p.reported_tli == active.reported_tli
            && wal_difference_within(
                Some(&active),
                Some(p),
                self.timing.enable_sync_wal_threshold,
            )
        {
            let message = format!(
                "Setting goal state of {} to secondary after it caught up.",
                active.label()
            );

            self.notifier.log_and_notify(&message);

            // node is ready for promotion
            self.assign(active.node_id, Secondary, &message);

            return true;
        }

        // The primary fails: secondary -> prepare_promotion, primary ->
        // draining. Promotion safety: refuse when the standby position lags
        // more than the configured threshold.
        if active.is_current_state(Secondary)
            && let Some(p) = primary.as_ref()
            && p.is_in_primary_state()
            && self.unhealthy(p)
            && active.is_healthy()
            && active.candidate_priority > 0
            && wal_difference_within(Some(&active), Some(p), self.timing.promote_wal_threshold)
        {
            let message = format!(
                "Setting goal state of {} to draining and {} to prepare_promotion \
                 after {} became unhealthy.",
                p.label(),
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);

            // keep reading until no more records are available
            self.assign(active.node_id, PreparePromotion, &message);

            // shut down the primary
            self.assign(p.node_id, Draining, &message);

            return true;
        }

        // A secondary goes to maintenance and no standby is left.
        if active.is_current_state(WaitMaintenance)
            && let Some(p) = primary.as_ref()
            && p.is_current_state(WaitPrimary)
        {
            let message = format!(
                "Setting goal state of {} to maintenance after {} converged to wait_primary.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, Maintenance, &message);

            return true;
        }

        // A secondary goes to maintenance while other standbys remain.
        if active.is_current_state(WaitMaintenance)
            && let Some(p) = primary.as_ref()
            && p.reported_state == JoinPrimary
            && (p.goal_state == JoinPrimary || p.goal_state == Primary)
        {
            let message = format!(
                "Setting goal state of {} to maintenance after {} converged to join_primary.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, Maintenance, &message);

            // set the primary back to its normal state (we can failover still)
            self.assign(p.node_id, Primary, &message);

            return true;
        }

        // The primary is being put to maintenance.
        if active.is_current_state(PreparePromotion)
            && let Some(p) = primary.as_ref()
            && p.is_current_state(PrepareMaintenance)
        {
            let message = format!(
                "Setting goal state of {} to stop_replication after {} \
                 converged to prepare_maintenance.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);

            // promote the secondary
            self.assign(active.node_id, StopReplication, &message);

            return true;
        }

        // In a sharded formation the promotion only resumes writes once the
        // coordinator knows about the new worker primary.
        if active.is_current_state(PreparePromotion)
            && formation.kind == FormationKind::Sharded
            && active.group_id > 0
        {
            if let Some(p) = primary.as_ref() {
                let message = format!(
                    "Setting goal state of {} to wait_primary and {} to demoted \
                     after the coordinator metadata was updated.",
                    active.label(),
                    p.label()
                );

                self.notifier.log_and_notify(&message);

                // node is now taking writes
                self.assign(active.node_id, WaitPrimary, &message);

                // done draining, node is presumed dead
                self.assign(p.node_id, Demoted, &message);
            } else {
                let message = format!(
                    "Setting goal state of {} to wait_primary after the \
                     coordinator metadata was updated.",
                    active.label()
                );

                self.notifier.log_and_notify(&message);
                self.assign(active.node_id, WaitPrimary, &message);
            }

            return true;
        }

        // The candidate sees no more writes coming: prepare_promotion ->
        // stop_replication, and the possibly-alive primary gets a bounded
        // grace window to notice it should stop itself.
        if active.is_current_state(PreparePromotion) {
            if let Some(p) = primary.as_ref() {
                if !p.is_in_maintenance() {
                    let message = format!(
                        "Setting goal state of {} to demote_timeout and {} to \
                         stop_replication after {} converged to prepare_promotion.",
                        p.label(),
                        active.label(),
                        active.label()
                    );

                    self.notifier.log_and_notify(&message);

                    // perform promotion to stop replication
                    self.assign(active.node_id, StopReplication, &message);

                    // wait for possibly-alive primary to kill itself
                    self.assign(p.node_id, DemoteTimeout, &message);

                    return true;
                }
            } else {
                // the primary node has been removed already
                let message = format!(
                    "Setting goal state of {} to wait_primary after it \
                     converged to prepare_promotion.",
                    active.label()
                );

                self.notifier.log_and_notify(&message);
                self.assign(active.node_id, WaitPrimary, &message);

                return true;
            }
        }

        // The old primary is going to maintenance.
        if active.is_current_state(StopReplication)
            && let Some(p) = primary.as_ref()
            && p.is_current_state(PrepareMaintenance)
        {
            let message = format!(
                "Setting goal state of {} to wait_primary and {} to maintenance.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);

            // node is now taking writes
            self.assign(active.node_id, WaitPrimary, &message);

            // old primary node is now ready for maintenance operations
            self.assign(p.node_id, Maintenance, &message);

            return true;
        }

        // The drain time expired or the old primary acknowledged the
        // demotion: stop_replication -> wait_primary, primary -> demoted.
        if active.is_current_state(StopReplication)
            && let Some(p) = primary.as_ref()
            && (p.is_current_state(DemoteTimeout) || p.drain_time_expired(self.timing))
        {
            let message = format!(
                "Setting goal state of {} to wait_primary and {} to demoted \
                 after the demote timeout expired.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);

            // node is now taking writes
            self.assign(active.node_id, WaitPrimary, &message);

            // done draining, node is presumed dead
            self.assign(p.node_id, Demoted, &message);

            return true;
        }

        // Sharded worker that blocked writes behind the coordinator.
        if active.is_current_state(StopReplication)
            && formation.kind == FormationKind::Sharded
            && active.group_id > 0
        {
            if let Some(p) = primary.as_ref() {
                let message = format!(
                    "Setting goal state of {} to wait_primary and {} to demoted \
                     after the coordinator metadata was updated.",
                    active.label(),
                    p.label()
                );

                self.notifier.log_and_notify(&message);
                self.assign(active.node_id, WaitPrimary, &message);
                self.assign(p.node_id, Demoted, &message);
            } else {
                let message = format!(
                    "Setting goal state of {} to wait_primary after the \
                     coordinator metadata was updated.",
                    active.label()
                );

                self.notifier.log_and_notify(&message);
                self.assign(active.node_id, WaitPrimary, &message);
            }

            return true;
        }

        // A new primary is ready: demoted -> catchingup. We accept to move
        // as soon as the primary reported wait_primary or join_primary,
        // even when it is already transitioning to primary thanks to
        // another standby making progress concurrently.
        if active.is_current_state(Demoted)
            && let Some(p) = primary.as_ref()
            && p.is_healthy()
            && (p.reported_state == WaitPrimary || p.reported_state == JoinPrimary)
            && p.goal_state == Primary
        {
            let message = format!(
                "Setting goal state of {} to catchingup after it converged to \
                 demotion and {} converged to primary.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);

            // it's safe to rejoin as a secondary
            self.assign(active.node_id, Catchingup, &message);

            return true;
        }

        if active.is_current_state(Demoted)
            && let Some(p) = primary.as_ref()
            && p.is_healthy()
            && (p.is_current_state(JoinPrimary)
                || p.is_current_state(WaitPrimary)
                || p.is_current_state(Primary))
        {
            let message = format!(
                "Setting goal state of {} to catchingup after it converged to \
                 demotion and {} converged to {}.",
                active.label(),
                p.label(),
                p.reported_state
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, Catchingup, &message);

            return true;
        }

        // A new primary is ready: join_secondary -> secondary. There is no
        // action to implement on the selected primary for this step, so we
        // make progress as soon as we want to.
        if active.is_current_state(JoinSecondary)
            && let Some(p) = primary.as_ref()
            && p.reported_state == WaitPrimary
            && (p.goal_state == WaitPrimary || p.goal_state == Primary)
        {
            let p = p.clone();
            let message = format!(
                "Setting goal state of {} to secondary after {} converged to wait_primary.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);

            // it's safe to rejoin as a secondary
            self.assign(active.node_id, Secondary, &message);

            // compute next step for the primary depending on node settings
            return self.proceed_for_primary_node(&p);
        }

        // The re-joining secondary arrived after the new primary already
        // made progress to primary.
        if active.is_current_state(JoinSecondary)
            && let Some(p) = primary.as_ref()
            && p.is_current_state(Primary)
        {
            let message = format!(
                "Setting goal state of {} to secondary after {} converged to primary.",
                active.label(),
                p.label()
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, Secondary, &message);

            return true;
        }

        false
    }

    /// Group state machine when the reporting node is the primary of its
    /// group, which needs to loop over every other node to take decisions.
    fn proceed_for_primary_node(&self, primary: &Node) -> bool {
        let Some(formation) = self.catalog.formation(&primary.formation_id) else {
            return false;
        };

        let others: Vec<Node> = self
            .catalog
            .nodes_in_group(&primary.formation_id, primary.group_id)
            .into_iter()
            .filter(|n| n.node_id != primary.node_id)
            .collect();
        let others_count = others.len();

        // A first node wants to become standby: single -> wait_primary.
        if primary.is_current_state(Single) {
            for other in &others {
                if other.is_current_state(WaitStandby) {
                    let message = format!(
                        "Setting goal state of {} to wait_primary after {} joined.",
                        primary.label(),
                        other.label()
                    );

                    self.notifier.log_and_notify(&message);

                    // prepare replication slot and access rules
                    self.assign(primary.node_id, WaitPrimary, &message);

                    return true;
                }
            }
        }

        // Another node wants to become standby: primary -> join_primary.
        if primary.is_current_state(Primary) {
            for other in &others {
                if other.is_current_state(WaitStandby) {
                    let message = format!(
                        "Setting goal state of {} to join_primary after {} joined.",
                        primary.label(),
                        other.label()
                    );

                    self.notifier.log_and_notify(&message);
                    self.assign(primary.node_id, JoinPrimary, &message);

                    return true;
                }
            }
        }

        if primary.is_current_state(Primary)
            || primary.is_current_state(WaitPrimary)
            || primary.is_current_state(ApplySettings)
        {
            // We count nodes in different ways to address the special
            // cases: nodes set up to participate in the replication quorum,
            // nodes currently in the secondary state, and nodes that are
            // both.
            let mut replication_quorum_count = others_count as i32;
            let mut secondary_nodes_count = others_count as i32;
            let mut secondary_quorum_nodes_count = others_count as i32;

            for other in &others {
                // Force unhealthy secondaries back to catching-up, unless
                // they are in report_lsn or join_secondary, states in which
                // the database is stopped while waiting for the new
                // primary.
                if other.goal_state == Secondary
                    && other.reported_state != ReportLsn
                    && other.reported_state != JoinSecondary
                    && self.unhealthy(other)
                {
                    secondary_nodes_count -= 1;
                    secondary_quorum_nodes_count -= 1;

                    let message = format!(
                        "Setting goal state of {} to catchingup after it became unhealthy.",
                        other.label()
                    );

                    self.notifier.log_and_notify(&message);

                    // other node is behind, no longer eligible for promotion
                    self.assign(other.node_id, Catchingup, &message);
                } else if !other.is_current_state(Secondary) {
                    secondary_nodes_count -= 1;
                    secondary_quorum_nodes_count -= 1;
                } else if other.is_current_state(Secondary) && !other.replication_quorum {
                    secondary_quorum_nodes_count -= 1;
                }

                if !other.replication_quorum {
                    replication_quorum_count -= 1;
                }
            }

            // All-async setup: the primary state is allowed in almost all
            // cases, the quorum expression being empty anyway. Still switch
            // to wait_primary when not a single secondary remains, to show
            // something unexpected is happening.
            if replication_quorum_count == 0 {
                let primary_goal_state = if secondary_nodes_count == 0 {
                    WaitPrimary
                } else {
                    Primary
                };

                if primary.goal_state != primary_goal_state {
                    let message = format!(
                        "Setting goal state of {} to {} because none of the \
                         secondary nodes are healthy at the moment.",
                        primary.label(),
                        primary_goal_state
                    );

                    self.notifier.log_and_notify(&message);
                    self.assign(primary.node_id, primary_goal_state, &message);
                }

                return true;
            }

            // No quorum standby left: with number_sync_standbys zero we
            // trade durability for availability and disable synchronous
            // replication through wait_primary. With a non-zero setting the
            // user asked for durability, writes stay blocked until a
            // standby comes back.
            if !primary.is_current_state(WaitPrimary) && secondary_quorum_nodes_count == 0 {
                let primary_goal_state = if formation.number_sync_standbys == 0 {
                    WaitPrimary
                } else {
                    Primary
                };

                if primary.goal_state != primary_goal_state {
                    let message = format!(
                        "Setting goal state of {} to {} because none of the standby \
                         nodes in the quorum are healthy at the moment.",
                        primary.label(),
                        primary_goal_state
                    );

                    self.notifier.log_and_notify(&message);
                    self.assign(primary.node_id, primary_goal_state, &message);

                    return true;
                }
            }

            // A healthy candidate secondary arrived: wait_primary -> primary.
            if primary.is_current_state(WaitPrimary) && secondary_quorum_nodes_count > 0 {
                let message = format!(
                    "Setting goal state of {} to primary now that we have {} healthy \
                     secondary nodes in the quorum.",
                    primary.label(),
                    secondary_quorum_nodes_count
                );

                self.notifier.log_and_notify(&message);
                self.assign(primary.node_id, Primary, &message);

                return true;
            }

            // Replication settings changed: apply_settings -> wait_primary
            // or primary. Even without healthy standbys, a non-zero
            // number_sync_standbys means the user wants writes blocked, and
            // we do that by switching to primary.
            if primary.is_current_state(ApplySettings) {
                let primary_goal_state = if formation.number_sync_standbys == 0
                    && secondary_quorum_nodes_count == 0
                {
                    WaitPrimary
                } else {
                    Primary
                };

                let message = format!(
                    "Setting goal state of {} to {} after it applied replication \
                     properties change.",
                    primary.label(),
                    primary_goal_state
                );

                self.notifier.log_and_notify(&message);
                self.assign(primary.node_id, primary_goal_state, &message);

                return true;
            }

            return true;
        }

        // A secondary was removed during registration, or there is no
        // visible reason to stay join_primary: join_primary -> primary.
        if primary.is_current_state(JoinPrimary) {
            let mut all_secondaries_are_healthy = true;

            for other in &others {
                // Skip nodes that are not failover candidates, avoiding a
                // ping-pong between join_primary and primary while setting
                // up a node registered with candidate priority zero.
                if other.candidate_priority == 0 && !other.is_current_state(WaitStandby) {
                    continue;
                }

                all_secondaries_are_healthy = all_secondaries_are_healthy
                    && other.goal_state == Secondary
                    && other.is_healthy();

                if !all_secondaries_are_healthy {
                    break;
                }
            }

            if all_secondaries_are_healthy {
                let message = format!("Setting goal state of {} to primary", primary.label());

                self.notifier.log_and_notify(&message);
                self.assign(primary.node_id, Primary, &message);

                return true;
            }
        }

        false
    }

    /// Orchestrates a failover when the group holds more than one standby:
    /// collect every candidate's last received position, then elect one.
    ///
    /// Called when the primary is not healthy, or to continue an election
    /// that already started. Returns true when the failover was driven one
    /// step further.
    fn proceed_for_ms_failover(&self, active: &Node, primary: Option<&Node>) -> bool {
        let nodes = self
            .catalog
            .nodes_in_group(&active.formation_id, active.group_id);

        // A failover might already be in progress with a selected
        // candidate; then keep driving it.
        if let Some(being_promoted) = find_candidate_being_promoted(&nodes) {
            if being_promoted.node_id == active.node_id {
                return self.proceed_with_ms_failover(active, being_promoted);
            }

            self.notifier.log_and_notify(&format!(
                "Active {} found failover candidate {} being promoted \
                 (currently \"{}\"/\"{}\")",
                active.label(),
                being_promoted.label(),
                being_promoted.reported_state,
                being_promoted.goal_state
            ));

            // The selected node might not be marked healthy at this time:
            // in report_lsn and prepare_promotion the database is shut
            // down. Still proceed with the previously selected node; we
            // really need to avoid two candidates at the same time.
            if matches!(being_promoted.reported_state, ReportLsn | PreparePromotion)
                || being_promoted.is_healthy()
            {
                debug!("Found candidate {}", being_promoted.label());

                return self.proceed_with_ms_failover(active, being_promoted);
            }
        }

        let Some(formation) = self.catalog.formation(&active.formation_id) else {
            return false;
        };

        let candidate_list = self.build_candidate_list(&nodes, formation.number_sync_standbys);

        // Refrain from selecting until every expected candidate reported
        // its position; a future report will be the kicker.
        if candidate_list.missing_nodes_count > 0 {
            self.notifier.log_and_notify(&format!(
                "Failover still in progress after {} nodes reported their LSN \
                 and we are waiting for {} nodes to report, active node is {} \
                 and reported state \"{}\"",
                candidate_list.candidates.len(),
                candidate_list.missing_nodes_count,
                active.label(),
                active.reported_state
            ));

            return false;
        }

        // To start the selection we need enough quorum candidates to both
        // promote and then accept writes; otherwise we would end up with a
        // wait_primary node and all writes blocked.
        let min_candidates = formation.number_sync_standbys as usize + 1;

        if candidate_list.candidates.is_empty() {
            return false;
        }

        if candidate_list.quorum_candidate_count < min_candidates {
            self.notifier.log_and_notify(&format!(
                "Failover still in progress with {} candidates that participate \
                 in the quorum having reported their LSN: {} nodes are required \
                 in the quorum to satisfy number_sync_standbys={} in formation \
                 \"{}\", active node is {} and reported state \"{}\"",
                candidate_list.quorum_candidate_count,
                min_candidates,
                formation.number_sync_standbys,
                formation.formation_id,
                active.label(),
                active.reported_state
            ));

            return false;
        }

        let most_advanced_nodes = list_most_advanced_standby_nodes(&nodes);

        let Some(most_advanced) = most_advanced_nodes.first() else {
            warn!(
                "no standby node reported a position in group {}",
                active.group_id
            );
            return false;
        };

        let most_advanced_lsn = most_advanced.reported_lsn;

        self.notifier.log_and_notify(&format!(
            "The current most advanced reported LSN is {}, as reported by {} \
             and {} other nodes",
            most_advanced_lsn,
            most_advanced.label(),
            most_advanced_nodes.len() - 1
        ));

        let selected =
            self.select_failover_candidate(&candidate_list, &most_advanced_nodes, primary);

        let Some(selected) = selected else {
            self.notifier.log_and_notify(&format!(
                "Failover still in progress after all {} candidate nodes \
                 reported their LSN and we failed to select one of them; \
                 active node is {} and reported state \"{}\"",
                candidate_list.candidates.len(),
                active.label(),
                active.reported_state
            ));

            return false;
        };

        self.promote_selected_node(&selected, primary, &candidate_list, most_advanced_lsn)
    }

    /// Builds the list of standbys that already reported their position,
    /// and assigns `report_lsn` to the nodes that should be reporting.
    /// Tracking the missing count prevents an early election.
    fn build_candidate_list(&self, nodes: &[Node], number_sync_standbys: i32) -> CandidateList {
        let mut list = CandidateList {
            number_sync_standbys,
            ..Default::default()
        };

        for node in nodes {
            // Skip old and new primary nodes, except a former primary that
            // reached draining or demoted: those are due to report too.
            if (node.is_in_primary_state()
                || node.is_being_demoted_primary()
                || node.is_demoted_primary())
                && !(node.is_current_state(Draining) || node.is_current_state(Demoted))
            {
                debug!(
                    "Skipping candidate {}, which is a primary (old or new)",
                    node.label()
                );
                continue;
            }

            // Skip unhealthy nodes to avoid waiting for them, unless the
            // agent is still reporting with the database down.
            if self.unhealthy(node) && !node.is_reporting(self.timing) {
                debug!("Skipping candidate {}, which is unhealthy", node.label());

                // A down secondary that already reported its position is
                // not missing. One that did not might hold the most
                // advanced position; electing without it could lose
                // committed data. Only quorum members are required to
                // report: only those are waited on at commit time.
                if node.replication_quorum && node.reported_state != ReportLsn {
                    list.missing_nodes_count += 1;
                }

                continue;
            }

            // Healthy standby that reached report_lsn: a candidate.
            if node.is_current_state(ReportLsn) {
                if node.replication_quorum || list.number_sync_standbys == 0 {
                    list.quorum_candidate_count += 1;
                }

                list.candidates.push(node.clone());
                continue;
            }

            // report_lsn assigned but not reached yet.
            if node.goal_state == ReportLsn {
                list.missing_nodes_count += 1;
                continue;
            }

            // Nodes in secondary or catchingup are due to report their
            // position. So are old primaries in draining or demoted, and a
            // node asked to rejoin a newly elected primary that has now
            // failed itself.
            let in_secondary_states = matches!(node.reported_state, Secondary | Catchingup)
                && matches!(node.goal_state, Secondary | Catchingup);

            if in_secondary_states
                || node.is_current_state(Draining)
                || node.is_current_state(Demoted)
                || (node.reported_state == Demoted && node.goal_state == Catchingup)
            {
                list.missing_nodes_count += 1;

                let message = format!(
                    "Setting goal state of {} to report_lsn to find the failover candidate",
                    node.label()
                );

                self.notifier.log_and_notify(&message);
                self.assign(node.node_id, ReportLsn, &message);
            }
        }

        list
    }

    /// Drives a failover forward when a candidate has been selected: the
    /// other standbys stop replication as soon as possible and follow the
    /// new primary once it is ready to stream.
    fn proceed_with_ms_failover(&self, active: &Node, candidate: &Node) -> bool {
        if active.is_current_state(ReportLsn) && candidate.candidate_is_ready_to_stream_wal() {
            let message = format!(
                "Setting goal state of {} to join_secondary after {} got \
                 selected as the failover candidate.",
                active.label(),
                candidate.label()
            );

            self.notifier.log_and_notify(&message);
            self.assign(active.node_id, JoinSecondary, &message);

            return true;
        }

        false
    }

    /// Selects the node to fail over to: any healthy candidate with the
    /// maximum priority, the most advanced position breaking ties. A
    /// candidate missing WAL is acceptable only when one of the most
    /// advanced standbys is healthy enough to hand the missing bytes over.
    fn select_failover_candidate(
        &self,
        candidate_list: &CandidateList,
        most_advanced_nodes: &[&Node],
        primary: Option<&Node>,
    ) -> Option<Node> {
        let sorted_candidates = group_list_candidates(&candidate_list.candidates);

        let most_advanced = most_advanced_nodes.first()?;

        // Refuse to orchestrate a failover that would lose more data than
        // configured. Whether replication was synchronous or not, promoting
        // a standby that lags too far behind the primary incurs data loss.
        if let Some(primary) = primary
            && !wal_difference_within(
                Some(most_advanced),
                Some(primary),
                self.timing.promote_wal_threshold,
            )
        {
            self.notifier.log_and_notify(&format!(
                "One of the most advanced standby nodes in the group is {} \
                 with reported LSN {}, which is more than the promotion \
                 threshold ({} bytes) behind the primary {}, which has \
                 reported {}",
                most_advanced.label(),
                most_advanced.reported_lsn,
                self.timing.promote_wal_threshold,
                primary.label(),
                primary.reported_lsn
            ));

            return None;
        }

        let mut selected: Option<&Node> = None;

        for node in sorted_candidates {
            if self.unhealthy(node) {
                self.notifier.log_and_notify(&format!(
                    "Not selecting failover candidate {} because it is unhealthy",
                    node.label()
                ));

                continue;
            }

            match selected {
                None => selected = Some(node),
                Some(current) => {
                    if node.candidate_priority == current.candidate_priority
                        && node.reported_lsn > current.reported_lsn
                    {
                        selected = Some(node);
                    } else if node.candidate_priority < current.candidate_priority {
                        // the scan is in decreasing priority order
                        break;
                    }
                }
            }
        }

        let selected = selected?;

        if selected.reported_lsn < most_advanced.reported_lsn {
            let some_most_advanced_healthy = most_advanced_nodes.iter().any(|n| n.is_healthy());

            if !some_most_advanced_healthy {
                self.notifier.log_and_notify(&format!(
                    "The selected candidate {} needs to fetch missing WAL to \
                     reach LSN {} (from current reported LSN {}) and none of \
                     the most advanced standby nodes are healthy at the moment.",
                    selected.label(),
                    most_advanced.reported_lsn,
                    selected.reported_lsn
                ));

                return None;
            }
        }

        Some(selected.clone())
    }

    /// Assigns the next goal state to the elected node: straight to
    /// `prepare_promotion` when it holds all the WAL, through
    /// `fast_forward` when it must fetch missing bytes first. Priorities
    /// shifted for a directed promotion or demotion are reset here.
    fn promote_selected_node(
        &self,
        selected: &Node,
        primary: Option<&Node>,
        candidate_list: &CandidateList,
        most_advanced_lsn: Lsn,
    ) -> bool {
        if selected.candidate_priority > MAX_USER_CANDIDATE_PRIORITY {
            let new_priority = selected.candidate_priority - CANDIDATE_PRIORITY_INCREMENT;

            self.catalog.set_replication_settings(
                selected.node_id,
                new_priority,
                selected.replication_quorum,
            );

            let message = format!(
                "Updating candidate priority back to {} for {}",
                new_priority,
                selected.label()
            );

            self.notifier.log_and_notify(&message);
            self.notify_replication_setting(selected.node_id, &message);
        }

        // A primary demoted by hand carries a negative priority to lose the
        // election; the election is done, reset it.
        for node in &candidate_list.candidates {
            if node.candidate_priority < 0 {
                let new_priority = node.candidate_priority + CANDIDATE_PRIORITY_INCREMENT;

                self.catalog.set_replication_settings(
                    node.node_id,
                    new_priority,
                    node.replication_quorum,
                );

                let message = format!(
                    "Updating candidate priority to {} for {}",
                    new_priority,
                    node.label()
                );

                self.notifier.log_and_notify(&message);
                self.notify_replication_setting(node.node_id, &message);
            }
        }

        if selected.reported_lsn == most_advanced_lsn {
            let message = match primary {
                Some(p) => format!(
                    "Setting goal state of {} to prepare_promotion after {} \
                     became unhealthy and {} nodes reported their LSN position.",
                    selected.label(),
                    p.label(),
                    candidate_list.candidates.len()
                ),
                None => format!(
                    "Setting goal state of {} to prepare_promotion and {} \
                     nodes reported their LSN position.",
                    selected.label(),
                    candidate_list.candidates.len()
                ),
            };

            self.notifier.log_and_notify(&message);
            self.assign(selected.node_id, PreparePromotion, &message);
        } else {
            let message = format!(
                "Setting goal state of {} to fast_forward after {} nodes \
                 reported their LSN position.",
                selected.label(),
                candidate_list.candidates.len()
            );

            self.notifier.log_and_notify(&message);
            self.assign(selected.node_id, FastForward, &message);
        }

        // leave the other nodes in report_lsn for now
        true
    }

    fn assign(&self, node_id: i64, goal_state: ReplicationState, description: &str) {
        assign_goal_state(self.catalog, self.notifier, node_id, goal_state, description);
    }

    fn notify_replication_setting(&self, node_id: i64, description: &str) {
        notify_current_state(self.catalog, self.notifier, node_id, description);
    }

    fn unhealthy(&self, node: &Node) -> bool {
        node.is_unhealthy(self.timing, self.started_at)
    }

    fn unhealthy_opt(&self, node: Option<&Node>) -> bool {
        node.is_none_or(|n| self.unhealthy(n))
    }
}

/// Writes a new goal state through the catalog, then records the decision
/// as an event and publishes the state change.
pub(crate) fn assign_goal_state(
    catalog: &dyn Catalog,
    notifier: &Notifier,
    node_id: i64,
    goal_state: ReplicationState,
    description: &str,
) {
    let Some(before) = catalog.node_by_id(node_id) else {
        return;
    };

    catalog.set_goal_state(node_id, goal_state);

    let Some(after) = catalog.node_by_id(node_id) else {
        return;
    };

    catalog.append_event(Event::for_node(&after, description));
    notifier.notify_state_change(StateNotification::from_transition(
        &before,
        &after,
        description,
    ));
}

/// Records an event and publishes a notification for a node whose states
/// did not change, after a settings update or a report worth surfacing.
pub(crate) fn notify_current_state(
    catalog: &dyn Catalog,
    notifier: &Notifier,
    node_id: i64,
    description: &str,
) {
    let Some(node) = catalog.node_by_id(node_id) else {
        return;
    };

    catalog.append_event(Event::for_node(&node, description));
    notifier.notify_state_change(StateNotification::from_transition(&node, &node, description));
}
