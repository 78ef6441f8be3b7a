// src/core/monitor/state.rs

//! Defines the data structures the monitor tracks: formations (logical
//! clusters), nodes (one database server each), and the replication state
//! machine vocabulary shared by every subsystem.

use crate::config::TimingConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumIter, EnumString};

/// Candidate priorities are restricted to 0..=100 for users. Internally, a
/// directed promotion shifts the priority by `CANDIDATE_PRIORITY_INCREMENT`
/// to tweak the election, and resets it once the election is done.
pub const MAX_USER_CANDIDATE_PRIORITY: i32 = 100;
pub const CANDIDATE_PRIORITY_INCREMENT: i32 = MAX_USER_CANDIDATE_PRIORITY + 1;

/// How long a fresh agent report is trusted over a stale background health
/// check. This matches the agents' reporting period.
pub const REPORT_FRESHNESS: Duration = Duration::from_secs(1);

/// The states a node can be assigned or report. The `Display`/`FromStr`
/// forms are the canonical lower-snake names used in events, notifications,
/// and configuration.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    Init,
    Single,
    WaitStandby,
    WaitPrimary,
    Catchingup,
    Secondary,
    Primary,
    PreparePromotion,
    StopReplication,
    Draining,
    DemoteTimeout,
    Demoted,
    JoinPrimary,
    JoinSecondary,
    ApplySettings,
    Maintenance,
    PrepareMaintenance,
    WaitMaintenance,
    ReportLsn,
    FastForward,
    Dropped,
}

impl ReplicationState {
    /// Whether a node in this state accepts writes.
    pub fn can_take_writes(self) -> bool {
        matches!(
            self,
            Self::Single
                | Self::Primary
                | Self::WaitPrimary
                | Self::JoinPrimary
                | Self::ApplySettings
        )
    }

    /// Whether this is a primary state we accept to fail over from. A
    /// `wait_primary` node is excluded: its secondary may still be catching
    /// up.
    pub fn can_initiate_failover(self) -> bool {
        matches!(self, Self::Single | Self::Primary | Self::JoinPrimary)
    }

    /// Whether the state belongs to a primary node, including a primary in
    /// the middle of being demoted.
    pub fn belongs_to_primary(self) -> bool {
        self.can_take_writes()
            || matches!(
                self,
                Self::Draining | Self::DemoteTimeout | Self::PrepareMaintenance
            )
    }
}

/// The replication mode a standby is observed in, mirroring what the
/// database reports for each of its streaming peers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unknown,
    Sync,
    Async,
    Quorum,
    Potential,
}

/// The verdict of the background health checks for a node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Unknown,
    Bad,
    Good,
}

/// A write-ahead-log position. Positions only ever grow; comparing two of
/// them tells which node has replayed further.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Absolute distance in bytes between two log positions.
    pub fn distance(self, other: Lsn) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((hi, lo)) => {
                let hi = u64::from_str_radix(hi, 16)?;
                let lo = u64::from_str_radix(lo, 16)?;
                Ok(Lsn((hi << 32) | lo))
            }
            None => Ok(Lsn(u64::from_str_radix(s, 16)?)),
        }
    }
}

/// Formation kind: a standalone formation holds a single group 0, a sharded
/// formation holds a coordinator group 0 plus worker groups.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FormationKind {
    Standalone,
    Sharded,
}

impl FormationKind {
    /// Maps the node kind announced at registration to the formation kind it
    /// belongs to.
    pub fn from_node_kind(node_kind: &str) -> Option<FormationKind> {
        match node_kind {
            "standalone" => Some(FormationKind::Standalone),
            "coordinator" | "worker" => Some(FormationKind::Sharded),
            _ => None,
        }
    }
}

/// A formation is a named logical cluster, containing one or more groups of
/// nodes that replicate from one another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formation {
    pub formation_id: String,
    pub kind: FormationKind,
    pub dbname: String,
    /// Whether standby nodes may join this formation.
    pub opt_secondary: bool,
    /// How many synchronous standbys the quorum requires. Zero trades
    /// durability for write availability.
    pub number_sync_standbys: i32,
}

/// A database node tracked by the monitor.
///
/// `goal_state` is written only by the group state machine, the health
/// fields only by the health-check engine, and the reported fields only by
/// the node's own agent through the reporting operation.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: i64,
    pub formation_id: String,
    pub group_id: i32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub goal_state: ReplicationState,
    pub reported_state: ReplicationState,
    pub pg_is_running: bool,
    pub sync_state: SyncState,
    pub reported_tli: u32,
    pub reported_lsn: Lsn,
    pub health: NodeHealth,
    pub health_check_time: Option<Instant>,
    pub report_time: Option<Instant>,
    pub state_change_time: Instant,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
}

impl Node {
    /// The label used for a node in every log line, event, and notification.
    pub fn label(&self) -> String {
        format!(
            "node {} \"{}\" ({}:{})",
            self.node_id, self.name, self.host, self.port
        )
    }

    /// Whether the node reached its goal state.
    pub fn is_current_state(&self, state: ReplicationState) -> bool {
        self.reported_state == state && self.goal_state == state
    }

    /// Whether the node is known to have converged to a state that makes it
    /// the primary of its group. A primary cycling between `primary` and
    /// `apply_settings` still qualifies.
    pub fn is_in_primary_state(&self) -> bool {
        (self.goal_state == self.reported_state && self.goal_state.can_take_writes())
            || ((self.goal_state == ReplicationState::ApplySettings
                || self.goal_state == ReplicationState::Primary)
                && (self.reported_state == ReplicationState::Primary
                    || self.reported_state == ReplicationState::ApplySettings))
    }

    /// Whether the node is a primary currently going through a demotion.
    pub fn is_being_demoted_primary(&self) -> bool {
        self.reported_state.belongs_to_primary()
            && matches!(
                self.goal_state,
                ReplicationState::Draining
                    | ReplicationState::DemoteTimeout
                    | ReplicationState::PrepareMaintenance
            )
    }

    /// Whether the node is a primary that completed its demotion.
    pub fn is_demoted_primary(&self) -> bool {
        self.goal_state == ReplicationState::Demoted
            && (self.reported_state.belongs_to_primary()
                || self.reported_state == ReplicationState::Demoted)
    }

    /// Whether a standby node is going through the promotion process,
    /// including the intermediate steps where reported and goal states
    /// differ.
    pub fn is_being_promoted(&self) -> bool {
        use ReplicationState::*;

        match self.reported_state {
            ReportLsn => matches!(self.goal_state, FastForward | PreparePromotion),
            FastForward => matches!(self.goal_state, FastForward | PreparePromotion),
            PreparePromotion => {
                matches!(self.goal_state, PreparePromotion | StopReplication | WaitPrimary)
            }
            StopReplication => matches!(self.goal_state, StopReplication | WaitPrimary),
            _ => false,
        }
    }

    /// Whether a selected failover candidate has progressed far enough for
    /// the other standbys to use it as their upstream. `fast_forward` is too
    /// soon: the candidate is still fetching WAL itself.
    pub fn candidate_is_ready_to_stream_wal(&self) -> bool {
        use ReplicationState::*;

        match self.reported_state {
            PreparePromotion => matches!(self.goal_state, StopReplication | WaitPrimary),
            StopReplication => matches!(self.goal_state, StopReplication | WaitPrimary),
            WaitPrimary => matches!(self.goal_state, WaitPrimary | Primary),
            Primary => self.goal_state == Primary,
            _ => false,
        }
    }

    /// Whether the node takes part in an ongoing promotion, either as the
    /// candidate or as a supporting node reporting its LSN or re-joining.
    pub fn is_participating_in_promotion(&self) -> bool {
        self.is_being_promoted()
            || self.reported_state == ReplicationState::ReportLsn
            || self.goal_state == ReplicationState::ReportLsn
            || self.reported_state == ReplicationState::JoinSecondary
            || self.goal_state == ReplicationState::JoinSecondary
    }

    /// Whether the node has been assigned a maintenance state, reached or
    /// not.
    pub fn is_in_maintenance(&self) -> bool {
        matches!(
            self.goal_state,
            ReplicationState::PrepareMaintenance
                | ReplicationState::WaitMaintenance
                | ReplicationState::Maintenance
        )
    }

    /// A node is healthy when its last background check succeeded and its
    /// agent reports the database as running.
    ///
    /// Exception: when the background check says bad but the agent managed
    /// to report *after* that check and within the last reporting period,
    /// trust the agent. The node can clearly reach the monitor, so there is
    /// no network split right now and the background checks simply have not
    /// caught up yet.
    pub fn is_healthy(&self) -> bool {
        if self.health == NodeHealth::Bad {
            if let (Some(report_time), Some(health_check_time)) =
                (self.report_time, self.health_check_time)
            {
                if report_time > health_check_time && report_time.elapsed() < REPORT_FRESHNESS {
                    return self.pg_is_running;
                }
            }
        }

        self.health == NodeHealth::Good && self.pg_is_running
    }

    /// A node is unhealthy when it stopped reporting for longer than the
    /// unhealthy timeout and the background checks agree, or when its agent
    /// itself says the database is not running (trusted immediately).
    ///
    /// The startup grace period prevents failovers right after a monitor
    /// restart, before the background checks had a chance to run. A check
    /// recorded before the monitor started does not count.
    pub fn is_unhealthy(&self, timing: &TimingConfig, started_at: Instant) -> bool {
        let stopped_reporting = match self.report_time {
            Some(report_time) => report_time.elapsed() > timing.unhealthy_timeout,
            None => true,
        };

        if stopped_reporting
            && self.health == NodeHealth::Bad
            && self.health_check_time.is_some_and(|t| t > started_at)
            && started_at.elapsed() > timing.startup_grace_period
        {
            return true;
        }

        !self.pg_is_running
    }

    /// Whether the node reported recently enough to be considered alive for
    /// candidate selection purposes.
    pub fn is_reporting(&self, timing: &TimingConfig) -> bool {
        match self.report_time {
            Some(report_time) => report_time.elapsed() <= timing.unhealthy_timeout,
            None => false,
        }
    }

    /// Whether the drain grace window of a primary assigned `demote_timeout`
    /// has expired.
    pub fn drain_time_expired(&self, timing: &TimingConfig) -> bool {
        self.goal_state == ReplicationState::DemoteTimeout
            && self.state_change_time.elapsed() > timing.drain_timeout
    }
}

/// Whether the most recently reported log positions of two nodes are within
/// the given byte distance. Returns false when either node has not reported
/// a position yet, and also when the nodes report different timelines.
pub fn wal_difference_within(node: Option<&Node>, other: Option<&Node>, delta: u64) -> bool {
    let (node, other) = match (node, other) {
        (Some(node), Some(other)) => (node, other),
        _ => return true,
    };

    if !node.reported_lsn.is_valid() || !other.reported_lsn.is_valid() {
        return false;
    }

    node.reported_lsn.distance(other.reported_lsn) <= delta
}

/// Returns the writable node of a group, if any.
pub fn find_primary_node(nodes: &[Node]) -> Option<&Node> {
    nodes.iter().find(|n| n.goal_state.can_take_writes())
}

/// Returns the primary node a manual failover can start from: a writable
/// node that converged to its goal state.
pub fn find_node_to_failover_from(nodes: &[Node]) -> Option<&Node> {
    nodes
        .iter()
        .find(|n| n.goal_state.can_initiate_failover() && n.reported_state == n.goal_state)
}

/// Returns the node of a group holding a role only a primary can have,
/// including a primary that is draining or was just demoted. A demoted
/// primary re-joining the group must not shadow the one actually being
/// demoted.
pub fn find_primary_or_demoted_node(nodes: &[Node]) -> Option<&Node> {
    if let Some(primary) = find_primary_node(nodes) {
        return Some(primary);
    }

    let mut primary: Option<&Node> = None;

    for node in nodes {
        if node.reported_state.belongs_to_primary()
            && (!primary.is_some_and(|p| p.is_being_demoted_primary())
                || !node.is_demoted_primary())
        {
            primary = Some(node);
        }
    }

    primary
}

/// Returns the first node of the group currently going through a promotion.
pub fn find_candidate_being_promoted(nodes: &[Node]) -> Option<&Node> {
    nodes.iter().find(|n| n.is_being_promoted())
}

/// Whether any node of the group is participating in a promotion.
pub fn is_failover_in_progress(nodes: &[Node]) -> bool {
    nodes.iter().any(|n| n.is_participating_in_promotion())
}

/// Returns the failover candidates of a group (nodes with a non-zero
/// candidate priority), ordered by decreasing priority.
pub fn group_list_candidates(nodes: &[Node]) -> Vec<&Node> {
    let mut candidates: Vec<&Node> = nodes.iter().filter(|n| n.candidate_priority > 0).collect();
    candidates.sort_by(|a, b| {
        b.candidate_priority
            .cmp(&a.candidate_priority)
            .then(a.node_id.cmp(&b.node_id))
    });
    candidates
}

/// Returns the standby nodes that reported the most advanced position,
/// skipping the old primary. Timelines compare before positions.
pub fn list_most_advanced_standby_nodes(nodes: &[Node]) -> Vec<&Node> {
    let mut standbys: Vec<&Node> = nodes
        .iter()
        .filter(|n| !n.reported_state.belongs_to_primary())
        .collect();
    standbys.sort_by(|a, b| {
        (b.reported_tli, b.reported_lsn).cmp(&(a.reported_tli, a.reported_lsn))
    });

    match standbys.first() {
        Some(most_advanced) => {
            let lsn = most_advanced.reported_lsn;
            standbys.into_iter().filter(|n| n.reported_lsn == lsn).collect()
        }
        None => Vec::new(),
    }
}

/// Counts the nodes whose replication quorum property is set.
pub fn count_sync_standbys(nodes: &[Node]) -> usize {
    nodes.iter().filter(|n| n.replication_quorum).count()
}
