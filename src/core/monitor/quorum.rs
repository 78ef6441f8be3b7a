// src/core/monitor/quorum.rs

//! Synchronous-replication quorum computation for a group, and the
//! feasibility checks guarding the formation's `number_sync_standbys`.

use super::state::{Formation, Node, ReplicationState, find_primary_node};
use crate::core::errors::StewardError;

/// The name under which a standby appears in the synchronous standby
/// expression, derived from its immutable node id.
fn standby_name(node: &Node) -> String {
    format!("steward_standby_{}", node.node_id)
}

/// Returns the quorum-participating standbys of a group, ordered by
/// decreasing candidate priority.
pub fn group_list_sync_standbys(standbys: &[Node]) -> Vec<&Node> {
    let mut sync_standbys: Vec<&Node> =
        standbys.iter().filter(|n| n.replication_quorum).collect();
    sync_standbys.sort_by(|a, b| {
        b.candidate_priority
            .cmp(&a.candidate_priority)
            .then(a.node_id.cmp(&b.node_id))
    });
    sync_standbys
}

/// Computes the synchronous standby expression for a group.
///
/// A single node means no synchronous replication at all. With one standby
/// we require exactly that one, provided it participates in the quorum and
/// is expected in the `secondary` state. With several standbys the
/// expression requires `number_sync_standbys` of the participating nodes:
/// `ANY N (...)` when every participant carries the same candidate
/// priority, `FIRST N (...)` in priority order otherwise.
pub fn synchronous_standby_names(
    formation: &Formation,
    group_nodes: &[Node],
) -> Result<String, StewardError> {
    if group_nodes.is_empty() {
        return Err(StewardError::InvalidState(format!(
            "no nodes found in formation \"{}\"",
            formation.formation_id
        )));
    }

    if group_nodes.len() == 1 {
        return Ok(String::new());
    }

    let primary = find_primary_node(group_nodes).ok_or_else(|| {
        StewardError::InvalidState(format!(
            "couldn't find the primary node in formation \"{}\"",
            formation.formation_id
        ))
    })?;

    let standbys: Vec<Node> = group_nodes
        .iter()
        .filter(|n| n.node_id != primary.node_id)
        .cloned()
        .collect();

    // Single standby: number_sync_standbys is expected to be zero, and the
    // stand-in requirement is that one standby, when it is eligible.
    if group_nodes.len() == 2 {
        let secondary = &standbys[0];

        if secondary.replication_quorum
            && secondary.goal_state == ReplicationState::Secondary
        {
            return Ok(format!("ANY 1 ({})", standby_name(secondary)));
        }

        return Ok(String::new());
    }

    let sync_standbys = group_list_sync_standbys(&standbys);

    if sync_standbys.is_empty() || primary.is_current_state(ReplicationState::WaitPrimary) {
        return Ok(String::new());
    }

    // number_sync_standbys zero still enables our failover trade-off, but
    // an expression requiring zero nodes would not make sense.
    let number_sync_standbys = formation.number_sync_standbys.max(1);

    let names: Vec<String> = sync_standbys.iter().map(|n| standby_name(n)).collect();

    let all_same_priority = sync_standbys
        .windows(2)
        .all(|w| w[0].candidate_priority == w[1].candidate_priority);

    let method = if all_same_priority { "ANY" } else { "FIRST" };

    Ok(format!(
        "{} {} ({})",
        method,
        number_sync_standbys,
        names.join(", ")
    ))
}

/// Whether `number_sync_standbys` is feasible for a group: zero is always
/// legal, any other value requires one spare on top of the requirement.
/// Returns the count of quorum-participating standbys alongside.
pub fn number_sync_standbys_is_valid(
    number_sync_standbys: i32,
    standbys: &[Node],
) -> (bool, usize) {
    let participating = standbys.iter().filter(|n| n.replication_quorum).count();

    (
        number_sync_standbys == 0 || participating >= (number_sync_standbys as usize + 1),
        participating,
    )
}
