// tests/property_test.rs

//! Property-based tests for the monitor: invariants that must hold under
//! arbitrary report and health-verdict interleavings.

#[path = "support/mod.rs"]
mod support;

use proptest::prelude::*;
use steward::monitor::Monitor;
use steward::monitor::state::{Lsn, NodeHealth, ReplicationState};
use strum::IntoEnumIterator;
use support::*;

/// One simulated agent interaction: which node acts, whether its agent
/// converged to the assigned goal or still lags on its last reported
/// state, the health verdict of the background checks, and how far the
/// node's position moved.
type Step = (bool, bool, bool, u64);

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        (
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            0u64..(8 * 1024 * 1024),
        ),
        1..40,
    )
}

async fn run_steps(monitor: &Monitor, a: i64, b: i64, base_lsn: u64, steps: &[Step]) {
    for (pick_b, converged, health_good, lsn_delta) in steps {
        let node_id = if *pick_b { b } else { a };

        let Some(node) = monitor
            .get_nodes(FORMATION, 0)
            .into_iter()
            .find(|n| n.node_id == node_id)
        else {
            continue;
        };

        let verdict = if *health_good {
            NodeHealth::Good
        } else {
            NodeHealth::Bad
        };
        monitor.set_node_health(node_id, verdict);

        let reported = if *converged {
            node.goal_state
        } else {
            node.reported_state
        };

        let _ = monitor
            .node_active(FORMATION, report(node_id, reported, base_lsn + lsn_delta))
            .await;
    }
}

/// Counts the nodes whose reported and goal states both accept writes.
fn writable_count(monitor: &Monitor) -> usize {
    monitor
        .get_nodes(FORMATION, 0)
        .iter()
        .filter(|n| n.reported_state.can_take_writes() && n.goal_state.can_take_writes())
        .count()
}

proptest! {
    #[test]
    fn replication_state_names_round_trip(
        state in prop::sample::select(ReplicationState::iter().collect::<Vec<_>>())
    ) {
        let name = state.to_string();
        let parsed: ReplicationState = name.parse().expect("every state has a name");
        prop_assert_eq!(parsed, state);
    }

    #[test]
    fn lsn_rendering_round_trips(value in any::<u64>()) {
        let lsn = Lsn(value);
        let parsed: Lsn = lsn.to_string().parse().expect("rendered positions parse");
        prop_assert_eq!(parsed, lsn);
    }

    // At most one node of a group ever holds a writable reported and goal
    // state at the same time, whatever the agents report and whatever the
    // health checks see.
    #[test]
    fn writable_roles_are_mutually_exclusive(steps in steps()) {
        let rt = tokio::runtime::Runtime::new().expect("a runtime starts");

        rt.block_on(async {
            let monitor = monitor_with_formation(&failover_config()).await;
            let base_lsn = 0x100000;
            let (a, b) = converge_pair(&monitor, base_lsn).await;

            for step in &steps {
                run_steps(&monitor, a, b, base_lsn, std::slice::from_ref(step)).await;

                let writable = writable_count(&monitor);
                assert!(
                    writable <= 1,
                    "{writable} nodes hold a writable reported+goal state"
                );
            }
        });
    }

    // Repeated evaluation with unchanged inputs is a fixed point: once the
    // health verdicts stop moving, re-sending the same reports changes no
    // goal state.
    #[test]
    fn evaluation_converges_to_a_fixed_point(steps in steps()) {
        let rt = tokio::runtime::Runtime::new().expect("a runtime starts");

        rt.block_on(async {
            let monitor = monitor_with_formation(&failover_config()).await;
            let base_lsn = 0x100000;
            let (a, b) = converge_pair(&monitor, base_lsn).await;

            run_steps(&monitor, a, b, base_lsn, &steps).await;

            monitor.set_node_health(a, NodeHealth::Good);
            monitor.set_node_health(b, NodeHealth::Good);

            let mut snapshots = Vec::new();

            for _ in 0..3 {
                for node_id in [a, b] {
                    let Some(node) = monitor
                        .get_nodes(FORMATION, 0)
                        .into_iter()
                        .find(|n| n.node_id == node_id)
                    else {
                        continue;
                    };

                    let _ = monitor
                        .node_active(
                            FORMATION,
                            report(node_id, node.reported_state, node.reported_lsn.0),
                        )
                        .await;
                }

                let goals: Vec<(i64, ReplicationState, ReplicationState)> = monitor
                    .get_nodes(FORMATION, 0)
                    .iter()
                    .map(|n| (n.node_id, n.reported_state, n.goal_state))
                    .collect();
                snapshots.push(goals);
            }

            assert_eq!(
                snapshots[1], snapshots[2],
                "a settled group must not keep transitioning on unchanged reports"
            );
        });
    }
}
