// tests/support/mod.rs

//! Shared fixtures for the monitor unit tests.

#![allow(dead_code)]

use std::time::Duration;
use steward::config::Config;
use steward::monitor::Monitor;
use steward::monitor::service::{NodeReport, RegisterRequest};
use steward::monitor::state::{FormationKind, Lsn, NodeHealth, ReplicationState, SyncState};

pub const FORMATION: &str = "default";
pub const DBNAME: &str = "appdb";

/// A configuration with the default production thresholds.
pub fn config() -> Config {
    Config::default()
}

/// A configuration under which failure detection fires immediately: no
/// startup grace, no unhealthy timeout, no drain grace window.
pub fn failover_config() -> Config {
    let mut config = Config::default();
    config.timing.unhealthy_timeout = Duration::ZERO;
    config.timing.startup_grace_period = Duration::ZERO;
    config.timing.drain_timeout = Duration::ZERO;
    config
}

pub async fn monitor_with_formation(config: &Config) -> Monitor {
    let monitor = Monitor::new(config);
    monitor
        .create_formation(FORMATION, FormationKind::Standalone, DBNAME, true, 0)
        .await
        .expect("formation is created");
    monitor
}

pub fn register_request(name: &str, port: u16) -> RegisterRequest {
    RegisterRequest {
        formation_id: FORMATION.to_string(),
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        dbname: DBNAME.to_string(),
        group_id: -1,
        requested_state: ReplicationState::Init,
        node_kind: "standalone".to_string(),
        candidate_priority: 100,
        replication_quorum: true,
    }
}

pub fn standby_request(name: &str, port: u16) -> RegisterRequest {
    RegisterRequest {
        requested_state: ReplicationState::WaitStandby,
        ..register_request(name, port)
    }
}

pub fn report(node_id: i64, state: ReplicationState, lsn: u64) -> NodeReport {
    NodeReport {
        node_id,
        group_id: 0,
        reported_state: state,
        pg_is_running: true,
        reported_tli: 1,
        reported_lsn: Lsn(lsn),
        sync_state: SyncState::Quorum,
    }
}

/// Drives a two-node group to the stable primary/secondary pair: node "a"
/// as the primary, node "b" as the secondary, both healthy, both at the
/// given log position. Returns their node ids.
pub async fn converge_pair(monitor: &Monitor, lsn: u64) -> (i64, i64) {
    let a = monitor
        .register_node(register_request("a", 5001))
        .await
        .expect("node a registers")
        .node_id;

    monitor
        .node_active(FORMATION, report(a, ReplicationState::Single, lsn))
        .await
        .expect("node a reports single");

    let b = monitor
        .register_node(standby_request("b", 5002))
        .await
        .expect("node b registers")
        .node_id;

    monitor.set_node_health(a, NodeHealth::Good);
    monitor.set_node_health(b, NodeHealth::Good);

    monitor
        .node_active(FORMATION, report(a, ReplicationState::WaitPrimary, lsn))
        .await
        .expect("node a reports wait_primary");

    monitor
        .node_active(FORMATION, report(b, ReplicationState::WaitStandby, lsn))
        .await
        .expect("node b reports wait_standby");

    monitor
        .node_active(FORMATION, report(b, ReplicationState::Catchingup, lsn))
        .await
        .expect("node b reports catchingup");

    monitor
        .node_active(FORMATION, report(b, ReplicationState::Secondary, lsn))
        .await
        .expect("node b reports secondary");

    monitor
        .node_active(FORMATION, report(a, ReplicationState::WaitPrimary, lsn))
        .await
        .expect("node a reports wait_primary again");

    monitor
        .node_active(FORMATION, report(a, ReplicationState::Primary, lsn))
        .await
        .expect("node a reports primary");

    let a_node = monitor.get_node(FORMATION, "a").expect("node a exists");
    let b_node = monitor.get_node(FORMATION, "b").expect("node b exists");
    assert_eq!(a_node.goal_state, ReplicationState::Primary);
    assert_eq!(b_node.goal_state, ReplicationState::Secondary);

    (a, b)
}

/// Extends a converged pair with a third node "c", ending with a stable
/// primary and two healthy secondaries. Registration of the second sync
/// standby bumps number_sync_standbys to one.
pub async fn converge_trio(monitor: &Monitor, lsn: u64) -> (i64, i64, i64) {
    let (a, b) = converge_pair(monitor, lsn).await;

    let c = monitor
        .register_node(standby_request("c", 5003))
        .await
        .expect("node c registers")
        .node_id;

    monitor.set_node_health(c, NodeHealth::Good);

    monitor
        .node_active(FORMATION, report(a, ReplicationState::JoinPrimary, lsn))
        .await
        .expect("node a reports join_primary");

    monitor
        .node_active(FORMATION, report(c, ReplicationState::WaitStandby, lsn))
        .await
        .expect("node c reports wait_standby");

    monitor
        .node_active(FORMATION, report(c, ReplicationState::Catchingup, lsn))
        .await
        .expect("node c reports catchingup");

    monitor
        .node_active(FORMATION, report(c, ReplicationState::Secondary, lsn))
        .await
        .expect("node c reports secondary");

    monitor
        .node_active(FORMATION, report(a, ReplicationState::JoinPrimary, lsn))
        .await
        .expect("node a reports join_primary again");

    monitor
        .node_active(FORMATION, report(a, ReplicationState::Primary, lsn))
        .await
        .expect("node a reports primary");

    let a_node = monitor.get_node(FORMATION, "a").expect("node a exists");
    assert_eq!(a_node.goal_state, ReplicationState::Primary);

    (a, b, c)
}
