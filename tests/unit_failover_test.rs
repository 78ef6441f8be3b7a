// tests/unit_failover_test.rs

#[path = "support/mod.rs"]
mod support;

use std::time::Duration;
use steward::core::StewardError;
use steward::monitor::state::{NodeHealth, ReplicationState};
use support::*;

#[tokio::test]
async fn test_unhealthy_primary_triggers_promotion() {
    let monitor = monitor_with_formation(&failover_config()).await;
    let lsn = 0x5000;
    let (a, b) = converge_pair(&monitor, lsn).await;

    // the primary stops answering its background checks
    monitor.set_node_health(a, NodeHealth::Bad);

    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::Secondary, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::PreparePromotion);

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::Draining);

    // the candidate sees no more writes: the old primary gets its grace
    // window to stop itself
    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::PreparePromotion, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::StopReplication);

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::DemoteTimeout);

    // the drain window is zero in this configuration: promotion completes
    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::StopReplication, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::WaitPrimary);

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::Demoted);
}

#[tokio::test]
async fn test_demoted_primary_rejoins_as_standby() {
    let monitor = monitor_with_formation(&failover_config()).await;
    let lsn = 0x5000;
    let (a, b) = converge_pair(&monitor, lsn).await;

    monitor.set_node_health(a, NodeHealth::Bad);

    monitor
        .node_active(FORMATION, report(b, ReplicationState::Secondary, lsn))
        .await
        .unwrap();
    monitor
        .node_active(FORMATION, report(b, ReplicationState::PreparePromotion, lsn))
        .await
        .unwrap();
    monitor
        .node_active(FORMATION, report(b, ReplicationState::StopReplication, lsn))
        .await
        .unwrap();

    // the new primary converges and the old one comes back to life
    monitor.set_node_health(a, NodeHealth::Good);
    monitor.set_node_health(b, NodeHealth::Good);

    monitor
        .node_active(FORMATION, report(b, ReplicationState::WaitPrimary, lsn))
        .await
        .unwrap();

    let assignment = monitor
        .node_active(FORMATION, report(a, ReplicationState::Demoted, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Catchingup);
}

#[tokio::test]
async fn test_promotion_safety_threshold() {
    let monitor = monitor_with_formation(&failover_config()).await;
    let lsn = 64 * 1024 * 1024;
    let (a, b) = converge_pair(&monitor, lsn).await;

    monitor.set_node_health(a, NodeHealth::Bad);

    // the secondary lags by more than the promotion threshold: promoting it
    // would lose committed data, so nothing moves
    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::Secondary, 0x100))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Secondary);

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::Primary);
}

#[tokio::test]
async fn test_startup_grace_period_defers_failure_detection() {
    let mut config = failover_config();
    config.timing.startup_grace_period = Duration::from_secs(3600);

    let monitor = monitor_with_formation(&config).await;
    let lsn = 0x5000;
    let (a, b) = converge_pair(&monitor, lsn).await;

    monitor.set_node_health(a, NodeHealth::Bad);

    // the monitor just started: timing alone must not mark the primary
    // unhealthy yet
    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::Secondary, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Secondary);
}

#[tokio::test]
async fn test_self_reported_shutdown_is_trusted_immediately() {
    let mut config = failover_config();
    config.timing.startup_grace_period = Duration::from_secs(3600);
    config.timing.unhealthy_timeout = Duration::from_secs(3600);

    let monitor = monitor_with_formation(&config).await;
    let lsn = 0x5000;
    let (a, b) = converge_pair(&monitor, lsn).await;

    // the primary's own agent says the database is down: no grace applies
    let mut down = report(a, ReplicationState::Primary, lsn);
    down.pg_is_running = false;
    monitor.node_active(FORMATION, down).await.unwrap();

    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::Secondary, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::PreparePromotion);
}

#[tokio::test]
async fn test_manual_failover_swaps_the_stable_pair() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x5000;
    let (_a, _b) = converge_pair(&monitor, lsn).await;

    monitor.perform_failover(FORMATION, 0).await.unwrap();

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    let b_node = monitor.get_node(FORMATION, "b").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::Draining);
    assert_eq!(b_node.goal_state, ReplicationState::PreparePromotion);
}

#[tokio::test]
async fn test_manual_failover_requires_a_stable_pair() {
    let monitor = monitor_with_formation(&config()).await;

    let a = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap()
        .node_id;
    monitor
        .node_active(FORMATION, report(a, ReplicationState::Single, 0))
        .await
        .unwrap();

    // one node only
    let err = monitor.perform_failover(FORMATION, 0).await.unwrap_err();
    assert!(matches!(err, StewardError::InvalidState(_)));

    // two nodes, but the join has not converged yet
    monitor
        .register_node(standby_request("b", 5002))
        .await
        .unwrap();

    let err = monitor.perform_failover(FORMATION, 0).await.unwrap_err();
    assert!(matches!(err, StewardError::InvalidState(_)));
}

#[tokio::test]
async fn test_perform_promotion_of_the_secondary() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x5000;
    converge_pair(&monitor, lsn).await;

    let promoted = monitor.perform_promotion(FORMATION, "b").await.unwrap();
    assert!(promoted);

    let b_node = monitor.get_node(FORMATION, "b").unwrap();
    assert_eq!(b_node.goal_state, ReplicationState::PreparePromotion);
}

#[tokio::test]
async fn test_perform_promotion_of_the_primary_is_a_noop() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x5000;
    converge_pair(&monitor, lsn).await;

    let promoted = monitor.perform_promotion(FORMATION, "a").await.unwrap();
    assert!(!promoted);
}
