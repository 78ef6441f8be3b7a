// tests/unit_node_active_test.rs

#[path = "support/mod.rs"]
mod support;

use steward::core::StewardError;
use steward::monitor::state::{NodeHealth, ReplicationState};
use support::*;

#[tokio::test]
async fn test_lone_node_converges_to_single() {
    let monitor = monitor_with_formation(&config()).await;

    let a = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap()
        .node_id;

    let assignment = monitor
        .node_active(FORMATION, report(a, ReplicationState::Init, 0))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Single);

    let assignment = monitor
        .node_active(FORMATION, report(a, ReplicationState::Single, 0))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Single);
}

#[tokio::test]
async fn test_join_dance_reaches_primary_secondary() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x2000;

    let a = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap()
        .node_id;
    monitor
        .node_active(FORMATION, report(a, ReplicationState::Single, lsn))
        .await
        .unwrap();

    let b = monitor
        .register_node(standby_request("b", 5002))
        .await
        .unwrap()
        .node_id;

    monitor.set_node_health(a, NodeHealth::Good);
    monitor.set_node_health(b, NodeHealth::Good);

    // first's goal flipped at registration; reporting it unlocks the standby
    let assignment = monitor
        .node_active(FORMATION, report(a, ReplicationState::WaitPrimary, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::WaitPrimary);

    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::WaitStandby, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Catchingup);

    // caught up close enough, healthy, same timeline: promotion to secondary
    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::Catchingup, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Secondary);

    monitor
        .node_active(FORMATION, report(b, ReplicationState::Secondary, lsn))
        .await
        .unwrap();

    // with a healthy quorum secondary, the primary leaves wait_primary
    let assignment = monitor
        .node_active(FORMATION, report(a, ReplicationState::WaitPrimary, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Primary);
}

#[tokio::test]
async fn test_unknown_node_must_reregister() {
    let monitor = monitor_with_formation(&config()).await;

    let err = monitor
        .node_active(FORMATION, report(42, ReplicationState::Single, 0))
        .await
        .unwrap_err();

    assert!(matches!(err, StewardError::NodeNotFound(_)));
}

#[tokio::test]
async fn test_report_to_wrong_formation_is_rejected() {
    let monitor = monitor_with_formation(&config()).await;
    monitor
        .create_formation(
            "other",
            steward::monitor::state::FormationKind::Standalone,
            DBNAME,
            true,
            0,
        )
        .await
        .unwrap();

    let a = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap()
        .node_id;

    let err = monitor
        .node_active("other", report(a, ReplicationState::Single, 0))
        .await
        .unwrap_err();

    assert!(matches!(err, StewardError::InvalidState(_)));
}

#[tokio::test]
async fn test_stable_pair_reports_are_a_fixed_point() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x3000;
    let (a, b) = converge_pair(&monitor, lsn).await;

    for _ in 0..3 {
        let assignment = monitor
            .node_active(FORMATION, report(a, ReplicationState::Primary, lsn))
            .await
            .unwrap();
        assert_eq!(assignment.goal_state, ReplicationState::Primary);

        let assignment = monitor
            .node_active(FORMATION, report(b, ReplicationState::Secondary, lsn))
            .await
            .unwrap();
        assert_eq!(assignment.goal_state, ReplicationState::Secondary);
    }
}

#[tokio::test]
async fn test_catchingup_stays_without_health_verdict() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x2000;

    let a = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap()
        .node_id;
    monitor
        .node_active(FORMATION, report(a, ReplicationState::Single, lsn))
        .await
        .unwrap();

    let b = monitor
        .register_node(standby_request("b", 5002))
        .await
        .unwrap()
        .node_id;

    monitor
        .node_active(FORMATION, report(a, ReplicationState::WaitPrimary, lsn))
        .await
        .unwrap();
    monitor
        .node_active(FORMATION, report(b, ReplicationState::WaitStandby, lsn))
        .await
        .unwrap();

    // no background check succeeded for b yet: it stays catching up
    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::Catchingup, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Catchingup);
}

#[tokio::test]
async fn test_catchingup_stays_on_timeline_mismatch() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x2000;

    let a = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap()
        .node_id;
    monitor
        .node_active(FORMATION, report(a, ReplicationState::Single, lsn))
        .await
        .unwrap();

    let b = monitor
        .register_node(standby_request("b", 5002))
        .await
        .unwrap()
        .node_id;

    monitor.set_node_health(a, NodeHealth::Good);
    monitor.set_node_health(b, NodeHealth::Good);

    monitor
        .node_active(FORMATION, report(a, ReplicationState::WaitPrimary, lsn))
        .await
        .unwrap();
    monitor
        .node_active(FORMATION, report(b, ReplicationState::WaitStandby, lsn))
        .await
        .unwrap();

    let mut diverged = report(b, ReplicationState::Catchingup, lsn);
    diverged.reported_tli = 2;

    let assignment = monitor.node_active(FORMATION, diverged).await.unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Catchingup);
}

#[tokio::test]
async fn test_catchingup_stays_beyond_wal_threshold() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 64 * 1024 * 1024;

    let a = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap()
        .node_id;
    monitor
        .node_active(FORMATION, report(a, ReplicationState::Single, lsn))
        .await
        .unwrap();

    let b = monitor
        .register_node(standby_request("b", 5002))
        .await
        .unwrap()
        .node_id;

    monitor.set_node_health(a, NodeHealth::Good);
    monitor.set_node_health(b, NodeHealth::Good);

    monitor
        .node_active(FORMATION, report(a, ReplicationState::WaitPrimary, lsn))
        .await
        .unwrap();
    monitor
        .node_active(FORMATION, report(b, ReplicationState::WaitStandby, lsn))
        .await
        .unwrap();

    // a whole 64MB behind: more than one WAL segment away from the primary
    let assignment = monitor
        .node_active(FORMATION, report(b, ReplicationState::Catchingup, 0x100))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Catchingup);
}
