// tests/unit_register_test.rs

#[path = "support/mod.rs"]
mod support;

use steward::core::StewardError;
use steward::monitor::Monitor;
use steward::monitor::state::ReplicationState;
use support::*;

#[tokio::test]
async fn test_register_single_node_gets_single() {
    let monitor = monitor_with_formation(&config()).await;

    let assignment = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap();

    assert_eq!(assignment.group_id, 0);
    assert_eq!(assignment.goal_state, ReplicationState::Single);
    assert_eq!(assignment.candidate_priority, 100);
    assert!(assignment.replication_quorum);
    assert!(assignment.node_id > 0);
}

#[tokio::test]
async fn test_register_requires_formation() {
    let monitor = Monitor::new(&config());

    let err = monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap_err();

    assert!(matches!(err, StewardError::FormationNotFound(_)));
}

#[tokio::test]
async fn test_register_second_node_flips_primary_to_wait_primary() {
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

    let assignment = monitor
        .register_node(standby_request("b", 5002))
        .await
        .unwrap();

    assert_eq!(assignment.goal_state, ReplicationState::WaitStandby);

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::WaitPrimary);
}

#[tokio::test]
async fn test_register_while_join_in_progress_is_retryable() {
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

    monitor
        .register_node(standby_request("b", 5002))
        .await
        .unwrap();

    // node b is still joining: a third registration has to back off
    let err = monitor
        .register_node(standby_request("c", 5003))
        .await
        .unwrap_err();

    assert!(matches!(err, StewardError::ObjectInUse(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_register_rejects_out_of_range_candidate_priority() {
    let monitor = monitor_with_formation(&config()).await;

    let mut request = register_request("a", 5001);
    request.candidate_priority = 101;

    let err = monitor.register_node(request).await.unwrap_err();

    assert!(matches!(err, StewardError::InvalidParameter(_)));
}

#[tokio::test]
async fn test_register_first_node_adopts_dbname() {
    let monitor = monitor_with_formation(&config()).await;

    let mut request = register_request("a", 5001);
    request.dbname = "inventory".to_string();

    monitor.register_node(request).await.unwrap();

    let formation = monitor.get_formation(FORMATION).unwrap();
    assert_eq!(formation.dbname, "inventory");
}

#[tokio::test]
async fn test_register_dbname_mismatch_is_rejected() {
    let monitor = monitor_with_formation(&config()).await;

    monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap();

    let mut request = standby_request("b", 5002);
    request.dbname = "inventory".to_string();

    let err = monitor.register_node(request).await.unwrap_err();

    assert!(matches!(err, StewardError::InvalidState(_)));
}

#[tokio::test]
async fn test_register_requested_state_mismatch_leaves_no_node_behind() {
    let monitor = monitor_with_formation(&config()).await;

    // an empty group assigns single, not secondary
    let mut request = register_request("a", 5001);
    request.requested_state = ReplicationState::Secondary;

    let err = monitor.register_node(request).await.unwrap_err();

    assert!(matches!(err, StewardError::InvalidState(_)));
    assert!(monitor.get_nodes(FORMATION, 0).is_empty());
}

#[tokio::test]
async fn test_register_standby_needs_opt_secondary() {
    let monitor = Monitor::new(&config());
    monitor
        .create_formation(
            FORMATION,
            steward::monitor::state::FormationKind::Standalone,
            DBNAME,
            false,
            0,
        )
        .await
        .unwrap();

    monitor
        .register_node(register_request("a", 5001))
        .await
        .unwrap();

    let err = monitor
        .register_node(standby_request("b", 5002))
        .await
        .unwrap_err();

    assert!(matches!(err, StewardError::InvalidState(_)));
}

#[tokio::test]
async fn test_register_second_sync_standby_bumps_number_sync_standbys() {
    let monitor = monitor_with_formation(&config()).await;

    converge_pair(&monitor, 0x1000).await;
    assert_eq!(
        monitor.get_formation(FORMATION).unwrap().number_sync_standbys,
        0
    );

    monitor
        .register_node(standby_request("c", 5003))
        .await
        .unwrap();

    assert_eq!(
        monitor.get_formation(FORMATION).unwrap().number_sync_standbys,
        1
    );
}

#[tokio::test]
async fn test_register_picks_a_name_when_empty() {
    let monitor = monitor_with_formation(&config()).await;

    let assignment = monitor
        .register_node(register_request("", 5001))
        .await
        .unwrap();

    assert_eq!(assignment.name, format!("node_{}", assignment.node_id));
}
