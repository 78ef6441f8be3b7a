// tests/unit_settings_test.rs

#[path = "support/mod.rs"]
mod support;

use steward::core::StewardError;
use steward::monitor::state::ReplicationState;
use support::*;

#[tokio::test]
async fn test_number_sync_standbys_requires_one_spare() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x9000;
    converge_pair(&monitor, lsn).await;

    // one quorum standby only: 1 requires at least 2 participating
    let err = monitor
        .set_formation_number_sync_standbys(FORMATION, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StewardError::InvalidParameter(_)));
}

#[tokio::test]
async fn test_number_sync_standbys_zero_is_always_legal() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x9000;
    let (a, _b, _c) = converge_trio(&monitor, lsn).await;

    monitor
        .set_formation_number_sync_standbys(FORMATION, 0)
        .await
        .unwrap();

    assert_eq!(
        monitor.get_formation(FORMATION).unwrap().number_sync_standbys,
        0
    );

    // the primary has to apply the new replication settings
    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::ApplySettings);

    let assignment = monitor
        .node_active(FORMATION, report(a, ReplicationState::ApplySettings, lsn))
        .await
        .unwrap();
    assert_eq!(assignment.goal_state, ReplicationState::Primary);
}

#[tokio::test]
async fn test_number_sync_standbys_accepts_a_feasible_value() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x9000;
    converge_trio(&monitor, lsn).await;

    // two quorum standbys: 1 is feasible, 2 is not
    monitor
        .set_formation_number_sync_standbys(FORMATION, 1)
        .await
        .unwrap();

    let err = monitor
        .set_formation_number_sync_standbys(FORMATION, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, StewardError::InvalidParameter(_)));
}

#[tokio::test]
async fn test_set_candidate_priority_validates_range() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x9000;
    converge_pair(&monitor, lsn).await;

    let err = monitor
        .set_candidate_priority(FORMATION, "b", 101)
        .await
        .unwrap_err();
    assert!(matches!(err, StewardError::InvalidParameter(_)));

    let err = monitor
        .set_candidate_priority(FORMATION, "b", -1)
        .await
        .unwrap_err();
    assert!(matches!(err, StewardError::InvalidParameter(_)));
}

#[tokio::test]
async fn test_set_candidate_priority_has_primary_apply_settings() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x9000;
    let (a, _b) = converge_pair(&monitor, lsn).await;

    monitor
        .set_candidate_priority(FORMATION, "b", 50)
        .await
        .unwrap();

    let b_node = monitor.get_node(FORMATION, "b").unwrap();
    assert_eq!(b_node.candidate_priority, 50);

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::ApplySettings);

    // a second change while the primary is still applying is rejected
    monitor
        .node_active(FORMATION, report(a, ReplicationState::ApplySettings, lsn))
        .await
        .unwrap();

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    if a_node.is_current_state(ReplicationState::ApplySettings) {
        let err = monitor
            .set_candidate_priority(FORMATION, "b", 75)
            .await
            .unwrap_err();
        assert!(matches!(err, StewardError::InvalidState(_)));
    }
}

#[tokio::test]
async fn test_set_candidate_priority_unknown_node() {
    let monitor = monitor_with_formation(&config()).await;

    let err = monitor
        .set_candidate_priority(FORMATION, "ghost", 50)
        .await
        .unwrap_err();
    assert!(matches!(err, StewardError::NodeNotFound(_)));
}

#[tokio::test]
async fn test_replication_quorum_opt_out_is_validated() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x9000;
    converge_trio(&monitor, lsn).await;

    // number_sync_standbys is 1 after the trio converged: opting one of
    // the two sync standbys out would leave only one participating
    let err = monitor
        .set_replication_quorum(FORMATION, "c", false)
        .await
        .unwrap_err();
    assert!(matches!(err, StewardError::InvalidParameter(_)));
}

#[tokio::test]
async fn test_replication_quorum_opt_out_with_zero_sync_standbys() {
    let monitor = monitor_with_formation(&config()).await;
    let lsn = 0x9000;
    converge_pair(&monitor, lsn).await;

    // number_sync_standbys is zero: the trade-off is explicit, opting the
    // only standby out is allowed
    monitor
        .set_replication_quorum(FORMATION, "b", false)
        .await
        .unwrap();

    let b_node = monitor.get_node(FORMATION, "b").unwrap();
    assert!(!b_node.replication_quorum);

    let a_node = monitor.get_node(FORMATION, "a").unwrap();
    assert_eq!(a_node.goal_state, ReplicationState::ApplySettings);
}
