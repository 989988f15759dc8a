//! Leadership tests: one leader at a time, failover on crash and graceful
//! stop, and rejection of mutations on followers.


use std::time::Duration;

use test_harness::{assert_eventually, TestCluster};

use colonies_lite::error::ColoniesError;
use colonies_lite::model::{FunctionSpec, Generator, ProcessState, WorkflowSpec};
use colonies_lite::store::ProcessStore;

#[tokio::test]
async fn test_single_leader_elected() {
    let cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader should be elected");

    // Stays stable across several renewals
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cluster.count_leaders().await, 1);
    }

    let leader = cluster.leader().await;
    let members = cluster.nodes.values().next().unwrap().elector.members().await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(leader.is_leader().await);
}

#[tokio::test]
async fn test_follower_rejects_mutations_but_serves_reads() {
    let cluster = TestCluster::new(2).await;
    let leader_name = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let leader = cluster.leader().await;
    let follower = cluster.follower().await.expect("two nodes, one follower");

    let err = follower
        .submit_function_spec(FunctionSpec::new("x", "f", "dev", "cli"))
        .await
        .unwrap_err();
    match err {
        ColoniesError::NotLeader(holder) => assert_eq!(holder.as_deref(), Some(leader_name.as_str())),
        other => panic!("expected NotLeader, got {other:?}"),
    }
    assert!(matches!(
        follower.pause_colony_assignments("dev").await,
        Err(ColoniesError::NotLeader(_))
    ));

    let process = leader
        .submit_function_spec(FunctionSpec::new("x", "f", "dev", "cli"))
        .await
        .unwrap();
    assert_eq!(follower.get_process(process.id).await.unwrap().id, process.id);
}

#[tokio::test]
async fn test_failover_after_leader_crash() {
    let mut cluster = TestCluster::new(2).await;
    let first = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let leader = cluster.leader().await;
    let process = leader
        .submit_function_spec(FunctionSpec::new("x", "f", "dev", "cli"))
        .await
        .unwrap();

    assert!(cluster.crash_node(&first));

    // Lease must expire before the survivor can take over
    let survivor = cluster.nodes.values().next().unwrap().controller.clone();
    assert_eventually(
        || async { survivor.is_leader().await },
        Duration::from_secs(5),
        "surviving node should take over the lease",
    )
    .await;

    // State lives in the shared store, so the new leader sees earlier work
    let seen = survivor.get_process(process.id).await.unwrap();
    assert_eq!(seen.state, ProcessState::Waiting);
    survivor.cancel_process(process.id).await.unwrap();
}

#[tokio::test]
async fn test_graceful_stop_hands_over_quickly() {
    let mut cluster = TestCluster::with_config(2, |config| {
        // A long TTL proves the handover comes from release, not expiry
        config.lease_ttl_ms = 30_000;
    })
    .await;
    let first = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(cluster.stop_node(&first).await);

    let new_leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("follower should acquire the released lease");
    assert_ne!(new_leader, first);
}

#[tokio::test]
async fn test_new_leader_resumes_triggers_from_store() {
    let mut cluster = TestCluster::new(2).await;
    let first = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let leader = cluster.leader().await;
    let workflow =
        WorkflowSpec::new("dev").with_function(FunctionSpec::new("batch", "batch", "dev", "cli"));
    let generator = leader
        .add_generator(Generator::new("ingest", "dev", workflow, 2, -1))
        .await
        .unwrap();
    leader.pack_generator(generator.id, "a").await.unwrap();
    assert!(cluster.stop_node(&first).await);

    let survivor = cluster.leader().await;
    survivor.pack_generator(generator.id, "b").await.unwrap();

    let store = cluster.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.find_graphs("dev", None).await.unwrap().len() == 1 }
        },
        Duration::from_secs(3),
        "new leader should trigger the generator",
    )
    .await;
}

#[tokio::test]
async fn test_coordinator_outage_demotes_leader() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;

    cluster.coordinator.set_available(false);
    assert_eventually(
        || async { !leader.is_leader().await },
        Duration::from_secs(2),
        "renewal failure should demote the leader",
    )
    .await;
    assert!(matches!(
        leader
            .submit_function_spec(FunctionSpec::new("x", "f", "dev", "cli"))
            .await,
        Err(ColoniesError::NotLeader(None))
    ));

    cluster.coordinator.set_available(true);
    assert_eventually(
        || async { leader.is_leader().await },
        Duration::from_secs(2),
        "leader should come back once the coordinator recovers",
    )
    .await;
}

#[tokio::test]
async fn test_store_outage_does_not_stop_loops() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let workflow =
        WorkflowSpec::new("dev").with_function(FunctionSpec::new("batch", "batch", "dev", "cli"));
    let generator = leader
        .add_generator(Generator::new("ingest", "dev", workflow, 1, -1))
        .await
        .unwrap();

    cluster.store.set_available(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    cluster.store.set_available(true);

    leader.pack_generator(generator.id, "a").await.unwrap();
    let store = cluster.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.find_graphs("dev", None).await.unwrap().len() == 1 }
        },
        Duration::from_secs(3),
        "generator loop should recover after the outage",
    )
    .await;
}
