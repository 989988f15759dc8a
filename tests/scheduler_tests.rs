//! End-to-end scheduling tests through the controller of an elected leader.


use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;
use test_harness::{assert_eventually, TestCluster};
use uuid::Uuid;

use colonies_lite::error::ColoniesError;
use colonies_lite::model::{Attribute, AttributeKind, FunctionSpec, ProcessState, WorkflowSpec};
use colonies_lite::scheduler::Assignment;
use colonies_lite::store::{ProcessQuery, ProcessStore};

const NO_WAIT: Duration = Duration::ZERO;

fn diamond() -> WorkflowSpec {
    WorkflowSpec::new("dev")
        .with_function(FunctionSpec::new("a", "gen", "dev", "cli"))
        .with_function(FunctionSpec::new("b", "left", "dev", "cli").with_dependencies(["a"]))
        .with_function(FunctionSpec::new("c", "right", "dev", "cli").with_dependencies(["a"]))
        .with_function(FunctionSpec::new("d", "join", "dev", "cli").with_dependencies(["b", "c"]))
}

fn assigned(assignment: Assignment) -> colonies_lite::model::Process {
    assignment
        .into_process()
        .expect("a process should have been assigned")
}

#[tokio::test]
async fn test_diamond_workflow_runs_in_dependency_order() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;

    let graph = leader.submit_workflow_spec(diamond()).await.unwrap();
    assert_eq!(graph.process_ids.len(), 4);
    assert_eq!(graph.roots.len(), 1);

    let a = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    assert_eq!(a.spec.node_name, "a");
    // b and c wait for a
    assert!(leader
        .assign(executor.id, "dev", 0, 0, NO_WAIT)
        .await
        .unwrap()
        .process()
        .is_none());
    leader
        .close_successful(a.id, executor.id, Some(vec![json!("from-a")]))
        .await
        .unwrap();

    let b = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    assert_eq!(b.spec.node_name, "b");
    assert_eq!(b.input, vec![json!("from-a")]);
    leader
        .close_successful(b.id, executor.id, Some(vec![json!("from-b")]))
        .await
        .unwrap();

    let c = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    assert_eq!(c.spec.node_name, "c");
    leader
        .close_successful(c.id, executor.id, Some(vec![json!("from-c")]))
        .await
        .unwrap();

    let d = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    assert_eq!(d.spec.node_name, "d");
    assert_eq!(d.input, vec![json!("from-b"), json!("from-c")]);
    leader.close_successful(d.id, executor.id, None).await.unwrap();

    let view = leader.get_process_graph(graph.id).await.unwrap();
    assert_eq!(view.state, ProcessState::Success);
    assert_eq!(view.counts.success, 4);

    let stats = leader.get_colony_statistics("dev").await.unwrap();
    assert_eq!(stats.processes.success, 4);
    assert_eq!(stats.graphs.success, 1);
    assert_eq!(stats.executors, 1);
}

#[tokio::test]
async fn test_failure_reaches_descendants_only() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;
    let graph = leader.submit_workflow_spec(diamond()).await.unwrap();

    let a = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    leader.close_successful(a.id, executor.id, None).await.unwrap();
    let b = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    let c = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());

    leader
        .close_failed(b.id, executor.id, vec!["boom".to_string()])
        .await
        .unwrap();

    // c keeps running while d is failed through b
    assert_eq!(leader.get_process(c.id).await.unwrap().state, ProcessState::Running);
    let members = cluster.store.graph_members(&graph.id).await.unwrap();
    let d = members.iter().find(|p| p.spec.node_name == "d").unwrap();
    assert_eq!(d.state, ProcessState::Failed);

    let view = leader.get_process_graph(graph.id).await.unwrap();
    assert_eq!(view.state, ProcessState::Failed);
    leader.close_successful(c.id, executor.id, None).await.unwrap();
}

#[tokio::test]
async fn test_state_order_enforced() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;

    let process = leader
        .submit_function_spec(FunctionSpec::new("solo", "work", "dev", "cli"))
        .await
        .unwrap();
    assert_eq!(process.state, ProcessState::Waiting);
    assert!(leader.close_successful(process.id, executor.id, None).await.is_err());

    let running = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    assert_eq!(running.id, process.id);
    assert!(leader
        .close_successful(process.id, Uuid::new_v4(), None)
        .await
        .is_err());

    let done = leader.close_successful(process.id, executor.id, None).await.unwrap();
    assert_eq!(done.state, ProcessState::Success);
    assert!(done.started_at.is_some() && done.ended_at.is_some());
    assert!(leader
        .close_failed(process.id, executor.id, vec![])
        .await
        .is_err());
}

#[tokio::test]
async fn test_concurrent_assign_hands_out_each_process_once() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    for i in 0..30 {
        leader
            .submit_function_spec(
                FunctionSpec::new("job", "work", "dev", "cli").with_args(vec![json!(i)]),
            )
            .await
            .unwrap();
    }

    let mut executors = Vec::new();
    for _ in 0..6 {
        executors.push(cluster.approved_executor("dev", "cli").await);
    }

    let mut handles = Vec::new();
    for executor in executors {
        let controller = leader.clone();
        handles.push(tokio::spawn(async move {
            let mut won = Vec::new();
            while let Assignment::Assigned(p) = controller
                .assign(executor.id, "dev", 0, 0, NO_WAIT)
                .await
                .unwrap()
            {
                won.push(p.id);
            }
            won
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);
}

#[tokio::test]
async fn test_pause_blocks_assignment_until_resume() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;
    leader
        .submit_function_spec(FunctionSpec::new("solo", "work", "dev", "cli"))
        .await
        .unwrap();

    assert!(leader.pause_colony_assignments("dev").await.unwrap());
    assert!(leader.get_pause_status("dev").await);
    assert!(leader
        .assign(executor.id, "dev", 0, 0, NO_WAIT)
        .await
        .unwrap()
        .process()
        .is_none());

    let poller = leader.clone();
    let waiting = tokio::spawn(async move {
        poller
            .assign(executor.id, "dev", 0, 0, Duration::from_secs(5))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());

    assert!(leader.resume_colony_assignments("dev").await.unwrap());
    let assignment = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("long poll should wake on resume")
        .unwrap()
        .unwrap();
    assert!(assignment.process().is_some());
    assert!(!leader.get_pause_status("dev").await);
}

#[tokio::test]
async fn test_long_poll_wakes_on_submission() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;

    let poller = leader.clone();
    let waiting = tokio::spawn(async move {
        poller
            .assign(executor.id, "dev", 0, 0, Duration::from_secs(5))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let submitted = leader
        .submit_function_spec(FunctionSpec::new("late", "work", "dev", "cli"))
        .await
        .unwrap();
    let assignment = waiting.await.unwrap().unwrap();
    assert_eq!(assignment.process().map(|p| p.id), Some(submitted.id));
}

#[tokio::test]
async fn test_long_poll_times_out_with_no_match() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;

    let started = tokio::time::Instant::now();
    let assignment = leader
        .assign(executor.id, "dev", 0, 0, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(assignment.process().is_none());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_targeted_process_skips_other_executors() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let chosen = cluster.approved_executor("dev", "cli").await;
    let other = cluster.approved_executor("dev", "cli").await;

    leader
        .submit_function_spec(
            FunctionSpec::new("pinned", "work", "dev", "cli").with_executor_ids(vec![chosen.id]),
        )
        .await
        .unwrap();

    assert!(leader
        .assign(other.id, "dev", 0, 0, NO_WAIT)
        .await
        .unwrap()
        .process()
        .is_none());
    assert!(leader
        .assign(chosen.id, "dev", 0, 0, NO_WAIT)
        .await
        .unwrap()
        .process()
        .is_some());
}

#[tokio::test]
async fn test_unapproved_executor_rejected() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = leader
        .add_executor(colonies_lite::model::Executor::new("w", "dev", "cli"))
        .await
        .unwrap();
    assert!(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.is_err());

    leader.reject_executor(executor.id).await.unwrap();
    assert!(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.is_err());
}

#[tokio::test]
async fn test_wait_for_process_returns_on_completion() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;
    let process = leader
        .submit_function_spec(FunctionSpec::new("solo", "work", "dev", "cli"))
        .await
        .unwrap();

    let waiter = leader.clone();
    let waiting = tokio::spawn(async move {
        waiter
            .wait_for_process(process.id, ProcessState::Success, Duration::from_secs(5))
            .await
    });

    assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    leader
        .close_successful(process.id, executor.id, Some(vec![json!(7)]))
        .await
        .unwrap();

    let done = waiting.await.unwrap().unwrap();
    assert_eq!(done.state, ProcessState::Success);
    assert_eq!(done.output, vec![json!(7)]);
}

#[tokio::test]
async fn test_add_child_runs_after_parent() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;
    let graph = leader
        .submit_workflow_spec(
            WorkflowSpec::new("dev").with_function(FunctionSpec::new("map", "map", "dev", "cli")),
        )
        .await
        .unwrap();

    let parent = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    let child = leader
        .add_child(
            graph.id,
            parent.id,
            executor.id,
            FunctionSpec::new("reduce", "reduce", "dev", "cli"),
            false,
        )
        .await
        .unwrap();
    assert!(child.wait_for_parents);
    assert!(leader
        .assign(executor.id, "dev", 0, 0, NO_WAIT)
        .await
        .unwrap()
        .process()
        .is_none());

    leader.close_successful(parent.id, executor.id, None).await.unwrap();
    let next = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    assert_eq!(next.id, child.id);
}

#[tokio::test]
async fn test_cancel_graph_fails_open_members() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let graph = leader.submit_workflow_spec(diamond()).await.unwrap();

    let view = leader.cancel_process_graph(graph.id).await.unwrap();
    assert_eq!(view.state, ProcessState::Failed);
    assert_eq!(view.counts.failed, 4);

    assert_eq!(leader.remove_all_process_graphs("dev", None).await.unwrap(), 1);
    assert!(leader.get_process_graph(graph.id).await.is_err());
}

#[tokio::test]
async fn test_exec_deadline_fails_process_without_retries() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;
    let process = leader
        .submit_function_spec(
            FunctionSpec::new("slow", "work", "dev", "cli")
                .with_max_exec_time(1)
                .with_max_retries(0),
        )
        .await
        .unwrap();
    assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());

    assert_eventually(
        || async {
            leader
                .get_process(process.id)
                .await
                .map(|p| p.state == ProcessState::Failed)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "deadline sweep should fail the overdue process",
    )
    .await;
}

#[tokio::test]
async fn test_retention_loop_keeps_policy_minimum() {
    let cluster = TestCluster::with_config(1, |config| {
        config.scheduler = config.scheduler.clone().with_retention(2, 0);
    })
    .await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;

    for _ in 0..5 {
        let p = leader
            .submit_function_spec(FunctionSpec::new("solo", "work", "dev", "cli"))
            .await
            .unwrap();
        assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
        leader.close_successful(p.id, executor.id, None).await.unwrap();
    }

    let store = cluster.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move {
                store
                    .find_processes(&ProcessQuery::colony("dev"))
                    .await
                    .map(|p| p.len() == 2)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "retention should trim to the two most recent processes",
    )
    .await;
}

#[tokio::test]
async fn test_attributes_only_from_running_owner() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;
    let executor = cluster.approved_executor("dev", "cli").await;
    let other = cluster.approved_executor("dev", "cli").await;

    let process = leader
        .submit_function_spec(FunctionSpec::new("solo", "work", "dev", "cli"))
        .await
        .unwrap();
    // Not running yet
    assert!(matches!(
        leader
            .add_attribute(Attribute::new(process.id, AttributeKind::Out, "result", "early"), executor.id)
            .await,
        Err(ColoniesError::IllegalTransition(_))
    ));

    let running = assigned(leader.assign(executor.id, "dev", 0, 0, NO_WAIT).await.unwrap());
    assert!(leader
        .add_attribute(Attribute::new(running.id, AttributeKind::Out, "result", "stolen"), other.id)
        .await
        .is_err());

    let first = leader
        .add_attribute(Attribute::new(running.id, AttributeKind::Out, "result", "1"), executor.id)
        .await
        .unwrap();
    assert_eq!(first.colony_name, "dev");
    let second = leader
        .add_attribute(Attribute::new(running.id, AttributeKind::Out, "result", "2"), executor.id)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(leader.get_attribute(first.id).await.unwrap().value, "2");
    assert_eq!(leader.get_process_attributes(running.id).await.unwrap().len(), 1);

    leader.close_successful(running.id, executor.id, None).await.unwrap();
    assert!(leader
        .add_attribute(Attribute::new(running.id, AttributeKind::Env, "late", "x"), executor.id)
        .await
        .is_err());
    assert!(matches!(
        leader.get_attribute(Uuid::new_v4()).await,
        Err(ColoniesError::AttributeNotFound(_))
    ));
}

#[tokio::test]
async fn test_oversized_time_limits_rejected_and_queue_keeps_serving() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.leader().await;

    assert!(matches!(
        leader
            .submit_function_spec(FunctionSpec::new("solo", "work", "dev", "cli").with_max_wait_time(i64::MAX))
            .await,
        Err(ColoniesError::InvalidWorkflow(_))
    ));
    let workflow = WorkflowSpec::new("dev")
        .with_function(FunctionSpec::new("a", "work", "dev", "cli").with_max_exec_time(i64::MAX));
    assert!(matches!(
        leader.submit_workflow_spec(workflow).await,
        Err(ColoniesError::InvalidWorkflow(_))
    ));

    // The worker is still alive and the oversized submissions left nothing behind
    let process = leader
        .submit_function_spec(FunctionSpec::new("solo", "work", "dev", "cli"))
        .await
        .unwrap();
    let stored = cluster
        .store
        .find_processes(&ProcessQuery::colony("dev"))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, process.id);
}
