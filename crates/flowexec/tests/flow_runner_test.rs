mod common;

use common::*;
use flowcore::{
    ConditionOnJobStatus, ExecutableGraph, ExecutionEvent, ExecutionOptions, ExecutorError, ExecutorLoader,
    FailureAction, FlowDefinition, NodeDefinition, Status,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn with_action(graph: flowcore::ExecutableGraph, action: FailureAction) -> flowcore::ExecutableGraph {
    graph
        .with_options(ExecutionOptions::default().with_failure_action(action))
        .unwrap()
}

#[tokio::test]
async fn linear_flow_runs_in_dependency_order() {
    let harness = Harness::new();
    let def = FlowDefinition::new("linear")
        .with_node(job("a"))
        .with_node(job("b").depends_on("a"))
        .with_node(job("c").depends_on("b"));

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(graph.status(), Status::Succeeded);
    for id in ["a", "b", "c"] {
        assert_eq!(status(&graph, id), Status::Succeeded);
    }
    assert_eq!(harness.jobs.runs(1), ["a", "b", "c"]);
    let root = graph.node(graph.root());
    assert!(root.start_time().is_some() && root.end_time().is_some());
}

#[tokio::test]
async fn failure_cancels_downstream_and_fails_the_flow() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(job("a"))
        .with_node(failing_job("b").depends_on("a"))
        .with_node(job("c").depends_on("b"));

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(status(&graph, "a"), Status::Succeeded);
    assert_eq!(status(&graph, "b"), Status::Failed);
    assert_eq!(status(&graph, "c"), Status::Cancelled);
    assert_eq!(graph.status(), Status::Failed);
    assert_eq!(graph.first_failed_job(), Some("b"));
    let b = graph.node(graph.find("b").unwrap());
    assert_eq!(b.failure_message(), Some("Execution failed: b failed on purpose"));
}

#[tokio::test]
async fn retries_until_success() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f").with_node(
        job("flaky")
            .with_prop("test.fail.attempts", "2")
            .with_retry(2, 10),
    );

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(graph.status(), Status::Succeeded);
    let node = graph.node(graph.find("flaky").unwrap());
    assert_eq!(node.status(), Status::Succeeded);
    assert_eq!(node.attempt(), 2);
    assert_eq!(node.past_attempts().len(), 2);
    assert!(node.past_attempts().iter().all(|a| a.status == Status::Failed));
    assert_eq!(harness.jobs.attempts(1, "flaky"), [0, 1, 2]);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f").with_node(failing_job("a").with_retry(1, 0));

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(status(&graph, "a"), Status::Failed);
    assert_eq!(graph.node(graph.find("a").unwrap()).attempt(), 1);
    assert_eq!(graph.status(), Status::Failed);
}

fn parallel_failure() -> FlowDefinition {
    FlowDefinition::new("f")
        .with_node(failing_job("a"))
        .with_node(waiting_job("b"))
        .with_node(job("c").depends_on("b"))
}

#[tokio::test]
async fn finish_currently_running_lets_running_jobs_end() {
    let harness = Harness::new();
    let graph = with_action(graph(1, &parallel_failure()), FailureAction::FinishCurrentlyRunning);
    let (handle, join) = harness.start(harness.runner(graph));

    wait_for_status(&handle, "a", Status::Failed).await;
    wait_for_flow_status(&handle, Status::FailedFinishing).await;
    harness.jobs.release(1, "b", true);

    assert_eq!(finish(join).await, Status::Failed);
    let graph = handle.snapshot().await;
    assert_eq!(status(&graph, "b"), Status::Succeeded);
    assert_eq!(status(&graph, "c"), Status::Cancelled);
}

#[tokio::test]
async fn kill_while_failed_finishing_ends_killed() {
    let harness = Harness::new();
    let graph = with_action(graph(1, &parallel_failure()), FailureAction::FinishCurrentlyRunning);
    let (handle, join) = harness.start(harness.runner(graph));

    wait_for_flow_status(&handle, Status::FailedFinishing).await;
    wait_for_status(&handle, "b", Status::Running).await;
    handle.kill("ops").unwrap();

    assert_eq!(finish(join).await, Status::Killed);
    let graph = handle.snapshot().await;
    assert_eq!(status(&graph, "a"), Status::Failed);
    assert_eq!(status(&graph, "b"), Status::Killed);
    assert_eq!(status(&graph, "c"), Status::Cancelled);
    assert_eq!(graph.first_failed_job(), Some("a"));
}

#[tokio::test]
async fn finish_all_possible_keeps_scheduling_independent_work() {
    let harness = Harness::new();
    let graph = with_action(graph(1, &parallel_failure()), FailureAction::FinishAllPossible);
    let (handle, join) = harness.start(harness.runner(graph));

    wait_for_status(&handle, "a", Status::Failed).await;
    harness.jobs.release(1, "b", true);

    assert_eq!(finish(join).await, Status::Failed);
    let graph = handle.snapshot().await;
    assert_eq!(status(&graph, "b"), Status::Succeeded);
    assert_eq!(status(&graph, "c"), Status::Succeeded);
}

#[tokio::test]
async fn cancel_all_kills_running_jobs() {
    let harness = Harness::new();
    let graph = with_action(graph(1, &parallel_failure()), FailureAction::CancelAll);
    let (handle, join) = harness.start(harness.runner(graph));

    assert_eq!(finish(join).await, Status::Killed);
    let graph = handle.snapshot().await;
    assert_eq!(status(&graph, "a"), Status::Failed);
    assert_eq!(status(&graph, "b"), Status::Killed);
    assert_eq!(status(&graph, "c"), Status::Cancelled);
    assert!(handle.is_killed());
}

#[tokio::test]
async fn disabled_jobs_skip_only_what_depends_solely_on_them() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(job("a").disabled())
        .with_node(job("b").depends_on("a"))
        .with_node(job("d"))
        .with_node(job("c").depends_on("a").depends_on("d"));

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(status(&graph, "a"), Status::Skipped);
    assert_eq!(status(&graph, "b"), Status::Skipped);
    assert_eq!(status(&graph, "d"), Status::Succeeded);
    assert_eq!(status(&graph, "c"), Status::Succeeded);
    assert_eq!(graph.status(), Status::Succeeded);
    assert_eq!(harness.jobs.runs(1), ["d", "c"]);
}

#[tokio::test]
async fn jobs_disabled_at_submission_are_skipped() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(job("a"))
        .with_node(job("b").depends_on("a"));
    let graph = graph(1, &def)
        .with_options(ExecutionOptions::default().with_disabled_job("a"))
        .unwrap();

    let graph = harness.run(graph).await;

    assert_eq!(status(&graph, "a"), Status::Skipped);
    assert_eq!(status(&graph, "b"), Status::Skipped);
    assert_eq!(graph.status(), Status::Succeeded);
    assert!(harness.jobs.runs(1).is_empty());
}

#[tokio::test]
async fn failure_handlers_run_without_failing_the_flow() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(failing_job("a"))
        .with_node(
            job("on_failure")
                .depends_on("a")
                .with_status_condition(ConditionOnJobStatus::AllFailed),
        );

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(status(&graph, "a"), Status::Failed);
    assert_eq!(status(&graph, "on_failure"), Status::Succeeded);
    assert_eq!(graph.status(), Status::Succeeded);
}

#[tokio::test]
async fn one_success_waits_for_all_predecessors() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(failing_job("a"))
        .with_node(job("b").with_prop("test.sleep.ms", "50"))
        .with_node(
            job("c")
                .depends_on("a")
                .depends_on("b")
                .with_status_condition(ConditionOnJobStatus::OneSuccess),
        );

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(status(&graph, "c"), Status::Succeeded);
    assert_eq!(harness.jobs.runs(1).last().map(String::as_str), Some("c"));
    assert_eq!(graph.status(), Status::Succeeded);
}

#[tokio::test]
async fn property_conditions_pick_a_branch() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(job("decide").with_prop("test.output.route", "left"))
        .with_node(job("left").depends_on("decide").with_condition("${decide:route} == 'left'"))
        .with_node(job("right").depends_on("decide").with_condition("${decide:route} == 'right'"))
        .with_node(
            job("join")
                .depends_on("left")
                .depends_on("right")
                .with_status_condition(ConditionOnJobStatus::AllDone),
        );

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(status(&graph, "left"), Status::Succeeded);
    assert_eq!(status(&graph, "right"), Status::Cancelled);
    assert_eq!(status(&graph, "join"), Status::Succeeded);
    assert_eq!(graph.status(), Status::Succeeded);
}

#[tokio::test]
async fn cancelled_end_node_marks_the_flow_killed() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(job("a"))
        .with_node(
            job("only_on_failure")
                .depends_on("a")
                .with_status_condition(ConditionOnJobStatus::OneFailed),
        );

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(status(&graph, "only_on_failure"), Status::Cancelled);
    assert_eq!(graph.status(), Status::Killed);
}

#[tokio::test]
async fn sub_flow_outputs_feed_its_successors() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(NodeDefinition::sub_flow(
            "sub",
            vec![
                job("x"),
                job("y").depends_on("x").with_prop("test.output.table", "events"),
            ],
        ))
        .with_node(job("after").depends_on("sub"));

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(graph.status(), Status::Succeeded);
    assert_eq!(status(&graph, "sub"), Status::Succeeded);
    assert_eq!(status(&graph, "sub:x"), Status::Succeeded);
    assert_eq!(status(&graph, "sub:y"), Status::Succeeded);
    assert_eq!(harness.jobs.runs(1), ["sub:x", "sub:y", "after"]);

    let after = graph.node(graph.find("after").unwrap());
    assert_eq!(after.input_props().and_then(|p| p.get("table")), Some("events"));
}

#[tokio::test]
async fn failure_inside_sub_flow_fails_every_level() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(NodeDefinition::sub_flow("sub", vec![job("x"), failing_job("y").depends_on("x")]))
        .with_node(job("after").depends_on("sub"));

    let graph = harness.run(graph(1, &def)).await;

    assert_eq!(status(&graph, "sub:y"), Status::Failed);
    assert_eq!(status(&graph, "sub"), Status::Failed);
    assert_eq!(status(&graph, "after"), Status::Cancelled);
    assert_eq!(graph.status(), Status::Failed);
    assert_eq!(graph.first_failed_job(), Some("sub:y"));
}

#[tokio::test]
async fn inputs_layer_parameters_and_predecessor_outputs() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(job("a").with_prop("test.output.k", "from-a"))
        .with_node(job("b").depends_on("a").with_prop("own", "b"));
    let graph = graph(1, &def)
        .with_options(ExecutionOptions::default().with_flow_parameter("env", "prod"))
        .unwrap();

    let graph = harness.run(graph).await;

    let b = graph.node(graph.find("b").unwrap());
    let inputs = b.input_props().unwrap();
    assert_eq!(inputs.get("k"), Some("from-a"));
    assert_eq!(inputs.get("env"), Some("prod"));
    assert_eq!(inputs.get("own"), Some("b"));
    assert_eq!(inputs.get("flow.execid"), Some("1"));
    assert_eq!(graph.node(graph.root()).output_props().and_then(|p| p.get("k")), None);
}

#[tokio::test]
async fn job_slots_bound_concurrency() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(job("a").with_prop("test.sleep.ms", "30"))
        .with_node(job("b").with_prop("test.sleep.ms", "30"))
        .with_node(job("c").with_prop("test.sleep.ms", "30"));

    let runner = harness.runner(graph(1, &def)).with_num_job_threads(1);
    let handle = runner.handle();
    assert_eq!(runner.run().await, Status::Succeeded);

    assert_eq!(harness.jobs.max_running(), 1);
    assert_eq!(handle.snapshot().await.status(), Status::Succeeded);
}

#[tokio::test]
async fn pause_holds_new_jobs_until_resume() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(waiting_job("a"))
        .with_node(job("b").depends_on("a"));
    let (handle, join) = harness.start(harness.runner(graph(1, &def)));

    wait_for_status(&handle, "a", Status::Running).await;
    handle.pause("ops").unwrap();
    wait_for_flow_status(&handle, Status::Paused).await;
    // pausing twice is fine
    handle.pause("ops").unwrap();

    harness.jobs.release(1, "a", true);
    wait_for_status(&handle, "a", Status::Succeeded).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(handle.snapshot().await.status_of("b"), Some(Status::Ready));
    assert_eq!(handle.status().await, Status::Paused);

    handle.resume("ops").unwrap();
    assert_eq!(finish(join).await, Status::Succeeded);
    assert_eq!(status(&handle.snapshot().await, "b"), Status::Succeeded);
}

#[tokio::test]
async fn kill_stops_running_jobs_and_cancels_the_rest() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(waiting_job("a"))
        .with_node(job("b").depends_on("a"));
    let (handle, join) = harness.start(harness.runner(graph(1, &def)));

    wait_for_status(&handle, "a", Status::Running).await;
    handle.kill("ops").unwrap();
    handle.kill("ops").unwrap();
    assert!(matches!(handle.pause("ops"), Err(ExecutorError::IllegalState(_))));

    assert_eq!(finish(join).await, Status::Killed);
    let graph = handle.snapshot().await;
    assert_eq!(status(&graph, "a"), Status::Killed);
    assert_eq!(status(&graph, "b"), Status::Cancelled);
    assert!(handle.is_finished());
    assert!(matches!(handle.pause("ops"), Err(ExecutorError::NotRunning(1))));
    assert!(handle.kill("ops").is_ok());
}

#[tokio::test]
async fn retry_failures_reruns_failed_and_cancelled_jobs() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(job("a"))
        .with_node(job("b").depends_on("a").with_prop("test.fail.attempts", "1"))
        .with_node(job("d").depends_on("b"))
        .with_node(waiting_job("c"));
    let (handle, join) = harness.start(harness.runner(graph(1, &def)));

    wait_for_status(&handle, "d", Status::Cancelled).await;
    wait_for_flow_status(&handle, Status::FailedFinishing).await;

    handle.retry_failures("ops").unwrap();
    wait_for_status(&handle, "d", Status::Succeeded).await;
    harness.jobs.release(1, "c", true);

    assert_eq!(finish(join).await, Status::Succeeded);
    let graph = handle.snapshot().await;
    assert_eq!(status(&graph, "b"), Status::Succeeded);
    assert_eq!(graph.node(graph.find("b").unwrap()).attempt(), 1);
    assert_eq!(harness.jobs.attempts(1, "a"), [0]);
    assert_eq!(harness.jobs.attempts(1, "b"), [0, 1]);
    assert_eq!(harness.jobs.attempts(1, "d"), [0]);
    assert_eq!(graph.first_failed_job(), None);
}

#[tokio::test]
async fn retry_failures_without_failures_changes_nothing() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f")
        .with_node(waiting_job("a"))
        .with_node(job("b").depends_on("a"));
    let (handle, join) = harness.start(harness.runner(graph(1, &def)));

    wait_for_status(&handle, "a", Status::Running).await;
    handle.retry_failures("ops").unwrap();
    harness.jobs.release(1, "a", true);

    assert_eq!(finish(join).await, Status::Succeeded);
    assert_eq!(harness.jobs.attempts(1, "a"), [0]);
    assert!(matches!(handle.retry_failures("ops"), Err(ExecutorError::NotRunning(1))));
}

#[tokio::test]
async fn events_bracket_the_execution() {
    let harness = Harness::new();
    let mut events = harness.events.subscribe();
    let def = FlowDefinition::new("f").with_node(job("a"));

    harness.run(graph(1, &def)).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(ExecutionEvent::FlowStarted { execution_id: 1, .. })));
    assert!(matches!(
        seen.last(),
        Some(ExecutionEvent::FlowFinished { status: Status::Succeeded, .. })
    ));
    assert!(seen.iter().any(|e| matches!(
        e,
        ExecutionEvent::JobFinished { nested_id, status: Status::Succeeded, .. } if nested_id == "a"
    )));
}

#[tokio::test]
async fn state_is_persisted_and_logs_uploaded() {
    let harness = Harness::new();
    let def = FlowDefinition::new("f").with_node(job("a"));

    harness.run(graph(1, &def)).await;

    let stored = harness.loader.get(1).await.unwrap();
    assert_eq!(stored.status(), Status::Succeeded);
    assert!(harness.loader.update_count().await >= 2);

    let logs = harness.loader.uploaded_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].nested_id, "a");
    assert!(logs[0].contents.contains("Starting job a"));
}

/// Holds back the first write of a final state until released.
struct SlowFinalWrite {
    inner: Arc<flowexec::InMemoryExecutorLoader>,
    held: AtomicBool,
    reached: Notify,
    release: Notify,
}

#[async_trait::async_trait]
impl ExecutorLoader for SlowFinalWrite {
    async fn fetch_executable_flow(&self, execution_id: u64) -> Result<Option<ExecutableGraph>, ExecutorError> {
        self.inner.fetch_executable_flow(execution_id).await
    }

    async fn update_executable_flow(&self, graph: &ExecutableGraph) -> Result<(), ExecutorError> {
        if graph.status().is_terminal() && !self.held.swap(true, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.update_executable_flow(graph).await
    }

    async fn upload_log_file(
        &self,
        execution_id: u64,
        nested_id: &str,
        attempt: u32,
        path: &Path,
    ) -> Result<(), ExecutorError> {
        self.inner.upload_log_file(execution_id, nested_id, attempt, path).await
    }

    async fn claim_execution(&self, execution_id: u64, executor_id: &str) -> Result<bool, ExecutorError> {
        self.inner.claim_execution(execution_id, executor_id).await
    }
}

#[tokio::test]
async fn finalized_flow_refuses_operator_requests() {
    let harness = Harness::new();
    let loader = Arc::new(SlowFinalWrite {
        inner: harness.loader.clone(),
        held: AtomicBool::new(false),
        reached: Notify::new(),
        release: Notify::new(),
    });
    let def = FlowDefinition::new("f").with_node(failing_job("a"));
    let runner = flowexec::FlowRunner::new(
        graph(1, &def),
        Arc::new(harness.jobs.registry()),
        loader.clone(),
        harness.events.clone(),
    )
    .with_execution_dir(harness.dir.path());
    let (handle, join) = harness.start(runner);

    tokio::time::timeout(Duration::from_secs(5), loader.reached.notified())
        .await
        .unwrap();
    // final state is still being persisted
    assert!(matches!(handle.pause("ops"), Err(ExecutorError::NotRunning(1))));
    assert!(matches!(handle.retry_failures("ops"), Err(ExecutorError::NotRunning(1))));
    assert!(handle.kill("ops").is_ok());

    loader.release.notify_one();
    assert_eq!(finish(join).await, Status::Failed);
    assert_eq!(harness.loader.get(1).await.unwrap().status(), Status::Failed);
}

