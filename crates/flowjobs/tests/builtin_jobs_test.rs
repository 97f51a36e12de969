use flowcore::{EventBus, ExecutableGraph, FlowDefinition, NodeDefinition, Status};
use flowexec::{FlowRunner, InMemoryExecutorLoader};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn runner(def: &FlowDefinition, dir: &TempDir) -> FlowRunner {
    let graph = ExecutableGraph::from_definition(1, def)
        .unwrap()
        .with_submit_user("tester");
    FlowRunner::new(
        graph,
        Arc::new(flowjobs::default_registry()),
        Arc::new(InMemoryExecutorLoader::new()),
        EventBus::new(100),
    )
    .with_execution_dir(dir.path())
    .with_check_interval(Duration::from_millis(50))
}

async fn run(def: &FlowDefinition, dir: &TempDir) -> ExecutableGraph {
    let runner = runner(def, dir);
    let handle = runner.handle();
    tokio::time::timeout(Duration::from_secs(20), runner.run())
        .await
        .expect("flow did not finish");
    handle.snapshot().await
}

fn node<'a>(graph: &'a ExecutableGraph, nested_id: &str) -> &'a flowcore::ExecutableNode {
    graph.node(graph.find(nested_id).unwrap())
}

#[tokio::test]
async fn command_outputs_drive_conditions() {
    let dir = tempfile::tempdir().unwrap();
    let def = FlowDefinition::new("report")
        .with_node(NodeDefinition::job("prepare", "command").with_prop(
            "command",
            "echo '{\"rows\": 42, \"table\": \"events\"}' > \"$JOB_OUTPUT_PROP_FILE\"",
        ))
        .with_node(
            NodeDefinition::job("publish", "echo")
                .depends_on("prepare")
                .with_condition("${prepare:rows} > '10'")
                .with_prop("message", "publishing")
                .with_prop("output.published", "yes"),
        )
        .with_node(
            NodeDefinition::job("alert", "echo")
                .depends_on("prepare")
                .with_condition("${prepare:rows} == '0'"),
        )
        .with_node(
            NodeDefinition::job("done", "noop")
                .depends_on("publish")
                .depends_on("alert")
                .with_status_condition(flowcore::ConditionOnJobStatus::OneSuccess),
        );

    let graph = run(&def, &dir).await;

    assert_eq!(graph.status(), Status::Succeeded);
    let prepare = node(&graph, "prepare");
    assert_eq!(prepare.output_props().and_then(|p| p.get("rows")), Some("42"));
    assert_eq!(prepare.output_props().and_then(|p| p.get("table")), Some("events"));
    assert_eq!(node(&graph, "publish").status(), Status::Succeeded);
    assert_eq!(
        node(&graph, "publish").output_props().and_then(|p| p.get("published")),
        Some("yes")
    );
    assert_eq!(node(&graph, "alert").status(), Status::Cancelled);
    assert_eq!(node(&graph, "done").status(), Status::Succeeded);
}

#[tokio::test]
async fn commands_run_in_order_inside_the_execution_dir() {
    let dir = tempfile::tempdir().unwrap();
    let def = FlowDefinition::new("f").with_node(
        NodeDefinition::job("write", "command")
            .with_prop("command", "echo \"$GREETING\" > out.txt")
            .with_prop("command.1", "echo second >> out.txt")
            .with_prop("env.GREETING", "hello"),
    );

    let graph = run(&def, &dir).await;

    assert_eq!(graph.status(), Status::Succeeded);
    let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(written, "hello\nsecond\n");

    let log = std::fs::read_to_string(dir.path().join("_job.1.write.log")).unwrap();
    assert!(log.contains("Command: echo second >> out.txt"));
}

#[tokio::test]
async fn failing_command_fails_the_flow() {
    let dir = tempfile::tempdir().unwrap();
    let def = FlowDefinition::new("f")
        .with_node(NodeDefinition::job("broken", "command").with_prop("command", "echo oops >&2; exit 3"))
        .with_node(NodeDefinition::job("after", "noop").depends_on("broken"));

    let graph = run(&def, &dir).await;

    assert_eq!(graph.status(), Status::Failed);
    let broken = node(&graph, "broken");
    assert_eq!(broken.status(), Status::Failed);
    assert!(broken.failure_message().unwrap().contains("exited"));
    assert_eq!(node(&graph, "after").status(), Status::Cancelled);

    let log = std::fs::read_to_string(dir.path().join("_job.1.broken.log")).unwrap();
    assert!(log.contains("WARN oops"));
}

#[tokio::test]
async fn missing_command_is_a_job_failure() {
    let dir = tempfile::tempdir().unwrap();
    let def = FlowDefinition::new("f").with_node(NodeDefinition::job("empty", "command"));

    let graph = run(&def, &dir).await;

    assert_eq!(node(&graph, "empty").status(), Status::Failed);
    assert!(node(&graph, "empty").failure_message().unwrap().contains("command"));
}

#[tokio::test]
async fn fail_job_reports_its_message() {
    let dir = tempfile::tempdir().unwrap();
    let def = FlowDefinition::new("f")
        .with_node(NodeDefinition::job("boom", "fail").with_prop("fail.message", "disk full"));

    let graph = run(&def, &dir).await;

    assert_eq!(graph.status(), Status::Failed);
    assert!(node(&graph, "boom").failure_message().unwrap().contains("disk full"));
}

#[tokio::test]
async fn killing_the_flow_interrupts_long_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let def = FlowDefinition::new("f")
        .with_node(NodeDefinition::job("nap", "sleep").with_prop("sleep.ms", "60000"))
        .with_node(NodeDefinition::job("shell", "command").with_prop("command", "sleep 60"));

    let runner = runner(&def, &dir);
    let handle = runner.handle();
    let join = tokio::spawn(runner.run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let graph = handle.snapshot().await;
        if graph.status_of("nap") == Some(Status::Running) && graph.status_of("shell") == Some(Status::Running) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not start");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.kill("tester").unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), join).await.unwrap().unwrap();
    assert_eq!(status, Status::Killed);
    let graph = handle.snapshot().await;
    assert_eq!(graph.status_of("nap"), Some(Status::Killed));
    assert_eq!(graph.status_of("shell"), Some(Status::Killed));
}
