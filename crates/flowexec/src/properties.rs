//! Property resolution for flows and jobs
//!
//! Root flow inputs: common runtime properties, then the flow's shared props,
//! then submission parameters. Job inputs: the job's shared props, then the
//! parent flow's inputs, then predecessor outputs (in dependency order), then
//! the job's own properties. Later layers win.

use chrono::{DateTime, Datelike, Timelike, Utc};
use flowcore::{ExecutableGraph, NodeId, Props};

pub const FLOW_EXEC_ID: &str = "flow.execid";
pub const FLOW_FLOW_ID: &str = "flow.flowid";
pub const FLOW_PROJECT_ID: &str = "flow.projectid";
pub const FLOW_PROJECT_NAME: &str = "flow.projectname";
pub const FLOW_PROJECT_VERSION: &str = "flow.projectversion";
pub const FLOW_SUBMIT_USER: &str = "flow.submituser";
pub const FLOW_UUID: &str = "flow.uuid";
pub const FLOW_START_TIMESTAMP: &str = "flow.start.timestamp";
pub const FLOW_EXECUTION_LINK: &str = "flow.execution.link";

pub const JOB_ID: &str = "job.id";
pub const JOB_ATTEMPT: &str = "job.attempt";
pub const JOB_EXEC_ID: &str = "job.execid";
pub const JOB_NESTED_PATH: &str = "job.nested.path";
pub const WORKING_DIR: &str = "working.dir";
pub const USER_TO_PROXY: &str = "user.to.proxy";

/// Flow parameter overriding the per-flow job concurrency.
pub const FLOW_NUM_JOB_THREADS: &str = "flow.num.job.threads";

/// Properties every flow execution starts with.
pub fn common_flow_props(graph: &ExecutableGraph, start: DateTime<Utc>, web_url: Option<&str>) -> Props {
    let mut props = Props::new()
        .with(FLOW_EXEC_ID, graph.execution_id.to_string())
        .with(FLOW_FLOW_ID, graph.flow_id.clone())
        .with(FLOW_PROJECT_ID, graph.project_id.to_string())
        .with(FLOW_PROJECT_NAME, graph.project_name.clone())
        .with(FLOW_PROJECT_VERSION, graph.version.to_string())
        .with(FLOW_SUBMIT_USER, graph.submit_user.clone())
        .with(FLOW_UUID, uuid::Uuid::new_v4().to_string())
        .with(FLOW_START_TIMESTAMP, start.to_rfc3339())
        .with("flow.start.year", format!("{:04}", start.year()))
        .with("flow.start.month", format!("{:02}", start.month()))
        .with("flow.start.day", format!("{:02}", start.day()))
        .with("flow.start.hour", format!("{:02}", start.hour()))
        .with("flow.start.minute", format!("{:02}", start.minute()))
        .with("flow.start.second", format!("{:02}", start.second()))
        .with("flow.start.milliseconds", format!("{:03}", start.timestamp_subsec_millis()));

    if let Some(url) = web_url {
        props.put(
            FLOW_EXECUTION_LINK,
            format!("{}/executor?execid={}", url.trim_end_matches('/'), graph.execution_id),
        );
    }
    props
}

/// Inputs of the root flow.
pub fn root_input_props(graph: &ExecutableGraph, common: &Props) -> Props {
    let root = graph.node(graph.root());
    let shared = root
        .props_source
        .as_deref()
        .map(|source| graph.shared_props(source))
        .unwrap_or_default();
    let parameters: Props = graph
        .options
        .flow_parameters
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Props::layered([common, &shared, &parameters])
}

/// Inputs of a job or sub-flow from its position in the graph.
pub fn node_input_props(graph: &ExecutableGraph, id: NodeId) -> Props {
    let node = graph.node(id);
    let shared = node
        .props_source
        .as_deref()
        .map(|source| graph.shared_props(source))
        .unwrap_or_default();
    let parent_inputs = node
        .parent
        .and_then(|parent| graph.node(parent).input_props().cloned())
        .unwrap_or_default();

    let mut props = Props::layered([&shared, &parent_inputs]);
    for pred in &node.in_nodes {
        if let Some(outputs) = graph.node(*pred).output_props() {
            props.extend_from(outputs);
        }
    }
    props.extend_from(&node.props);
    props
}

/// Merge of end-node outputs, later end nodes winning.
pub fn flow_output_props(graph: &ExecutableGraph, flow: NodeId) -> Props {
    Props::layered(
        graph
            .end_nodes(flow)
            .iter()
            .filter_map(|id| graph.node(*id).output_props()),
    )
}
