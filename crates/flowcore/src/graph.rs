//! Executable graph of one flow execution
//!
//! All nodes of the root flow and of every nested sub-flow live in one arena
//! owned by [`ExecutableGraph`]. Nodes refer to their parent, children and
//! sibling edges through [`NodeId`]s, so the whole execution state is plain
//! data that can be cloned, persisted and shipped to observers.

use crate::condition::{ConditionOnJobStatus, PropertyCondition};
use crate::definition::{FlowDefinition, NodeDefinition, SharedProps};
use crate::error::{ConditionError, WorkflowError};
use crate::options::ExecutionOptions;
use crate::{ExecutionId, Props, Status};
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Separator between ancestor ids in a nested id, e.g. `sub:inner:job`.
pub const NESTED_ID_SEPARATOR: char = ':';

/// Arena index of a node. Only valid for the graph that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Job {
        job_type: String,
    },
    Flow {
        children: Vec<NodeId>,
        start_nodes: Vec<NodeId>,
        end_nodes: Vec<NodeId>,
    },
}

/// Record of a finished attempt that was reset for retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt: u32,
    pub status: Status,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A job or a sub-flow inside an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableNode {
    pub id: String,
    pub nested_id: String,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
    pub in_nodes: Vec<NodeId>,
    pub out_nodes: Vec<NodeId>,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    /// Job-specific properties from the definition.
    pub props: Props,
    pub props_source: Option<String>,
    pub condition_on_job_status: ConditionOnJobStatus,
    pub condition: Option<PropertyCondition>,

    status: Status,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    update_time: Option<DateTime<Utc>>,
    attempt: u32,
    past_attempts: Vec<Attempt>,
    delayed_execution_ms: u64,
    input_props: Option<Props>,
    output_props: Option<Props>,
    failure_message: Option<String>,
}

impl ExecutableNode {
    fn new(id: String, nested_id: String, parent: Option<NodeId>, kind: NodeKind) -> Self {
        Self {
            id,
            nested_id,
            parent,
            kind,
            in_nodes: Vec::new(),
            out_nodes: Vec::new(),
            retries: 0,
            retry_backoff_ms: 0,
            props: Props::new(),
            props_source: None,
            condition_on_job_status: ConditionOnJobStatus::default(),
            condition: None,
            status: Status::Ready,
            start_time: None,
            end_time: None,
            update_time: None,
            attempt: 0,
            past_attempts: Vec::new(),
            delayed_execution_ms: 0,
            input_props: None,
            output_props: None,
            failure_message: None,
        }
    }

    pub fn is_flow(&self) -> bool {
        matches!(self.kind, NodeKind::Flow { .. })
    }

    pub fn job_type(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Job { job_type } => Some(job_type),
            NodeKind::Flow { .. } => None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Move along the state machine. Returns `false` and leaves the node
    /// untouched when the edge does not exist, which covers every attempt to
    /// overwrite a terminal status.
    pub fn set_status(&mut self, next: Status) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    /// Unconditional status change used by the retry reset operations.
    pub fn reset_status(&mut self, status: Status) {
        self.status = status;
        self.start_time = None;
        self.end_time = None;
        self.touch();
    }

    /// Status change outside the state machine that keeps timestamps. Used to
    /// re-arm a flow for retry and to restore it on resume.
    pub fn force_status(&mut self, status: Status) {
        self.status = status;
        self.touch();
    }

    /// Archive the current attempt and make the node runnable again.
    pub fn reset_for_retry(&mut self) {
        self.past_attempts.push(Attempt {
            attempt: self.attempt,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
        });
        self.attempt += 1;
        self.output_props = None;
        self.failure_message = None;
        self.reset_status(Status::Ready);
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn set_start_time(&mut self, time: DateTime<Utc>) {
        self.start_time = Some(time);
        self.touch();
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn set_end_time(&mut self, time: DateTime<Utc>) {
        self.end_time = Some(time);
        self.touch();
    }

    pub fn clear_end_time(&mut self) {
        self.end_time = None;
        self.touch();
    }

    pub fn update_time(&self) -> Option<DateTime<Utc>> {
        self.update_time
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn past_attempts(&self) -> &[Attempt] {
        &self.past_attempts
    }

    /// Start delay of the next dispatch, set from the retry backoff.
    pub fn delayed_execution_ms(&self) -> u64 {
        self.delayed_execution_ms
    }

    pub fn set_delayed_execution_ms(&mut self, delay_ms: u64) {
        self.delayed_execution_ms = delay_ms;
    }

    pub fn input_props(&self) -> Option<&Props> {
        self.input_props.as_ref()
    }

    pub fn set_input_props(&mut self, props: Props) {
        self.input_props = Some(props);
    }

    pub fn output_props(&self) -> Option<&Props> {
        self.output_props.as_ref()
    }

    pub fn set_output_props(&mut self, props: Props) {
        self.output_props = Some(props);
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.failure_message.as_deref()
    }

    pub fn set_failure_message(&mut self, message: impl Into<String>) {
        self.failure_message = Some(message.into());
    }

    fn touch(&mut self) {
        self.update_time = Some(Utc::now());
    }
}

/// Mutable state of one flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableGraph {
    pub execution_id: ExecutionId,
    pub flow_id: String,
    pub project_id: u32,
    pub project_name: String,
    pub version: u32,
    pub submit_user: String,
    pub proxy_users: BTreeSet<String>,
    pub submit_time: DateTime<Utc>,
    pub options: ExecutionOptions,
    shared_props: BTreeMap<String, SharedProps>,
    nodes: Vec<ExecutableNode>,
    first_failed_job: Option<String>,
}

impl ExecutableGraph {
    /// Build the execution graph for a flow definition.
    ///
    /// Rejects duplicate ids, unknown dependencies, cycles and conditions that
    /// read from jobs other than direct predecessors.
    pub fn from_definition(
        execution_id: ExecutionId,
        definition: &FlowDefinition,
    ) -> Result<Self, WorkflowError> {
        if let Some(source) = &definition.props_source {
            if !definition.shared_props.contains_key(source) {
                return Err(WorkflowError::Invalid(format!(
                    "flow {} uses unknown shared props '{}'",
                    definition.id, source
                )));
            }
        }

        let mut root = ExecutableNode::new(
            definition.id.clone(),
            String::new(),
            None,
            NodeKind::Flow {
                children: Vec::new(),
                start_nodes: Vec::new(),
                end_nodes: Vec::new(),
            },
        );
        root.props_source = definition.props_source.clone();

        let mut graph = Self {
            execution_id,
            flow_id: definition.id.clone(),
            project_id: 0,
            project_name: String::new(),
            version: 0,
            submit_user: String::new(),
            proxy_users: BTreeSet::new(),
            submit_time: Utc::now(),
            options: ExecutionOptions::default(),
            shared_props: definition.shared_props.clone(),
            nodes: vec![root],
            first_failed_job: None,
        };
        graph.add_children(NodeId::ROOT, &definition.nodes)?;
        Ok(graph)
    }

    pub fn with_project(mut self, project_id: u32, name: impl Into<String>, version: u32) -> Self {
        self.project_id = project_id;
        self.project_name = name.into();
        self.version = version;
        self
    }

    pub fn with_submit_user(mut self, user: impl Into<String>) -> Self {
        self.submit_user = user.into();
        self
    }

    pub fn with_proxy_user(mut self, user: impl Into<String>) -> Self {
        self.proxy_users.insert(user.into());
        self
    }

    /// Attach submission options; jobs listed as disabled are marked DISABLED.
    pub fn with_options(mut self, options: ExecutionOptions) -> Result<Self, WorkflowError> {
        for nested_id in &options.disabled_jobs {
            let id = self
                .find(nested_id)
                .ok_or_else(|| WorkflowError::NodeNotFound(nested_id.clone()))?;
            self.node_mut(id).reset_status(Status::Disabled);
        }
        self.options = options;
        Ok(self)
    }

    fn add_children(&mut self, flow: NodeId, defs: &[NodeDefinition]) -> Result<(), WorkflowError> {
        let parent_nested = self.node(flow).nested_id.clone();
        let mut by_name: HashMap<&str, NodeId> = HashMap::new();
        let mut children = Vec::with_capacity(defs.len());

        for def in defs {
            let nested_id = if parent_nested.is_empty() {
                def.id.clone()
            } else {
                format!("{}{}{}", parent_nested, NESTED_ID_SEPARATOR, def.id)
            };
            if def.id.is_empty() || def.id.contains(NESTED_ID_SEPARATOR) {
                return Err(WorkflowError::Invalid(format!("illegal node id '{}'", nested_id)));
            }
            if by_name.contains_key(def.id.as_str()) {
                return Err(WorkflowError::DuplicateNode(nested_id));
            }
            if let Some(source) = &def.props_source {
                if !self.shared_props.contains_key(source) {
                    return Err(WorkflowError::Invalid(format!(
                        "{} uses unknown shared props '{}'",
                        nested_id, source
                    )));
                }
            }

            let kind = if def.is_flow() {
                NodeKind::Flow {
                    children: Vec::new(),
                    start_nodes: Vec::new(),
                    end_nodes: Vec::new(),
                }
            } else {
                NodeKind::Job {
                    job_type: def.node_type.clone(),
                }
            };

            let mut node = ExecutableNode::new(def.id.clone(), nested_id, Some(flow), kind);
            node.retries = def.retries;
            node.retry_backoff_ms = def.retry_backoff_ms;
            node.props = def.props.clone();
            node.props_source = def.props_source.clone();
            node.condition_on_job_status = def.condition_on_job_status;
            if def.disabled {
                node.status = Status::Disabled;
            }

            let id = NodeId(self.nodes.len());
            self.nodes.push(node);
            by_name.insert(def.id.as_str(), id);
            children.push(id);
        }

        let mut dag = DiGraph::<NodeId, ()>::new();
        let indices: HashMap<NodeId, _> = children.iter().map(|id| (*id, dag.add_node(*id))).collect();

        for (def, id) in defs.iter().zip(&children) {
            for dep in &def.dependencies {
                let from = *by_name.get(dep.as_str()).ok_or_else(|| {
                    WorkflowError::NodeNotFound(format!(
                        "{} (dependency of {})",
                        dep,
                        self.node(*id).nested_id
                    ))
                })?;
                if self.nodes[from.0].out_nodes.contains(id) {
                    continue;
                }
                self.nodes[from.0].out_nodes.push(*id);
                self.nodes[id.0].in_nodes.push(from);
                dag.add_edge(indices[&from], indices[id], ());
            }
        }

        if toposort(&dag, None).is_err() {
            let name = if parent_nested.is_empty() {
                self.flow_id.clone()
            } else {
                parent_nested
            };
            return Err(WorkflowError::CyclicDependency(name));
        }

        for (def, id) in defs.iter().zip(&children) {
            if let Some(expression) = &def.condition {
                let node_name = self.node(*id).nested_id.clone();
                let condition = PropertyCondition::parse(expression).map_err(|source| {
                    WorkflowError::Condition {
                        node: node_name.clone(),
                        source,
                    }
                })?;
                let predecessors: HashSet<&str> = self.nodes[id.0]
                    .in_nodes
                    .iter()
                    .map(|p| self.nodes[p.0].id.as_str())
                    .collect();
                if let Some(unknown) = condition.referenced_jobs().find(|j| !predecessors.contains(j)) {
                    return Err(WorkflowError::Condition {
                        node: node_name,
                        source: ConditionError::UnknownPredecessor(unknown.to_string()),
                    });
                }
                self.nodes[id.0].condition = Some(condition);
            }
        }

        let start_nodes: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|id| self.nodes[id.0].in_nodes.is_empty())
            .collect();
        let end_nodes: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|id| self.nodes[id.0].out_nodes.is_empty())
            .collect();

        if let NodeKind::Flow {
            children: c,
            start_nodes: s,
            end_nodes: e,
        } = &mut self.nodes[flow.0].kind
        {
            *c = children.clone();
            *s = start_nodes;
            *e = end_nodes;
        }

        for (def, id) in defs.iter().zip(&children) {
            if def.is_flow() {
                self.add_children(*id, &def.nodes)?;
            }
        }
        Ok(())
    }

    /// Check the structure of a graph that did not come from
    /// [`ExecutableGraph::from_definition`], e.g. one read back from storage.
    ///
    /// Every node id must point into the arena, parent and child links must
    /// agree, edges must be mirrored and stay inside one flow, and no flow
    /// may contain a cycle.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = |message: String| Err(WorkflowError::Invalid(format!("{}: {}", self.flow_id, message)));
        let len = self.nodes.len();
        let in_bounds = move |id: NodeId| id.0 < len;

        let Some(root) = self.nodes.first() else {
            return invalid("graph has no root".to_string());
        };
        if root.parent.is_some() || !root.is_flow() {
            return invalid("root must be a flow without parent".to_string());
        }

        for (index, node) in self.nodes.iter().enumerate() {
            let id = NodeId(index);
            if index > 0 {
                let Some(parent) = node.parent.filter(|p| in_bounds(*p)) else {
                    return invalid(format!("{} has no valid parent", node.nested_id));
                };
                if !self.children(parent).contains(&id) {
                    return invalid(format!("{} is not a child of its parent", node.nested_id));
                }
            }
            for other in node.in_nodes.iter().chain(&node.out_nodes).copied() {
                if !in_bounds(other) {
                    return invalid(format!("{} links to unknown node {}", node.nested_id, other.0));
                }
                if index == 0 || self.nodes[other.0].parent != node.parent {
                    return invalid(format!("{} links across flows", node.nested_id));
                }
            }
            if node.in_nodes.iter().any(|p| !self.nodes[p.0].out_nodes.contains(&id))
                || node.out_nodes.iter().any(|s| !self.nodes[s.0].in_nodes.contains(&id))
            {
                return invalid(format!("{} has unmatched edges", node.nested_id));
            }

            if let NodeKind::Flow {
                children,
                start_nodes,
                end_nodes,
            } = &node.kind
            {
                if let Some(bad) = children
                    .iter()
                    .copied()
                    .find(|c| !in_bounds(*c) || self.nodes[c.0].parent != Some(id))
                {
                    return invalid(format!("{} lists foreign child {}", node.nested_id, bad.0));
                }
                if start_nodes.iter().chain(end_nodes).any(|b| !children.contains(b)) {
                    return invalid(format!("{} has boundary nodes outside its children", node.nested_id));
                }
            }
        }

        // links are known to be sound here, so every successor is a sibling
        for (index, node) in self.nodes.iter().enumerate() {
            let NodeKind::Flow { children, .. } = &node.kind else {
                continue;
            };
            let mut dag = DiGraph::<NodeId, ()>::new();
            let indices: HashMap<NodeId, _> = children.iter().map(|c| (*c, dag.add_node(*c))).collect();
            for child in children {
                for succ in &self.nodes[child.0].out_nodes {
                    dag.add_edge(indices[child], indices[succ], ());
                }
            }
            if toposort(&dag, None).is_err() {
                let name = if index == 0 {
                    self.flow_id.clone()
                } else {
                    node.nested_id.clone()
                };
                return Err(WorkflowError::CyclicDependency(name));
            }
        }
        Ok(())
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn status(&self) -> Status {
        self.nodes[0].status
    }

    pub fn node(&self, id: NodeId) -> &ExecutableNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ExecutableNode {
        &mut self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&ExecutableNode> {
        self.nodes.get(id.0)
    }

    /// Every node including the root, in arena order (parents before children).
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ExecutableNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn is_flow(&self, id: NodeId) -> bool {
        self.nodes[id.0].is_flow()
    }

    pub fn children(&self, flow: NodeId) -> &[NodeId] {
        match &self.nodes[flow.0].kind {
            NodeKind::Flow { children, .. } => children,
            NodeKind::Job { .. } => &[],
        }
    }

    pub fn start_nodes(&self, flow: NodeId) -> &[NodeId] {
        match &self.nodes[flow.0].kind {
            NodeKind::Flow { start_nodes, .. } => start_nodes,
            NodeKind::Job { .. } => &[],
        }
    }

    pub fn end_nodes(&self, flow: NodeId) -> &[NodeId] {
        match &self.nodes[flow.0].kind {
            NodeKind::Flow { end_nodes, .. } => end_nodes,
            NodeKind::Job { .. } => &[],
        }
    }

    pub fn child_by_name(&self, flow: NodeId, name: &str) -> Option<NodeId> {
        self.children(flow)
            .iter()
            .copied()
            .find(|id| self.nodes[id.0].id == name)
    }

    /// Resolve a nested id such as `sub:job` starting from the root.
    pub fn find(&self, nested_id: &str) -> Option<NodeId> {
        nested_id
            .split(NESTED_ID_SEPARATOR)
            .try_fold(NodeId::ROOT, |flow, name| self.child_by_name(flow, name))
            .filter(|id| *id != NodeId::ROOT)
    }

    /// Status of a node addressed by nested id.
    pub fn status_of(&self, nested_id: &str) -> Option<Status> {
        self.find(nested_id).map(|id| self.nodes[id.0].status)
    }

    /// Nested id to status for every non-root node.
    pub fn statuses(&self) -> HashMap<String, Status> {
        self.nodes
            .iter()
            .skip(1)
            .map(|n| (n.nested_id.clone(), n.status))
            .collect()
    }

    /// Whether `id` or any node nested below it matches `predicate`.
    pub fn any_below(&self, id: NodeId, predicate: &dyn Fn(&ExecutableNode) -> bool) -> bool {
        if predicate(self.node(id)) {
            return true;
        }
        self.children(id).iter().any(|child| self.any_below(*child, predicate))
    }

    /// Resolve a shared property set, applying its `inherits` chain so the
    /// named set wins over its ancestors.
    pub fn shared_props(&self, name: &str) -> Props {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name);
        while let Some(source) = current {
            if !seen.insert(source) {
                tracing::warn!("Shared props '{}' inherit cyclically; stopping at '{}'", name, source);
                break;
            }
            match self.shared_props.get(source) {
                Some(shared) => {
                    chain.push(&shared.props);
                    current = shared.inherits.as_deref();
                }
                None => break,
            }
        }
        Props::layered(chain.into_iter().rev())
    }

    pub fn first_failed_job(&self) -> Option<&str> {
        self.first_failed_job.as_deref()
    }

    /// Only the first failure is kept.
    pub fn record_failed_job(&mut self, nested_id: &str) {
        if self.first_failed_job.is_none() {
            self.first_failed_job = Some(nested_id.to_string());
        }
    }

    pub fn clear_failed_job(&mut self) {
        self.first_failed_job = None;
    }
}
