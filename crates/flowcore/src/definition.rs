//! Serializable flow definitions
//!
//! This is the build-time shape of a flow, before it is turned into an
//! [`ExecutableGraph`](crate::ExecutableGraph) for one execution.

use crate::{ConditionOnJobStatus, Props};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node type that marks an embedded sub-flow.
pub const FLOW_NODE_TYPE: &str = "flow";

/// A named property set shared by several jobs, optionally inheriting from another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedProps {
    pub inherits: Option<String>,
    pub props: Props,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,

    /// Shared property set applied to the flow's own inputs.
    #[serde(default)]
    pub props_source: Option<String>,

    #[serde(default)]
    pub shared_props: BTreeMap<String, SharedProps>,

    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub props: Props,

    #[serde(default)]
    pub props_source: Option<String>,

    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub condition_on_job_status: ConditionOnJobStatus,

    /// Property predicate, e.g. `${jobA:key} == 'value'`.
    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub disabled: bool,

    /// Children when `node_type` is `"flow"`.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            props_source: None,
            shared_props: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_shared_props(mut self, name: impl Into<String>, shared: SharedProps) -> Self {
        self.shared_props.insert(name.into(), shared);
        self
    }

    pub fn with_props_source(mut self, name: impl Into<String>) -> Self {
        self.props_source = Some(name.into());
        self
    }
}

impl NodeDefinition {
    pub fn job(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: job_type.into(),
            dependencies: Vec::new(),
            props: Props::new(),
            props_source: None,
            retries: 0,
            retry_backoff_ms: 0,
            condition_on_job_status: ConditionOnJobStatus::default(),
            condition: None,
            disabled: false,
            nodes: Vec::new(),
        }
    }

    pub fn sub_flow(id: impl Into<String>, nodes: Vec<NodeDefinition>) -> Self {
        Self {
            nodes,
            ..Self::job(id, FLOW_NODE_TYPE)
        }
    }

    pub fn is_flow(&self) -> bool {
        self.node_type == FLOW_NODE_TYPE
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.put(key, value);
        self
    }

    pub fn with_props_source(mut self, name: impl Into<String>) -> Self {
        self.props_source = Some(name.into());
        self
    }

    pub fn with_retry(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.retries = retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_status_condition(mut self, condition: ConditionOnJobStatus) -> Self {
        self.condition_on_job_status = condition;
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}
