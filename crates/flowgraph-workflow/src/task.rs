use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use flowgraph_core::TaskState;
use flowgraph_engine::{Graph, Node};

/// A gated node surfaced to an actor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub graph_id: String,
    pub node_id: String,
    pub title: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl Task {
    pub fn new(graph: &Graph, node: &Node, state: TaskState) -> Self {
        Self {
            graph_id: graph.id().to_string(),
            node_id: node.id.clone(),
            title: node.title().to_string(),
            state,
            meta: node.meta.clone(),
        }
    }
}

/// Where an instance stands in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Tasks remain to be decided.
    Running,
    /// An END node was reached.
    Completed,
    /// A node was rejected; traversal goes no further.
    Rejected { node_id: String },
}

impl InstanceStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}
