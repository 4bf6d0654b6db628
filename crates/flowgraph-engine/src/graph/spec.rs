use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowgraph_core::error::{FlowError, Result};
use flowgraph_core::NodeType;

use super::link::{sort_links, Link};
use super::node::{Condition, Node, TaskDesc};
use super::Graph;

/// Editable description of a graph.
///
/// This is both the builder used from code and the declarative shape
/// exchanged with loaders:
///
/// ```json
/// { "id": "leave", "title": "Leave request",
///   "layout": [
///     { "id": "s", "type": "start", "link": [{ "nextId": "n1" }] },
///     { "id": "n1", "type": "activity", "meta": { "actor": "manager" },
///       "link": [{ "nextId": "e" }] },
///     { "id": "e", "type": "end" } ] }
/// ```
///
/// A spec taken from a built graph with [`GraphSpec::from_graph`] can be
/// edited and rebuilt: nodes not touched are retained, re-added nodes replace
/// the old node and start with an empty link list. Links are only ever
/// created by explicit calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
    #[serde(default)]
    pub layout: Vec<NodeSpec>,
}

/// One node of a [`GraphSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Language tag for inline task code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, rename = "link", skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkSpec>,
}

/// One outgoing link of a [`NodeSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    pub next_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, alias = "when", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl GraphSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Start an overlay from a built graph.
    pub fn from_graph(graph: &Graph) -> Self {
        graph.to_spec()
    }

    /// Parse the declarative JSON shape.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse the declarative shape written as TOML (`[[layout]]` tables).
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FlowError::GraphDefinition(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn meta_put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Declare a node. Re-declaring an existing id replaces it in place.
    pub fn add_node(&mut self, id: impl Into<String>, node_type: NodeType) -> &mut NodeSpec {
        let spec = NodeSpec::new(id, node_type);
        let idx = match self.layout.iter().position(|n| n.id == spec.id) {
            Some(idx) => {
                self.layout[idx] = spec;
                idx
            }
            None => {
                self.layout.push(spec);
                self.layout.len() - 1
            }
        };
        &mut self.layout[idx]
    }

    pub fn add_start(&mut self, id: impl Into<String>) -> &mut NodeSpec {
        self.add_node(id, NodeType::Start)
    }

    pub fn add_end(&mut self, id: impl Into<String>) -> &mut NodeSpec {
        self.add_node(id, NodeType::End)
    }

    pub fn add_activity(&mut self, id: impl Into<String>) -> &mut NodeSpec {
        self.add_node(id, NodeType::Activity)
    }

    pub fn add_exclusive(&mut self, id: impl Into<String>) -> &mut NodeSpec {
        self.add_node(id, NodeType::Exclusive)
    }

    pub fn add_parallel(&mut self, id: impl Into<String>) -> &mut NodeSpec {
        self.add_node(id, NodeType::Parallel)
    }

    pub fn add_for(&mut self, id: impl Into<String>) -> &mut NodeSpec {
        self.add_node(id, NodeType::For)
    }

    /// Remove a node. Links pointing at it are left for `build` to report.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let before = self.layout.len();
        self.layout.retain(|n| n.id != id);
        self.layout.len() != before
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.layout.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut NodeSpec> {
        self.layout.iter_mut().find(|n| n.id == id)
    }

    /// Validate and freeze into an immutable graph.
    pub fn build(&self) -> Result<Graph> {
        if self.id.trim().is_empty() {
            return Err(FlowError::GraphDefinition("graph id is empty".into()));
        }
        // Task state keys are `{graph}:{node}`; the graph part must split cleanly.
        if self.id.contains(':') {
            return Err(FlowError::GraphDefinition(format!(
                "graph id '{}' must not contain ':'",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for spec in &self.layout {
            if spec.id.trim().is_empty() {
                return Err(FlowError::GraphDefinition(format!(
                    "graph '{}' has a node with an empty id",
                    self.id
                )));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(FlowError::GraphDefinition(format!(
                    "duplicate node id '{}' in graph '{}'",
                    spec.id, self.id
                )));
            }
        }

        let mut nodes = Vec::with_capacity(self.layout.len());
        for spec in &self.layout {
            if spec.node_type == NodeType::End && !spec.links.is_empty() {
                return Err(FlowError::GraphDefinition(format!(
                    "end node '{}' must not have outgoing links",
                    spec.id
                )));
            }
            for link in &spec.links {
                if !seen.contains(link.next_id.as_str()) {
                    return Err(FlowError::GraphDefinition(format!(
                        "link {} -> {} targets an unknown node",
                        spec.id, link.next_id
                    )));
                }
            }
            nodes.push(spec.to_node());
        }

        if !nodes.iter().any(|n| n.node_type == NodeType::Start) {
            return Err(FlowError::GraphDefinition(format!(
                "graph '{}' has no start node",
                self.id
            )));
        }

        Ok(Graph::assemble(
            self.id.clone(),
            self.title.clone(),
            self.meta.clone(),
            nodes,
        ))
    }
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            title: None,
            meta: BTreeMap::new(),
            when: None,
            task: None,
            lang: None,
            links: Vec::new(),
        }
    }

    pub fn title(&mut self, title: impl Into<String>) -> &mut Self {
        self.title = Some(title.into());
        self
    }

    pub fn task(&mut self, task: impl Into<String>) -> &mut Self {
        self.task = Some(task.into());
        self
    }

    pub fn lang(&mut self, lang: impl Into<String>) -> &mut Self {
        self.lang = Some(lang.into());
        self
    }

    pub fn when(&mut self, condition: impl Into<String>) -> &mut Self {
        self.when = Some(condition.into());
        self
    }

    pub fn meta_put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Add a link and return it for further configuration.
    pub fn link_add(&mut self, next_id: impl Into<String>) -> &mut LinkSpec {
        self.links.push(LinkSpec::new(next_id));
        let last = self.links.len() - 1;
        &mut self.links[last]
    }

    /// Add an unconditional link.
    pub fn link_to(&mut self, next_id: impl Into<String>) -> &mut Self {
        self.link_add(next_id);
        self
    }

    /// Add a conditional link.
    pub fn link_when(&mut self, next_id: impl Into<String>, condition: impl Into<String>) -> &mut Self {
        self.link_add(next_id).when(condition);
        self
    }

    /// Remove every link to `next_id`.
    pub fn link_remove(&mut self, next_id: &str) -> &mut Self {
        self.links.retain(|l| l.next_id != next_id);
        self
    }

    fn to_node(&self) -> Node {
        let mut links: Vec<Link> = self.links.iter().map(LinkSpec::to_link).collect();
        sort_links(&mut links);

        Node {
            id: self.id.clone(),
            title: self.title.clone(),
            node_type: self.node_type,
            meta: self.meta.clone(),
            when: self.when.as_deref().and_then(Condition::parse),
            task: self
                .task
                .as_deref()
                .and_then(|t| TaskDesc::parse(t, self.lang.as_deref())),
            links,
        }
    }

    pub(crate) fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            node_type: node.node_type,
            title: node.title.clone(),
            meta: node.meta.clone(),
            when: node.when.as_ref().map(Condition::description),
            task: node.task.as_ref().map(TaskDesc::description),
            lang: node.task.as_ref().and_then(|t| t.lang()).map(str::to_string),
            links: node.links.iter().map(LinkSpec::from_link).collect(),
        }
    }
}

impl LinkSpec {
    pub fn new(next_id: impl Into<String>) -> Self {
        Self {
            next_id: next_id.into(),
            title: None,
            condition: None,
            priority: 0,
            meta: BTreeMap::new(),
        }
    }

    pub fn when(&mut self, condition: impl Into<String>) -> &mut Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn title(&mut self, title: impl Into<String>) -> &mut Self {
        self.title = Some(title.into());
        self
    }

    pub fn priority(&mut self, priority: i32) -> &mut Self {
        self.priority = priority;
        self
    }

    pub fn meta_put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    fn to_link(&self) -> Link {
        Link {
            next_id: self.next_id.clone(),
            title: self.title.clone(),
            condition: self.condition.as_deref().and_then(Condition::parse),
            priority: self.priority,
            meta: self.meta.clone(),
        }
    }

    fn from_link(link: &Link) -> Self {
        Self {
            next_id: link.next_id.clone(),
            title: link.title.clone(),
            condition: link.condition.as_ref().map(Condition::description),
            priority: link.priority,
            meta: link.meta.clone(),
        }
    }
}
