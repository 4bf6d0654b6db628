//! Graph model: immutable definitions of nodes and links.
//!
//! A graph is described with a [`GraphSpec`] (from code or from the
//! declarative JSON/TOML shape) and frozen with [`GraphSpec::build`]. The
//! built [`Graph`] is never mutated again and is shared read-only, usually
//! behind an `Arc`, by every execution that walks it.

pub mod link;
pub mod node;
pub mod spec;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde_json::Value;

use flowgraph_core::error::{FlowError, Result};
use flowgraph_core::NodeType;

pub use link::Link;
pub use node::{Condition, Node, TaskDesc};
pub use spec::{GraphSpec, LinkSpec, NodeSpec};

/// An immutable, validated graph.
#[derive(Debug, Clone)]
pub struct Graph {
    id: String,
    title: Option<String>,
    meta: BTreeMap<String, Value>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    /// For each node, the ids of the nodes linking into it (one entry per link).
    incoming: HashMap<String, Vec<String>>,
    /// Opening FOR node id -> id of the FOR node that closes it.
    loop_ends: HashMap<String, String>,
}

impl Graph {
    pub(crate) fn assemble(
        id: String,
        title: Option<String>,
        meta: BTreeMap<String, Value>,
        nodes: Vec<Node>,
    ) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        for node in &nodes {
            for link in &node.links {
                incoming
                    .entry(link.next_id.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }

        let mut graph = Self {
            id,
            title,
            meta,
            nodes,
            index,
            incoming,
            loop_ends: HashMap::new(),
        };
        graph.loop_ends = graph
            .nodes
            .iter()
            .filter(|n| n.is_loop_start())
            .filter_map(|n| graph.find_loop_end(&n.id).map(|end| (n.id.clone(), end)))
            .collect();
        graph
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn meta(&self) -> &BTreeMap<String, Value> {
        &self.meta
    }

    /// Look up graph metadata by a dotted path (`scripts.notify`).
    pub fn meta_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.meta.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_or_err(&self, id: &str) -> Result<&Node> {
        self.node(id).ok_or_else(|| FlowError::NodeNotFound {
            graph: self.id.clone(),
            node: id.to_string(),
        })
    }

    /// The first declared START node.
    pub fn start(&self) -> Option<&Node> {
        self.starts().next()
    }

    /// All START nodes in declaration order.
    pub fn starts(&self) -> impl DoubleEndedIterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.node_type == NodeType::Start)
    }

    /// Ids of the nodes linking into `id`, one entry per link.
    pub fn incoming(&self, id: &str) -> &[String] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The FOR node closing the loop opened at `start_id`.
    pub fn loop_end(&self, start_id: &str) -> Option<&Node> {
        self.loop_ends.get(start_id).and_then(|id| self.node(id))
    }

    /// Every node reachable from `id` by following links (excluding `id`
    /// itself unless it sits on a cycle).
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self
            .node(id)
            .map(|n| n.next_ids().collect())
            .unwrap_or_default();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.to_string()) {
                continue;
            }
            if let Some(node) = self.node(next) {
                queue.extend(node.next_ids());
            }
        }
        seen
    }

    /// Every node from which `id` can be reached (excluding `id` itself
    /// unless it sits on a cycle).
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self.incoming(id).iter().map(String::as_str).collect();

        while let Some(prev) = queue.pop_front() {
            if !seen.insert(prev.to_string()) {
                continue;
            }
            queue.extend(self.incoming(prev).iter().map(String::as_str));
        }
        seen
    }

    /// Convert back into the editable/declarative form.
    pub fn to_spec(&self) -> GraphSpec {
        GraphSpec {
            id: self.id.clone(),
            title: self.title.clone(),
            meta: self.meta.clone(),
            layout: self.nodes.iter().map(NodeSpec::from_node).collect(),
        }
    }

    /// Breadth-first search for the FOR node closing `start_id`, skipping
    /// over nested loops.
    fn find_loop_end(&self, start_id: &str) -> Option<String> {
        let start = self.node(start_id)?;
        let mut seen: HashSet<(&str, usize)> = HashSet::new();
        let mut queue: VecDeque<(&str, usize)> =
            start.next_ids().map(|id| (id, 0usize)).collect();

        while let Some((id, depth)) = queue.pop_front() {
            if !seen.insert((id, depth)) {
                continue;
            }
            let Some(node) = self.node(id) else {
                continue;
            };
            let depth = if node.is_loop_start() {
                depth + 1
            } else if node.is_loop_end() {
                if depth == 0 {
                    return Some(node.id.clone());
                }
                depth - 1
            } else {
                depth
            };
            queue.extend(node.next_ids().map(|next| (next, depth)));
        }
        None
    }
}
