use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use flowgraph_core::NodeType;

use super::link::Link;

/// Meta key naming the loop variable of an opening FOR node.
pub const META_FOR: &str = "$for";
/// Meta key naming the source an opening FOR node iterates.
pub const META_IN: &str = "$in";
/// Meta key naming the variable an END node copies into the result slot.
pub const META_RESULT: &str = "$result";
/// Meta flag running a `#graph` task against a fresh child context.
pub const META_ISOLATED: &str = "isolated";

/// What a node does when the engine executes it.
///
/// Parsed from the declarative task string:
/// - `@name` → a registered task component
/// - `#graphId` → another loaded graph, run as a sub-flow
/// - `$path` → inline code stored in graph metadata under `path`
/// - anything else → inline code handed to the evaluator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDesc {
    Component(String),
    Graph(String),
    MetaRef(String),
    Inline { code: String, lang: Option<String> },
}

impl TaskDesc {
    /// Parse a task description. Blank descriptions mean "no task".
    pub fn parse(description: &str, lang: Option<&str>) -> Option<Self> {
        let description = description.trim();
        if description.is_empty() {
            return None;
        }

        let task = if let Some(name) = description.strip_prefix('@') {
            Self::Component(name.trim().to_string())
        } else if let Some(graph) = description.strip_prefix('#') {
            Self::Graph(graph.trim().to_string())
        } else if let Some(path) = description.strip_prefix('$') {
            Self::MetaRef(path.trim().to_string())
        } else {
            Self::Inline {
                code: description.to_string(),
                lang: lang.map(str::to_string),
            }
        };
        Some(task)
    }

    /// The declarative form of this task.
    pub fn description(&self) -> String {
        match self {
            Self::Component(name) => format!("@{}", name),
            Self::Graph(id) => format!("#{}", id),
            Self::MetaRef(path) => format!("${}", path),
            Self::Inline { code, .. } => code.clone(),
        }
    }

    pub fn lang(&self) -> Option<&str> {
        match self {
            Self::Inline { lang, .. } => lang.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for TaskDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// A boolean test guarding a link or a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `@name`: a registered condition component.
    Component(String),
    /// Expression handed to the evaluator.
    Inline(String),
}

impl Condition {
    /// Parse a condition. Blank conditions mean "unconditional".
    pub fn parse(description: &str) -> Option<Self> {
        let description = description.trim();
        if description.is_empty() {
            None
        } else if let Some(name) = description.strip_prefix('@') {
            Some(Self::Component(name.trim().to_string()))
        } else {
            Some(Self::Inline(description.to_string()))
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Component(name) => format!("@{}", name),
            Self::Inline(code) => code.clone(),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// A vertex of a built graph. Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier within the graph.
    pub id: String,
    /// Human-readable title.
    pub title: Option<String>,
    pub node_type: NodeType,
    /// Gating attributes, loop bindings and other free-form settings.
    pub meta: BTreeMap<String, Value>,
    /// Guards the task: when false the task is skipped but the node still advances.
    pub when: Option<Condition>,
    pub task: Option<TaskDesc>,
    /// Outgoing links, highest priority first, ties in declaration order.
    pub links: Vec<Link>,
}

impl Node {
    /// Title for display, falling back to the id.
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.meta.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn has_meta(&self, key: &str) -> bool {
        self.meta.contains_key(key)
    }

    /// FOR node that opens a loop (carries a loop variable).
    pub fn is_loop_start(&self) -> bool {
        self.node_type == NodeType::For
            && self.meta_str(META_FOR).is_some_and(|v| !v.trim().is_empty())
    }

    /// FOR node that closes the innermost open loop.
    pub fn is_loop_end(&self) -> bool {
        self.node_type == NodeType::For && !self.is_loop_start()
    }

    /// Ids of the link targets, in evaluation order.
    pub fn next_ids(&self) -> impl Iterator<Item = &str> {
        self.links.iter().map(|l| l.next_id.as_str())
    }
}
