use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowgraph_core::error::Result;
use flowgraph_core::{EventBus, FlowEvent, NodeType};

use crate::graph::{Graph, Node};

/// One visited node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub graph_id: String,
    pub node_id: String,
    pub title: String,
    pub node_type: NodeType,
    pub timestamp: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(graph: &Graph, node: &Node) -> Self {
        Self {
            graph_id: graph.id().to_string(),
            node_id: node.id.clone(),
            title: node.title().to_string(),
            node_type: node.node_type,
            timestamp: Utc::now(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.node_type == NodeType::End
    }
}

/// Ordered audit of visited nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    records: Vec<NodeRecord>,
}

fn default_enabled() -> bool {
    true
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            enabled: true,
            records: Vec::new(),
        }
    }
}

impl Trace {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Record a visit, unless recording is disabled.
    pub fn record(&mut self, graph: &Graph, node: &Node) {
        if self.enabled {
            self.records.push(NodeRecord::new(graph, node));
        }
    }

    /// Append a record regardless of the enabled flag.
    pub fn append(&mut self, record: NodeRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[NodeRecord] {
        &self.records
    }

    pub fn records_for<'a>(&'a self, graph_id: &'a str) -> impl Iterator<Item = &'a NodeRecord> {
        self.records.iter().filter(move |r| r.graph_id == graph_id)
    }

    pub fn last_record(&self, graph_id: &str) -> Option<&NodeRecord> {
        self.records.iter().rev().find(|r| r.graph_id == graph_id)
    }

    pub fn last_node_id(&self, graph_id: &str) -> Option<&str> {
        self.last_record(graph_id).map(|r| r.node_id.as_str())
    }

    /// Index of the most recent record of `node_id` in `graph_id`.
    pub fn last_index_of(&self, graph_id: &str, node_id: &str) -> Option<usize> {
        self.records
            .iter()
            .rposition(|r| r.graph_id == graph_id && r.node_id == node_id)
    }

    /// Drop the record at `index` and everything after it.
    pub fn truncate_from(&mut self, index: usize) {
        self.records.truncate(index);
    }

    /// Drop every record of `graph_id`.
    pub fn clear_graph(&mut self, graph_id: &str) {
        self.records.retain(|r| r.graph_id != graph_id);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// How a pending branch token re-enters its node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenMode {
    /// Fresh arrival over a link.
    #[default]
    Arrive,
    /// Visit again after a suspension or stop; join bookkeeping already done.
    Rerun,
    /// Continue past the node without running its task again.
    Continue,
}

/// A branch waiting to visit a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub node_id: String,
    #[serde(default)]
    pub mode: TokenMode,
}

impl Token {
    pub fn arrive(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            mode: TokenMode::Arrive,
        }
    }

    pub fn with_mode(node_id: impl Into<String>, mode: TokenMode) -> Self {
        Self {
            node_id: node_id.into(),
            mode,
        }
    }
}

/// An open loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFrame {
    /// Opening FOR node.
    pub node_id: String,
    pub var: String,
    pub items: Vec<Value>,
    pub index: usize,
    /// Value the loop variable had before the loop opened.
    pub previous: Option<Value>,
}

impl LoopFrame {
    pub fn has_more(&self) -> bool {
        self.index + 1 < self.items.len()
    }
}

/// Resumable position of one graph within an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Stack of branch tokens; the last one is visited next.
    #[serde(default)]
    pub(crate) pending: Vec<Token>,
    /// Branches suspended by an interrupt, in suspension order.
    #[serde(default)]
    pub(crate) suspended: Vec<Token>,
    /// Arrivals counted at join nodes for the current round.
    #[serde(default)]
    pub(crate) joins: HashMap<String, usize>,
    #[serde(default)]
    pub(crate) loops: Vec<LoopFrame>,
    #[serde(default)]
    pub(crate) started: bool,
    #[serde(default)]
    pub(crate) completed: bool,
}

impl Cursor {
    /// Node ids waiting to be visited, next first.
    pub fn pending_nodes(&self) -> Vec<&str> {
        self.pending.iter().rev().map(|t| t.node_id.as_str()).collect()
    }

    pub fn suspended_nodes(&self) -> Vec<&str> {
        self.suspended.iter().map(|t| t.node_id.as_str()).collect()
    }

    pub fn loop_depth(&self) -> usize {
        self.loops.len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

/// Mutable state of one running instance.
///
/// Owned by exactly one instance: variables, the trace, one cursor per
/// graph walked, the result slot, the interrupt/stop flags and an
/// instance-scoped event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowContext {
    instance_id: String,
    #[serde(default)]
    vars: HashMap<String, Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    trace: Trace,
    #[serde(default)]
    cursors: HashMap<String, Cursor>,
    #[serde(default)]
    stopped: bool,
    #[serde(skip)]
    interrupted: bool,
    #[serde(skip)]
    bus: Arc<EventBus>,
}

impl FlowContext {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            vars: HashMap::new(),
            result: None,
            trace: Trace::default(),
            cursors: HashMap::new(),
            stopped: false,
            interrupted: false,
            bus: Arc::new(EventBus::default()),
        }
    }

    /// Create a context with a random instance id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Seed variables.
    pub fn with_vars(mut self, vars: HashMap<String, Value>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Use an event bus with a specific buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.bus = Arc::new(EventBus::new(capacity));
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    // ── Variables ───────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Get a variable converted to `T`, if present and convertible.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.vars
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.vars.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.vars.get(key).and_then(|v| v.as_i64())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Set a variable (last write wins).
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Set a variable only if it is not set yet. Returns whether it was set.
    pub fn put_if_absent(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if self.vars.contains_key(&key) {
            return false;
        }
        self.vars.insert(key, value.into());
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.vars.remove(key)
    }

    /// Add `delta` to an integer variable (missing counts as 0).
    pub fn incr(&mut self, key: &str, delta: i64) -> i64 {
        let next = self.get_i64(key).unwrap_or(0) + delta;
        self.vars.insert(key.to_string(), Value::from(next));
        next
    }

    pub fn vars(&self) -> &HashMap<String, Value> {
        &self.vars
    }

    /// Copy variables from another map (overwrites on conflict).
    pub fn merge_vars(&mut self, other: &HashMap<String, Value>) {
        for (k, v) in other {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    // ── Result slot ─────────────────────────────────────────

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, value: impl Into<Value>) {
        self.result = Some(value.into());
    }

    pub fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }

    // ── Suspension ──────────────────────────────────────────

    /// Suspend the current branch after the running task returns.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub(crate) fn clear_interrupt(&mut self) {
        self.interrupted = false;
    }

    /// Halt traversal. Later runs return immediately until `clear_stop`.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Allow a stopped instance to be driven again.
    pub fn clear_stop(&mut self) {
        self.stopped = false;
    }

    /// Mark the suspended branches of `graph_id` to continue past their
    /// node on the next run instead of re-running its task. Returns how many
    /// branches were marked.
    pub fn continue_suspended(&mut self, graph_id: &str) -> usize {
        match self.cursors.get_mut(graph_id) {
            Some(cursor) => {
                for token in &mut cursor.suspended {
                    token.mode = TokenMode::Continue;
                }
                cursor.suspended.len()
            }
            None => 0,
        }
    }

    // ── Trace and cursors ───────────────────────────────────

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut Trace {
        &mut self.trace
    }

    pub fn cursor(&self, graph_id: &str) -> Option<&Cursor> {
        self.cursors.get(graph_id)
    }

    pub(crate) fn cursor_mut(&mut self, graph_id: &str) -> &mut Cursor {
        self.cursors.entry(graph_id.to_string()).or_default()
    }

    /// Forget where `graph_id` was; the next run starts from its START node.
    pub fn reset_cursor(&mut self, graph_id: &str) {
        self.cursors.remove(graph_id);
    }

    pub(crate) fn take_cursors(&mut self) -> HashMap<String, Cursor> {
        std::mem::take(&mut self.cursors)
    }

    pub(crate) fn restore_cursors(&mut self, cursors: HashMap<String, Cursor>) {
        self.cursors = cursors;
    }

    // ── Events ──────────────────────────────────────────────

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn publish(&self, event: FlowEvent) {
        self.bus.publish(event);
    }

    /// Publish a custom event on this instance's bus.
    pub fn emit(&self, topic: impl Into<String>, payload: Value) {
        self.bus.emit(topic, payload);
    }

    // ── Derived contexts and snapshots ──────────────────────

    /// A fresh context for an isolated sub-flow: same instance and bus, a
    /// copy of the variables, no trace or cursors.
    pub fn child(&self) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            vars: self.vars.clone(),
            result: None,
            trace: Trace::default(),
            cursors: HashMap::new(),
            stopped: false,
            interrupted: false,
            bus: Arc::clone(&self.bus),
        }
    }

    /// Serialize everything except the event bus.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphSpec;

    fn tiny_graph() -> Graph {
        let mut spec = GraphSpec::new("g");
        spec.add_start("s").link_to("a");
        spec.add_activity("a").title("Alpha").link_to("e");
        spec.add_end("e");
        spec.build().unwrap()
    }

    #[test]
    fn test_variables() {
        let mut ctx = FlowContext::new("i-1");
        ctx.put("name", "Alice");
        ctx.put("count", 42);

        assert_eq!(ctx.get_str("name"), Some("Alice"));
        assert_eq!(ctx.get_i64("count"), Some(42));
        assert_eq!(ctx.get_as::<u32>("count"), Some(42));
        assert_eq!(ctx.get("missing"), None);

        assert!(!ctx.put_if_absent("name", "Bob"));
        assert!(ctx.put_if_absent("role", "admin"));
        assert_eq!(ctx.get_str("name"), Some("Alice"));

        assert_eq!(ctx.incr("count", 3), 45);
        assert_eq!(ctx.incr("fresh", 1), 1);
        assert_eq!(ctx.remove("role"), Some(Value::from("admin")));
    }

    #[test]
    fn test_trace_queries() {
        let graph = tiny_graph();
        let mut trace = Trace::default();
        for id in ["s", "a", "e"] {
            trace.record(&graph, graph.node(id).unwrap());
        }

        assert_eq!(trace.len(), 3);
        assert_eq!(trace.last_node_id("g"), Some("e"));
        assert!(trace.last_record("g").unwrap().is_end());
        assert_eq!(trace.records()[1].title, "Alpha");
        assert_eq!(trace.last_index_of("g", "a"), Some(1));
        assert!(trace.last_record("other").is_none());

        trace.truncate_from(2);
        assert_eq!(trace.records_for("g").count(), 2);
        assert_eq!(trace.last_node_id("g"), Some("a"));

        trace.set_enabled(false);
        trace.record(&graph, graph.node("a").unwrap());
        assert_eq!(trace.len(), 2);
        trace.append(NodeRecord::new(&graph, graph.node("a").unwrap()));
        assert_eq!(trace.len(), 3);

        trace.clear_graph("g");
        assert!(trace.is_empty());
    }

    #[test]
    fn test_flags() {
        let mut ctx = FlowContext::new("i-2");
        ctx.interrupt();
        assert!(ctx.is_interrupted());
        ctx.clear_interrupt();
        assert!(!ctx.is_interrupted());

        ctx.stop();
        assert!(ctx.is_stopped());
        ctx.clear_stop();
        assert!(!ctx.is_stopped());
    }

    #[test]
    fn test_continue_suspended_marks_tokens() {
        let mut ctx = FlowContext::new("i-3");
        assert_eq!(ctx.continue_suspended("g"), 0);

        ctx.cursor_mut("g")
            .suspended
            .push(Token::with_mode("a", TokenMode::Rerun));
        assert_eq!(ctx.continue_suspended("g"), 1);
        assert_eq!(
            ctx.cursor("g").unwrap().suspended[0].mode,
            TokenMode::Continue
        );
    }

    #[test]
    fn test_json_snapshot_roundtrip() {
        let graph = tiny_graph();
        let mut ctx = FlowContext::new("i-4");
        ctx.put("x", 1);
        ctx.set_result("done");
        ctx.trace_mut().record(&graph, graph.node("a").unwrap());
        ctx.cursor_mut("g").pending.push(Token::arrive("e"));
        ctx.stop();

        let json = ctx.to_json().unwrap();
        let restored = FlowContext::from_json(&json).unwrap();

        assert_eq!(restored.instance_id(), "i-4");
        assert_eq!(restored.get_i64("x"), Some(1));
        assert_eq!(restored.result(), Some(&Value::from("done")));
        assert_eq!(restored.trace().last_node_id("g"), Some("a"));
        assert_eq!(restored.cursor("g").unwrap().pending_nodes(), vec!["e"]);
        assert!(restored.is_stopped());
    }

    #[test]
    fn test_child_shares_bus_and_copies_vars() {
        let mut parent = FlowContext::new("i-5");
        parent.put("k", "v");
        parent.cursor_mut("g").started = true;

        let child = parent.child();
        assert_eq!(child.instance_id(), "i-5");
        assert_eq!(child.get_str("k"), Some("v"));
        assert!(child.cursor("g").is_none());
        assert!(Arc::ptr_eq(child.bus(), parent.bus()));
    }
}
