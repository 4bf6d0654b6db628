use std::sync::Arc;

use serde_json::Value;

use flowgraph_core::config::{ControllerKind, WorkflowConfig};
use flowgraph_core::NodeType;
use flowgraph_engine::{FlowContext, Node};

/// Gating policy: who may decide a node, and which nodes need no decision.
pub trait StateController: Send + Sync {
    /// Whether the actor described by `ctx` may decide `node`.
    fn is_operatable(&self, ctx: &FlowContext, node: &Node) -> bool;

    /// Whether `node` advances without an actor decision.
    fn is_auto_forward(&self, ctx: &FlowContext, node: &Node) -> bool;
}

/// Gates nodes whose metadata names an actor attribute.
///
/// A node carrying `actor = "manager"` is operatable by a context whose
/// `actor` variable is `"manager"`. Either side may be an array, in which
/// case any shared value matches. Nodes carrying none of the keys, and END
/// nodes, advance on their own.
#[derive(Debug, Clone)]
pub struct ActorStateController {
    keys: Vec<String>,
}

impl ActorStateController {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Default for ActorStateController {
    fn default() -> Self {
        Self::new(vec!["actor".to_string()])
    }
}

impl StateController for ActorStateController {
    fn is_operatable(&self, ctx: &FlowContext, node: &Node) -> bool {
        self.keys.iter().any(|key| match (node.meta(key), ctx.get(key)) {
            (Some(expected), Some(actual)) => actor_matches(expected, actual),
            _ => false,
        })
    }

    fn is_auto_forward(&self, _ctx: &FlowContext, node: &Node) -> bool {
        node.node_type == NodeType::End || !self.keys.iter().any(|key| node.has_meta(key))
    }
}

fn actor_matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Array(options), actual) => options.iter().any(|o| actor_matches(o, actual)),
        (expected, Value::Array(held)) => held.iter().any(|h| h == expected),
        (expected, actual) => expected == actual,
    }
}

/// Never gates: every node advances on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotBlockStateController;

impl StateController for NotBlockStateController {
    fn is_operatable(&self, _ctx: &FlowContext, _node: &Node) -> bool {
        true
    }

    fn is_auto_forward(&self, _ctx: &FlowContext, _node: &Node) -> bool {
        true
    }
}

/// Gates every ACTIVITY for any actor; everything else advances on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockStateController;

impl StateController for BlockStateController {
    fn is_operatable(&self, _ctx: &FlowContext, _node: &Node) -> bool {
        true
    }

    fn is_auto_forward(&self, _ctx: &FlowContext, node: &Node) -> bool {
        node.node_type != NodeType::Activity
    }
}

/// Build the controller selected in the config.
pub fn controller_from_config(config: &WorkflowConfig) -> Arc<dyn StateController> {
    match config.controller {
        ControllerKind::Actor => Arc::new(ActorStateController::new(config.actor_keys.clone())),
        ControllerKind::Block => Arc::new(BlockStateController),
        ControllerKind::NotBlock => Arc::new(NotBlockStateController),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_engine::GraphSpec;

    fn nodes() -> flowgraph_engine::Graph {
        let mut spec = GraphSpec::new("g");
        spec.add_start("s").link_to("review");
        spec.add_activity("review")
            .meta_put("actor", "manager")
            .link_to("either");
        spec.add_activity("either")
            .meta_put("actor", serde_json::json!(["hr", "finance"]))
            .link_to("auto");
        spec.add_activity("auto").link_to("check");
        spec.add_exclusive("check").link_to("e");
        spec.add_end("e").meta_put("actor", "manager");
        spec.build().unwrap()
    }

    #[test]
    fn test_actor_controller() {
        let graph = nodes();
        let controller = ActorStateController::default();
        let mut ctx = FlowContext::new("i");

        let review = graph.node("review").unwrap();
        assert!(!controller.is_operatable(&ctx, review));
        ctx.put("actor", "clerk");
        assert!(!controller.is_operatable(&ctx, review));
        ctx.put("actor", "manager");
        assert!(controller.is_operatable(&ctx, review));
        assert!(!controller.is_auto_forward(&ctx, review));

        let either = graph.node("either").unwrap();
        assert!(!controller.is_operatable(&ctx, either));
        ctx.put("actor", serde_json::json!(["manager", "finance"]));
        assert!(controller.is_operatable(&ctx, either));

        assert!(controller.is_auto_forward(&ctx, graph.node("auto").unwrap()));
        assert!(controller.is_auto_forward(&ctx, graph.node("e").unwrap()));
    }

    #[test]
    fn test_custom_actor_keys() {
        let mut spec = GraphSpec::new("g");
        spec.add_start("s").link_to("n");
        spec.add_activity("n").meta_put("role", "auditor").link_to("e");
        spec.add_end("e");
        let graph = spec.build().unwrap();
        let node = graph.node("n").unwrap();

        let controller = ActorStateController::new(vec!["role".into(), "user".into()]);
        let mut ctx = FlowContext::new("i");
        ctx.put("role", "auditor");
        assert!(controller.is_operatable(&ctx, node));
        assert!(!controller.is_auto_forward(&ctx, node));
        assert!(ActorStateController::default().is_auto_forward(&ctx, node));
    }

    #[test]
    fn test_block_and_not_block() {
        let graph = nodes();
        let ctx = FlowContext::new("i");

        let block = BlockStateController;
        assert!(block.is_operatable(&ctx, graph.node("auto").unwrap()));
        assert!(!block.is_auto_forward(&ctx, graph.node("auto").unwrap()));
        assert!(block.is_auto_forward(&ctx, graph.node("check").unwrap()));

        let open = NotBlockStateController;
        assert!(open.is_auto_forward(&ctx, graph.node("review").unwrap()));
        assert!(open.is_operatable(&ctx, graph.node("review").unwrap()));
    }

    #[test]
    fn test_from_config() {
        let mut config = WorkflowConfig::default();
        let ctx = FlowContext::new("i");
        let graph = nodes();
        let auto = graph.node("auto").unwrap();

        assert!(controller_from_config(&config).is_auto_forward(&ctx, auto));
        config.controller = ControllerKind::Block;
        assert!(!controller_from_config(&config).is_auto_forward(&ctx, auto));
    }
}
