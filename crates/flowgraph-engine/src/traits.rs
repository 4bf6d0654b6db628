use futures::future::BoxFuture;

use flowgraph_core::error::Result;

use crate::context::FlowContext;
use crate::graph::{Graph, Node};

/// Runs inline condition and task code.
pub trait Evaluator: Send + Sync {
    /// Evaluate a condition against the context.
    fn run_test(&self, ctx: &FlowContext, code: &str) -> Result<bool>;

    /// Execute a task body, possibly mutating the context.
    fn run_task(&self, ctx: &mut FlowContext, code: &str) -> Result<()>;

    /// Whether this evaluator understands code tagged with `lang`.
    fn supports(&self, lang: Option<&str>) -> bool {
        let _ = lang;
        true
    }
}

/// Named unit of work referenced as `@name`.
pub trait TaskComponent: Send + Sync {
    fn run<'a>(&'a self, ctx: &'a mut FlowContext, node: &'a Node) -> BoxFuture<'a, Result<()>>;
}

impl<F> TaskComponent for F
where
    F: Fn(&mut FlowContext, &Node) -> Result<()> + Send + Sync,
{
    fn run<'a>(&'a self, ctx: &'a mut FlowContext, node: &'a Node) -> BoxFuture<'a, Result<()>> {
        Box::pin(futures::future::ready(self(ctx, node)))
    }
}

/// Named predicate referenced as `@name`.
pub trait ConditionComponent: Send + Sync {
    fn test(&self, ctx: &FlowContext) -> Result<bool>;
}

impl<F> ConditionComponent for F
where
    F: Fn(&FlowContext) -> Result<bool> + Send + Sync,
{
    fn test(&self, ctx: &FlowContext) -> Result<bool> {
        self(ctx)
    }
}

/// What the engine should do with a node's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDecision {
    /// Execute the task (subject to its `when` guard).
    Run,
    /// Skip the task and advance as if it had run.
    Pass,
    /// Park this branch; other branches keep going.
    Suspend,
    /// Stop the whole traversal at this node.
    Halt,
}

/// Observes and steers a traversal node by node.
///
/// Every hook has a no-op default, so the plain engine uses [`DefaultDriver`].
pub trait FlowDriver: Send + Sync {
    /// Called when a node is entered, before its task phase.
    fn on_node_start(&self, ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<()> {
        let _ = (ctx, graph, node);
        Ok(())
    }

    /// Called when a node's task phase is over, even if it was skipped.
    fn on_node_end(&self, ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<()> {
        let _ = (ctx, graph, node);
        Ok(())
    }

    /// Decide what happens at an activity, gateway or loop node, whether or
    /// not it carries a task.
    fn before_task(&self, ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<TaskDecision> {
        let _ = (ctx, graph, node);
        Ok(TaskDecision::Run)
    }

    /// Called after a task ran successfully.
    fn after_task(&self, ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<()> {
        let _ = (ctx, graph, node);
        Ok(())
    }

    /// Called after a task failed, before the error propagates.
    fn task_failed(&self, ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<()> {
        let _ = (ctx, graph, node);
        Ok(())
    }
}

/// Runs every task and observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDriver;

impl FlowDriver for DefaultDriver {}
