use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use flowgraph_core::config::EngineConfig;
use flowgraph_core::error::{FlowError, Result};
use flowgraph_core::{FlowEvent, NodeType};

use crate::context::{FlowContext, LoopFrame, Token, TokenMode};
use crate::graph::node::{META_FOR, META_IN, META_ISOLATED, META_RESULT};
use crate::graph::{Condition, Graph, Link, Node, TaskDesc};
use crate::intercept::{FlowInterceptor, FlowInvocation};
use crate::registry::ComponentRegistry;
use crate::stepper::Stepper;
use crate::traits::{DefaultDriver, Evaluator, FlowDriver, TaskDecision};

/// How a run call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An END node was reached.
    Completed,
    /// At least one branch is suspended; nothing else can run.
    Interrupted,
    /// The context was stopped.
    Stopped,
    /// The step budget ran out; the next call picks up where this one left.
    Paused,
    /// No runnable branch is left and no END node was reached.
    Stalled,
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Node-visit budget for one run call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Caller-requested step count; running out pauses.
    Steps(usize),
    /// Safety cap for unbounded runs; running out is an error.
    Cap(usize),
}

impl Budget {
    fn limit(&self) -> usize {
        match self {
            Self::Steps(n) | Self::Cap(n) => *n,
        }
    }
}

/// What the walk loop does after a node visit.
enum Step {
    Next,
    Halt,
    End,
}

/// What the task phase of a node resolved to.
enum Phase {
    Done,
    Suspended,
    Halted,
}

/// Traversal engine.
///
/// Holds the loaded graphs and the collaborators tasks are dispatched to.
/// Each call drives one [`FlowContext`]; graphs are shared read-only, so any
/// number of contexts can be driven concurrently against the same engine.
pub struct FlowEngine {
    graphs: RwLock<HashMap<String, Arc<Graph>>>,
    evaluator: Arc<dyn Evaluator>,
    registry: ComponentRegistry,
    driver: Arc<dyn FlowDriver>,
    interceptors: Vec<Arc<dyn FlowInterceptor>>,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            graphs: RwLock::new(HashMap::new()),
            evaluator,
            registry: ComponentRegistry::default(),
            driver: Arc::new(DefaultDriver),
            interceptors: Vec::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn FlowDriver>) -> Self {
        self.driver = driver;
        self
    }

    /// Add an interceptor to the chain; equal priorities keep insertion order.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn FlowInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self.interceptors.sort_by_key(|i| i.priority());
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A fresh context whose event bus uses the configured capacity.
    pub fn new_context(&self, instance_id: impl Into<String>) -> FlowContext {
        FlowContext::new(instance_id).with_event_capacity(self.config.event_capacity)
    }

    // ── Graph catalogue ─────────────────────────────────────

    /// Make a graph runnable by id. Replaces any graph with the same id.
    pub fn load(&self, graph: Graph) -> Arc<Graph> {
        let graph = Arc::new(graph);
        let mut graphs = self.graphs.write().unwrap_or_else(|e| e.into_inner());
        if graphs
            .insert(graph.id().to_string(), Arc::clone(&graph))
            .is_some()
        {
            debug!(graph_id = %graph.id(), "Replaced loaded graph");
        }
        graph
    }

    pub fn unload(&self, graph_id: &str) -> bool {
        let mut graphs = self.graphs.write().unwrap_or_else(|e| e.into_inner());
        graphs.remove(graph_id).is_some()
    }

    pub fn graph(&self, graph_id: &str) -> Result<Arc<Graph>> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        graphs
            .get(graph_id)
            .cloned()
            .ok_or_else(|| FlowError::GraphNotFound(graph_id.to_string()))
    }

    pub fn graph_ids(&self) -> Vec<String> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = graphs.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ── Entry points ────────────────────────────────────────

    /// Run until END, a stop, or every branch is suspended.
    pub async fn run(&self, graph_id: &str, ctx: &mut FlowContext) -> Result<Outcome> {
        let graph = self.graph(graph_id)?;
        let budget = self.cap();
        self.run_with(self.driver.as_ref(), &graph, ctx, budget).await
    }

    /// Visit at most `max_steps` nodes, then return [`Outcome::Paused`].
    ///
    /// Repeated calls visit exactly the nodes an unbounded run would, in the
    /// same order. START nodes do not count against the budget.
    pub async fn run_steps(
        &self,
        graph_id: &str,
        max_steps: usize,
        ctx: &mut FlowContext,
    ) -> Result<Outcome> {
        let graph = self.graph(graph_id)?;
        self.run_with(self.driver.as_ref(), &graph, ctx, Budget::Steps(max_steps))
            .await
    }

    /// Continue suspended branches past their node, then run.
    pub async fn resume(&self, graph_id: &str, ctx: &mut FlowContext) -> Result<Outcome> {
        let continued = ctx.continue_suspended(graph_id);
        debug!(graph_id, continued, "Resuming suspended branches");
        self.run(graph_id, ctx).await
    }

    /// Forget where `graph_id` was in this context.
    pub fn reset(&self, graph_id: &str, ctx: &mut FlowContext) {
        ctx.reset_cursor(graph_id);
    }

    /// Run a graph with an explicit driver and budget.
    pub async fn run_with(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        ctx: &mut FlowContext,
        budget: Budget,
    ) -> Result<Outcome> {
        info!(graph_id = %graph.id(), instance_id = %ctx.instance_id(), "Running graph");
        let outcome = self.intercepted(driver, graph, ctx, budget).await;
        match &outcome {
            Ok(outcome) => {
                info!(graph_id = %graph.id(), instance_id = %ctx.instance_id(), ?outcome, "Run finished")
            }
            Err(e) => {
                warn!(graph_id = %graph.id(), instance_id = %ctx.instance_id(), error = %e, "Run failed")
            }
        }
        outcome
    }

    /// Walk a graph from START with every cursor set aside and the trace
    /// muted, then put the cursors, the trace setting and the flags back.
    ///
    /// Used by drivers whose decisions come from outside state, where the
    /// position of an instance is recomputed on every call.
    pub async fn replay_with(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        ctx: &mut FlowContext,
    ) -> Result<Outcome> {
        let cursors = ctx.take_cursors();
        let trace_enabled = ctx.trace().is_enabled();
        let was_stopped = ctx.is_stopped();
        ctx.trace_mut().set_enabled(false);
        ctx.clear_stop();

        let outcome = self.intercepted(driver, graph, ctx, self.cap()).await;

        ctx.restore_cursors(cursors);
        ctx.trace_mut().set_enabled(trace_enabled);
        if was_stopped {
            ctx.stop();
        } else {
            ctx.clear_stop();
        }
        ctx.clear_interrupt();
        outcome
    }

    /// Run a node's task outside of a traversal, honouring its `when` guard.
    pub async fn execute_task(
        &self,
        graph: &Graph,
        node: &Node,
        ctx: &mut FlowContext,
    ) -> Result<()> {
        let Some(task) = &node.task else {
            return Ok(());
        };
        if !self.guard_passes(node, ctx)? {
            return Ok(());
        }
        self.dispatch(self.driver.as_ref(), graph, node, task, ctx)
            .await
    }

    fn cap(&self) -> Budget {
        match self.config.max_steps {
            0 => Budget::Cap(usize::MAX),
            n => Budget::Cap(n),
        }
    }

    // ── Traversal ───────────────────────────────────────────

    async fn intercepted(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        ctx: &mut FlowContext,
        budget: Budget,
    ) -> Result<Outcome> {
        FlowInvocation::new(self, &self.interceptors, driver, graph, ctx, budget)
            .proceed()
            .await
    }

    pub(crate) fn walk<'a>(
        &'a self,
        driver: &'a dyn FlowDriver,
        graph: &'a Graph,
        ctx: &'a mut FlowContext,
        budget: Budget,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            if ctx.is_stopped() {
                debug!(graph_id = %graph.id(), "Context is stopped");
                return Ok(Outcome::Stopped);
            }
            ctx.clear_interrupt();

            {
                let cursor = ctx.cursor_mut(graph.id());
                if !cursor.started {
                    cursor.started = true;
                    cursor
                        .pending
                        .extend(graph.starts().rev().map(|n| Token::arrive(n.id.clone())));
                }
                // First suspended branch ends up on top.
                let suspended = std::mem::take(&mut cursor.suspended);
                cursor.pending.extend(suspended.into_iter().rev());
            }

            let mut steps = 0usize;
            while let Some(token) = ctx.cursor_mut(graph.id()).pending.pop() {
                let node = match graph.node_or_err(&token.node_id) {
                    Ok(node) => node,
                    Err(e) => {
                        ctx.cursor_mut(graph.id()).pending.push(token);
                        return Err(e);
                    }
                };

                if !node.node_type.is_transparent() {
                    if steps >= budget.limit() {
                        ctx.cursor_mut(graph.id()).pending.push(token);
                        return match budget {
                            Budget::Steps(_) => Ok(Outcome::Paused),
                            Budget::Cap(cap) => Err(FlowError::StepCapExceeded {
                                graph: graph.id().to_string(),
                                cap,
                            }),
                        };
                    }
                    steps += 1;
                }

                if token.mode != TokenMode::Continue {
                    ctx.trace_mut().record(graph, node);
                }
                debug!(
                    graph_id = %graph.id(),
                    node_id = %node.id,
                    node_type = %node.node_type,
                    mode = ?token.mode,
                    "Visiting node"
                );

                match self.visit(driver, graph, node, token.mode, ctx).await {
                    Ok(Step::Next) => {}
                    Ok(Step::Halt) => return Ok(Outcome::Stopped),
                    Ok(Step::End) => return Ok(Outcome::Completed),
                    Err(e) => {
                        let mode = match token.mode {
                            TokenMode::Arrive => TokenMode::Rerun,
                            other => other,
                        };
                        ctx.cursor_mut(graph.id())
                            .pending
                            .push(Token::with_mode(token.node_id, mode));
                        if matches!(
                            e,
                            FlowError::TaskExecution { .. }
                                | FlowError::Evaluation(_)
                                | FlowError::ComponentNotFound(_)
                                | FlowError::GraphNotFound(_)
                        ) {
                            ctx.stop();
                        }
                        return Err(e);
                    }
                }
            }

            let cursor = ctx.cursor_mut(graph.id());
            if !cursor.suspended.is_empty() {
                Ok(Outcome::Interrupted)
            } else if cursor.completed {
                Ok(Outcome::Completed)
            } else {
                if !cursor.joins.is_empty() {
                    warn!(graph_id = %graph.id(), joins = ?cursor.joins, "Graph stalled with unfilled joins");
                }
                Ok(Outcome::Stalled)
            }
        })
    }

    async fn visit(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        node: &Node,
        mode: TokenMode,
        ctx: &mut FlowContext,
    ) -> Result<Step> {
        match node.node_type {
            NodeType::Start => {
                self.enter(driver, graph, node, ctx)?;
                self.leave(driver, graph, node, ctx)?;
                let link = self.choose_link(node, ctx)?.ok_or_else(|| {
                    FlowError::UnreachableNode {
                        graph: graph.id().to_string(),
                        node: node.id.clone(),
                    }
                })?;
                push_links(ctx, graph, std::iter::once(link));
                Ok(Step::Next)
            }
            NodeType::End => {
                self.enter(driver, graph, node, ctx)?;
                if let Some(var) = node.meta_str(META_RESULT) {
                    if let Some(value) = ctx.get(var).cloned() {
                        ctx.set_result(value);
                    }
                }
                self.leave(driver, graph, node, ctx)?;

                let cursor = ctx.cursor_mut(graph.id());
                cursor.completed = true;
                cursor.pending.clear();
                cursor.suspended.clear();
                cursor.joins.clear();
                cursor.loops.clear();
                ctx.publish(FlowEvent::GraphCompleted {
                    graph_id: graph.id().to_string(),
                });
                info!(graph_id = %graph.id(), node_id = %node.id, "Reached end node");
                Ok(Step::End)
            }
            NodeType::Activity => {
                match self.task_phase(driver, graph, node, mode, ctx).await? {
                    Phase::Done => {}
                    Phase::Suspended => return Ok(Step::Next),
                    Phase::Halted => return Ok(Step::Halt),
                }
                self.follow_first(graph, node, ctx)?;
                Ok(Step::Next)
            }
            NodeType::Exclusive => {
                match self.task_phase(driver, graph, node, mode, ctx).await? {
                    Phase::Done => {}
                    Phase::Suspended => return Ok(Step::Next),
                    Phase::Halted => return Ok(Step::Halt),
                }
                let link = self.choose_link(node, ctx)?.ok_or_else(|| {
                    FlowError::NoMatchingBranch {
                        graph: graph.id().to_string(),
                        node: node.id.clone(),
                    }
                })?;
                debug!(node_id = %node.id, next = %link.next_id, "Branch chosen");
                push_links(ctx, graph, std::iter::once(link));
                Ok(Step::Next)
            }
            NodeType::Parallel => {
                let incoming = graph.incoming(&node.id).len();
                let is_join = incoming > 1;
                if is_join && mode == TokenMode::Arrive {
                    let arrived = {
                        let count = ctx
                            .cursor_mut(graph.id())
                            .joins
                            .entry(node.id.clone())
                            .or_insert(0);
                        *count += 1;
                        *count
                    };
                    if arrived < incoming {
                        debug!(node_id = %node.id, arrived, incoming, "Join waiting for branches");
                        return Ok(Step::Next);
                    }
                }

                match self.task_phase(driver, graph, node, mode, ctx).await? {
                    Phase::Done => {}
                    Phase::Suspended => return Ok(Step::Next),
                    Phase::Halted => return Ok(Step::Halt),
                }
                if is_join {
                    ctx.cursor_mut(graph.id()).joins.remove(&node.id);
                }
                push_links(ctx, graph, node.links.iter());
                Ok(Step::Next)
            }
            NodeType::For if node.is_loop_start() => {
                self.open_loop(driver, graph, node, mode, ctx).await
            }
            NodeType::For => self.close_loop(driver, graph, node, mode, ctx).await,
        }
    }

    async fn open_loop(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        node: &Node,
        mode: TokenMode,
        ctx: &mut FlowContext,
    ) -> Result<Step> {
        match self.task_phase(driver, graph, node, mode, ctx).await? {
            Phase::Done => {}
            Phase::Suspended => return Ok(Step::Next),
            Phase::Halted => return Ok(Step::Halt),
        }

        let var = node.meta_str(META_FOR).unwrap_or_default().trim().to_string();
        let items = loop_items(graph, node, ctx)?;
        let previous = ctx.get(&var).cloned();
        debug!(node_id = %node.id, var = %var, items = items.len(), "Opening loop");

        if items.is_empty() {
            let end = graph
                .loop_end(&node.id)
                .ok_or_else(|| FlowError::InvalidLoopSource {
                    graph: graph.id().to_string(),
                    node: node.id.clone(),
                    message: "loop has no closing FOR node".to_string(),
                })?;
            ctx.cursor_mut(graph.id()).loops.push(LoopFrame {
                node_id: node.id.clone(),
                var,
                items,
                index: 0,
                previous,
            });
            ctx.cursor_mut(graph.id())
                .pending
                .push(Token::arrive(end.id.clone()));
            return Ok(Step::Next);
        }

        ctx.put(var.clone(), items[0].clone());
        ctx.cursor_mut(graph.id()).loops.push(LoopFrame {
            node_id: node.id.clone(),
            var,
            items,
            index: 0,
            previous,
        });
        self.follow_first(graph, node, ctx)?;
        Ok(Step::Next)
    }

    async fn close_loop(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        node: &Node,
        mode: TokenMode,
        ctx: &mut FlowContext,
    ) -> Result<Step> {
        let next_item = match ctx.cursor_mut(graph.id()).loops.last_mut() {
            Some(frame) if frame.has_more() => {
                frame.index += 1;
                Some((
                    frame.node_id.clone(),
                    frame.var.clone(),
                    frame.items[frame.index].clone(),
                ))
            }
            _ => None,
        };

        if let Some((start_id, var, value)) = next_item {
            ctx.put(var, value);
            let start = graph.node_or_err(&start_id)?;
            self.follow_first(graph, start, ctx)?;
            return Ok(Step::Next);
        }

        match self.task_phase(driver, graph, node, mode, ctx).await? {
            Phase::Done => {}
            Phase::Suspended => return Ok(Step::Next),
            Phase::Halted => return Ok(Step::Halt),
        }

        if let Some(frame) = ctx.cursor_mut(graph.id()).loops.pop() {
            debug!(node_id = %node.id, loop_node = %frame.node_id, "Closing loop");
            match frame.previous {
                Some(previous) => ctx.put(frame.var, previous),
                None => {
                    ctx.remove(&frame.var);
                }
            }
        } else {
            warn!(node_id = %node.id, "Closing FOR node reached with no open loop");
        }
        self.follow_first(graph, node, ctx)?;
        Ok(Step::Next)
    }

    /// Hooks, driver decision and task execution for one node visit.
    async fn task_phase(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        node: &Node,
        mode: TokenMode,
        ctx: &mut FlowContext,
    ) -> Result<Phase> {
        if mode == TokenMode::Continue {
            return Ok(Phase::Done);
        }

        self.enter(driver, graph, node, ctx)?;

        if !ctx.is_stopped() && !ctx.is_interrupted() {
            let decision = driver.before_task(ctx, graph, node)?;
            debug!(node_id = %node.id, ?decision, "Task decision");
            match decision {
                TaskDecision::Run => {
                    if self.guard_passes(node, ctx)? {
                        if let Some(task) = &node.task {
                            if let Err(e) = self.dispatch(driver, graph, node, task, ctx).await {
                                warn!(node_id = %node.id, error = %e, "Task failed");
                                driver.task_failed(ctx, graph, node)?;
                                return Err(e);
                            }
                        }
                    } else {
                        debug!(node_id = %node.id, "Task guard is false, skipping task");
                    }
                    driver.after_task(ctx, graph, node)?;
                }
                TaskDecision::Pass => {}
                TaskDecision::Suspend => ctx.interrupt(),
                TaskDecision::Halt => ctx.stop(),
            }
        }

        self.leave(driver, graph, node, ctx)?;

        if ctx.is_stopped() {
            ctx.cursor_mut(graph.id())
                .pending
                .push(Token::with_mode(node.id.clone(), TokenMode::Rerun));
            ctx.publish(FlowEvent::Stopped {
                graph_id: graph.id().to_string(),
                node_id: node.id.clone(),
            });
            info!(graph_id = %graph.id(), node_id = %node.id, "Traversal stopped");
            return Ok(Phase::Halted);
        }

        if ctx.is_interrupted() {
            ctx.clear_interrupt();
            ctx.cursor_mut(graph.id())
                .suspended
                .push(Token::with_mode(node.id.clone(), TokenMode::Rerun));
            ctx.publish(FlowEvent::BranchSuspended {
                graph_id: graph.id().to_string(),
                node_id: node.id.clone(),
            });
            debug!(graph_id = %graph.id(), node_id = %node.id, "Branch suspended");
            return Ok(Phase::Suspended);
        }

        Ok(Phase::Done)
    }

    fn enter(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        node: &Node,
        ctx: &mut FlowContext,
    ) -> Result<()> {
        driver.on_node_start(ctx, graph, node)?;
        for interceptor in &self.interceptors {
            interceptor.on_node_start(ctx, graph, node);
        }
        ctx.publish(FlowEvent::NodeStarted {
            graph_id: graph.id().to_string(),
            node_id: node.id.clone(),
        });
        Ok(())
    }

    fn leave(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        node: &Node,
        ctx: &mut FlowContext,
    ) -> Result<()> {
        driver.on_node_end(ctx, graph, node)?;
        for interceptor in &self.interceptors {
            interceptor.on_node_end(ctx, graph, node);
        }
        ctx.publish(FlowEvent::NodeEnded {
            graph_id: graph.id().to_string(),
            node_id: node.id.clone(),
        });
        Ok(())
    }

    // ── Links and conditions ────────────────────────────────

    /// First conditioned link that holds, else the last unconditioned one.
    fn choose_link<'g>(&self, node: &'g Node, ctx: &FlowContext) -> Result<Option<&'g Link>> {
        let mut fallback = None;
        for link in &node.links {
            match &link.condition {
                Some(condition) => {
                    if self.test(condition, ctx)? {
                        return Ok(Some(link));
                    }
                }
                None => fallback = Some(link),
            }
        }
        Ok(fallback)
    }

    fn follow_first(&self, graph: &Graph, node: &Node, ctx: &mut FlowContext) -> Result<()> {
        let link = self
            .choose_link(node, ctx)?
            .ok_or_else(|| FlowError::UnreachableNode {
                graph: graph.id().to_string(),
                node: node.id.clone(),
            })?;
        push_links(ctx, graph, std::iter::once(link));
        Ok(())
    }

    fn test(&self, condition: &Condition, ctx: &FlowContext) -> Result<bool> {
        match condition {
            Condition::Component(name) => self.registry.condition(name)?.test(ctx),
            Condition::Inline(code) => self.evaluator.run_test(ctx, code),
        }
    }

    fn guard_passes(&self, node: &Node, ctx: &FlowContext) -> Result<bool> {
        match &node.when {
            Some(condition) => self.test(condition, ctx),
            None => Ok(true),
        }
    }

    // ── Task dispatch ───────────────────────────────────────

    async fn dispatch(
        &self,
        driver: &dyn FlowDriver,
        graph: &Graph,
        node: &Node,
        task: &TaskDesc,
        ctx: &mut FlowContext,
    ) -> Result<()> {
        match task {
            TaskDesc::Component(name) => {
                let component = self.registry.task(name)?;
                component
                    .run(ctx, node)
                    .await
                    .map_err(|e| wrap_task_error(graph, node, e))
            }
            TaskDesc::Graph(graph_id) => self.run_subflow(driver, node, graph_id, ctx).await,
            TaskDesc::MetaRef(path) => {
                let code = graph
                    .meta_path(path)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        FlowError::task(
                            graph.id(),
                            &node.id,
                            format!("no inline code in graph meta at '{}'", path),
                        )
                    })?;
                self.run_inline(graph, node, code, None, ctx)
            }
            TaskDesc::Inline { code, lang } => {
                self.run_inline(graph, node, code, lang.as_deref(), ctx)
            }
        }
    }

    fn run_inline(
        &self,
        graph: &Graph,
        node: &Node,
        code: &str,
        lang: Option<&str>,
        ctx: &mut FlowContext,
    ) -> Result<()> {
        if !self.evaluator.supports(lang) {
            return Err(FlowError::task(
                graph.id(),
                &node.id,
                format!("evaluator does not support language '{}'", lang.unwrap_or("")),
            ));
        }
        self.evaluator
            .run_task(ctx, code)
            .map_err(|e| wrap_task_error(graph, node, e))
    }

    async fn run_subflow(
        &self,
        driver: &dyn FlowDriver,
        node: &Node,
        graph_id: &str,
        ctx: &mut FlowContext,
    ) -> Result<()> {
        let child_graph = self.graph(graph_id)?;
        let isolated = node.meta_bool(META_ISOLATED);
        debug!(node_id = %node.id, graph_id, isolated, "Running sub-flow");

        let outcome = if isolated {
            let mut child = ctx.child();
            let outcome = self.walk(driver, &child_graph, &mut child, self.cap()).await?;
            ctx.merge_vars(child.vars());
            outcome
        } else {
            self.walk(driver, &child_graph, ctx, self.cap()).await?
        };

        match outcome {
            Outcome::Completed | Outcome::Stalled => {
                if outcome == Outcome::Stalled {
                    warn!(graph_id, "Sub-flow stalled before reaching an end node");
                }
                ctx.reset_cursor(graph_id);
            }
            Outcome::Interrupted | Outcome::Paused => ctx.interrupt(),
            Outcome::Stopped => ctx.stop(),
        }
        Ok(())
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("graphs", &self.graph_ids())
            .field("registry", &self.registry)
            .field("interceptors", &self.interceptors.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Push link targets so the first link is visited next.
fn push_links<'l>(
    ctx: &mut FlowContext,
    graph: &Graph,
    links: impl DoubleEndedIterator<Item = &'l Link>,
) {
    let cursor = ctx.cursor_mut(graph.id());
    for link in links.rev() {
        cursor.pending.push(Token::arrive(link.next_id.clone()));
    }
}

fn wrap_task_error(graph: &Graph, node: &Node, e: FlowError) -> FlowError {
    match e {
        e @ (FlowError::TaskExecution { .. } | FlowError::ComponentNotFound(_)) => e,
        other => FlowError::task(graph.id(), &node.id, other),
    }
}

/// Items an opening FOR node iterates over.
fn loop_items(graph: &Graph, node: &Node, ctx: &FlowContext) -> Result<Vec<Value>> {
    let invalid = |message: String| FlowError::InvalidLoopSource {
        graph: graph.id().to_string(),
        node: node.id.clone(),
        message,
    };

    match node.meta(META_IN) {
        None => Err(invalid(format!("missing '{}'", META_IN))),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::String(source)) => {
            let source = source.trim();
            if source.starts_with('[') {
                serde_json::from_str::<Vec<Value>>(source).map_err(|e| invalid(e.to_string()))
            } else if source.contains("...") || source.contains(':') {
                let stepper = Stepper::from(source).map_err(|e| invalid(e.to_string()))?;
                Ok(stepper.values().map(Value::from).collect())
            } else {
                match ctx.get(source) {
                    Some(Value::Array(items)) => Ok(items.clone()),
                    Some(other) => Err(invalid(format!(
                        "variable '{}' is not an array: {}",
                        source, other
                    ))),
                    None => Err(invalid(format!("variable '{}' is not set", source))),
                }
            }
        }
        Some(other) => Err(invalid(format!("unsupported source {}", other))),
    }
}
