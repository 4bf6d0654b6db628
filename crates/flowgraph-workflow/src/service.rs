use std::sync::Arc;

use tracing::{debug, info};

use flowgraph_core::config::FlowConfig;
use flowgraph_core::error::{FlowError, Result};
use flowgraph_core::{TaskAction, TaskState};
use flowgraph_engine::{FlowContext, FlowEngine, Graph, Node, NodeRecord};

use crate::controller::{controller_from_config, StateController};
use crate::driver::{publish_state, state_key, ScanMode, WorkflowDriver};
use crate::repository::{open_repository, stale, StateChange, StateKey, StateRepository};
use crate::task::{InstanceStatus, Task};

/// Human-task façade over a [`FlowEngine`].
///
/// The position of an instance is never stored: every query replays the
/// graph from START against the persisted task states, so any process
/// sharing the repository sees the same tasks.
pub struct WorkflowService {
    engine: Arc<FlowEngine>,
    controller: Arc<dyn StateController>,
    repository: Arc<dyn StateRepository>,
}

impl WorkflowService {
    pub fn new(
        engine: Arc<FlowEngine>,
        controller: Arc<dyn StateController>,
        repository: Arc<dyn StateRepository>,
    ) -> Self {
        Self {
            engine,
            controller,
            repository,
        }
    }

    /// Wire the controller and repository selected in the config.
    pub fn from_config(engine: Arc<FlowEngine>, config: &FlowConfig) -> Result<Self> {
        let controller = controller_from_config(&config.workflow);
        let repository = open_repository(&config.store)?;
        Ok(Self::new(engine, controller, repository))
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    pub fn repository(&self) -> &Arc<dyn StateRepository> {
        &self.repository
    }

    /// The first task this actor can decide, or `None` once the instance
    /// has ended, was rejected, or has nothing for this actor.
    pub async fn get_task(&self, graph_id: &str, ctx: &mut FlowContext) -> Result<Option<Task>> {
        let graph = self.engine.graph(graph_id)?;
        let driver = self.replay(&graph, ScanMode::First, ctx).await?;
        if driver.reached_end() || driver.rejected().is_some() {
            return Ok(None);
        }
        Ok(driver.into_tasks().into_iter().next())
    }

    /// Every task this actor can currently decide, across parallel branches.
    pub async fn get_tasks(&self, graph_id: &str, ctx: &mut FlowContext) -> Result<Vec<Task>> {
        let graph = self.engine.graph(graph_id)?;
        let driver = self.replay(&graph, ScanMode::All, ctx).await?;
        if driver.reached_end() || driver.rejected().is_some() {
            return Ok(Vec::new());
        }
        Ok(driver.into_tasks())
    }

    /// Record an actor's decision on a node.
    pub async fn post_task(
        &self,
        graph_id: &str,
        node_id: &str,
        action: TaskAction,
        ctx: &mut FlowContext,
    ) -> Result<()> {
        let graph = self.engine.graph(graph_id)?;
        match action {
            TaskAction::Forward | TaskAction::Reject => {
                self.decide(&graph, node_id, action, ctx).await
            }
            TaskAction::ForwardJump => self.forward_jump(&graph, node_id, ctx).await,
            TaskAction::Withdraw => self.withdraw(&graph, node_id, ctx),
            TaskAction::Restart => self.restart(&graph, ctx),
        }
    }

    /// Like [`post_task`](Self::post_task), but a node that is not this
    /// actor's waiting task yields `Ok(false)` instead of an error.
    pub async fn post_task_if_waiting(
        &self,
        graph_id: &str,
        node_id: &str,
        action: TaskAction,
        ctx: &mut FlowContext,
    ) -> Result<bool> {
        match self.post_task(graph_id, node_id, action, ctx).await {
            Ok(()) => Ok(true),
            Err(FlowError::StaleState { .. }) | Err(FlowError::UnauthorizedOperation { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Forget every task state recorded for the instance.
    pub fn clear_state(&self, ctx: &FlowContext) -> Result<()> {
        self.repository.state_clear(ctx.instance_id())
    }

    /// Every task state recorded for the instance.
    pub fn states(&self, ctx: &FlowContext) -> Result<Vec<(StateKey, TaskState)>> {
        self.repository.state_list(ctx.instance_id())
    }

    pub async fn status(&self, graph_id: &str, ctx: &mut FlowContext) -> Result<InstanceStatus> {
        let graph = self.engine.graph(graph_id)?;
        let driver = self.replay(&graph, ScanMode::All, ctx).await?;
        Ok(if let Some(node_id) = driver.rejected() {
            InstanceStatus::Rejected { node_id }
        } else if driver.reached_end() {
            InstanceStatus::Completed
        } else {
            InstanceStatus::Running
        })
    }

    async fn replay<'a>(
        &'a self,
        graph: &'a Graph,
        mode: ScanMode,
        ctx: &mut FlowContext,
    ) -> Result<WorkflowDriver<'a>> {
        let driver = WorkflowDriver::new(
            self.controller.as_ref(),
            self.repository.as_ref(),
            graph.id(),
            mode,
        );
        self.engine.replay_with(&driver, graph, ctx).await?;
        Ok(driver)
    }

    fn authorize(&self, ctx: &FlowContext, node: &Node) -> Result<()> {
        if self.controller.is_auto_forward(ctx, node) {
            return Err(FlowError::UnauthorizedOperation {
                node: node.id.clone(),
                reason: "node is not gated".to_string(),
            });
        }
        if !self.controller.is_operatable(ctx, node) {
            return Err(FlowError::UnauthorizedOperation {
                node: node.id.clone(),
                reason: "actor may not operate this node".to_string(),
            });
        }
        Ok(())
    }

    async fn decide(
        &self,
        graph: &Graph,
        node_id: &str,
        action: TaskAction,
        ctx: &mut FlowContext,
    ) -> Result<()> {
        let node = graph.node_or_err(node_id)?;
        self.authorize(ctx, node)?;

        let key = state_key(ctx, graph, node);
        let target = action.target_state();
        if !self
            .repository
            .compare_and_set(&key, TaskState::Waiting, target)?
        {
            let found = self.repository.state_get(&key)?;
            return Err(stale(&key, TaskState::Waiting, found));
        }
        info!(graph_id = %graph.id(), node_id, state = %target, "Task decided");
        publish_state(ctx, graph, node, target);

        if action == TaskAction::Forward {
            if let Err(e) = self.engine.execute_task(graph, node, ctx).await {
                self.repository
                    .compare_and_set(&key, target, TaskState::Waiting)?;
                publish_state(ctx, graph, node, TaskState::Waiting);
                return Err(e);
            }
        }
        ctx.trace_mut().append(NodeRecord::new(graph, node));

        if action == TaskAction::Forward {
            self.replay(graph, ScanMode::All, ctx)
                .await
                .map_err(|e| FlowError::AdvanceFailed {
                    node: node_id.to_string(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Forward this actor's tasks one after another until `node_id` has
    /// been forwarded, the actor has nothing left, or no progress is made.
    async fn forward_jump(&self, graph: &Graph, node_id: &str, ctx: &mut FlowContext) -> Result<()> {
        graph.node_or_err(node_id)?;

        let mut last: Option<String> = None;
        while let Some(task) = self.get_task(graph.id(), ctx).await? {
            if last.as_deref() == Some(task.node_id.as_str()) {
                break;
            }
            self.decide(graph, &task.node_id, TaskAction::Forward, ctx)
                .await?;
            if task.node_id == node_id {
                info!(graph_id = %graph.id(), node_id, "Jumped forward to task");
                return Ok(());
            }
            last = Some(task.node_id);
        }
        debug!(graph_id = %graph.id(), node_id, "Forward jump stopped short of its target");
        Ok(())
    }

    fn withdraw(&self, graph: &Graph, node_id: &str, ctx: &mut FlowContext) -> Result<()> {
        let node = graph.node_or_err(node_id)?;
        self.authorize(ctx, node)?;

        let key = state_key(ctx, graph, node);
        let current = self.repository.state_get(&key)?;
        if !current.is_decided() {
            return Err(stale(&key, TaskState::Completed, current));
        }

        // Every state below the target goes, whoever recorded it. Nodes on a
        // cycle through the target also lead into it and keep their decision.
        let descendants = graph.descendants(node_id);
        let ancestors = graph.ancestors(node_id);

        let mut changes = vec![StateChange::new(key, current, TaskState::Waiting)];
        for (other, state) in self.repository.state_list(ctx.instance_id())? {
            if other.graph_id != graph.id()
                || other.node_id == node_id
                || !descendants.contains(&other.node_id)
            {
                continue;
            }
            if state.is_decided() && ancestors.contains(&other.node_id) {
                continue;
            }
            changes.push(StateChange::new(other, state, TaskState::Unknown));
        }

        self.repository.apply(&changes)?;

        if let Some(index) = ctx.trace().last_index_of(graph.id(), node_id) {
            ctx.trace_mut().truncate_from(index);
        }
        info!(
            graph_id = %graph.id(),
            node_id,
            cleared = changes.len() - 1,
            "Task withdrawn"
        );
        publish_state(ctx, graph, node, TaskState::Waiting);
        Ok(())
    }

    fn restart(&self, graph: &Graph, ctx: &mut FlowContext) -> Result<()> {
        self.repository.state_clear(ctx.instance_id())?;
        ctx.reset_cursor(graph.id());
        ctx.trace_mut().clear_graph(graph.id());
        info!(graph_id = %graph.id(), instance_id = %ctx.instance_id(), "Instance restarted");
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowService")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
