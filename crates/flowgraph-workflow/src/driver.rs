use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{debug, info};

use flowgraph_core::error::Result;
use flowgraph_core::{FlowEvent, NodeType, TaskState};
use flowgraph_engine::{FlowContext, FlowDriver, Graph, Node, NodeRecord, TaskDecision};

use crate::controller::StateController;
use crate::repository::{StateKey, StateRepository};
use crate::task::Task;

/// How far a replay looks for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanMode {
    /// Stop at the first task this actor can decide.
    First,
    /// Park every gated branch and keep looking.
    All,
}

pub(crate) fn state_key(ctx: &FlowContext, graph: &Graph, node: &Node) -> StateKey {
    StateKey::new(ctx.instance_id(), graph.id(), node.id.clone())
}

pub(crate) fn publish_state(ctx: &FlowContext, graph: &Graph, node: &Node, state: TaskState) {
    ctx.publish(FlowEvent::TaskStateChanged {
        graph_id: graph.id().to_string(),
        node_id: node.id.clone(),
        state,
    });
}

/// Steers a replay of an instance by its persisted task states.
///
/// Decided nodes are passed over, undecided gated nodes park their branch,
/// and auto-forward nodes are claimed and run once.
pub(crate) struct WorkflowDriver<'a> {
    controller: &'a dyn StateController,
    repository: &'a dyn StateRepository,
    graph_id: &'a str,
    mode: ScanMode,
    found: Mutex<Vec<Task>>,
    rejected: Mutex<Option<String>>,
    reached_end: AtomicBool,
}

impl<'a> WorkflowDriver<'a> {
    pub(crate) fn new(
        controller: &'a dyn StateController,
        repository: &'a dyn StateRepository,
        graph_id: &'a str,
        mode: ScanMode,
    ) -> Self {
        Self {
            controller,
            repository,
            graph_id,
            mode,
            found: Mutex::new(Vec::new()),
            rejected: Mutex::new(None),
            reached_end: AtomicBool::new(false),
        }
    }

    pub(crate) fn into_tasks(self) -> Vec<Task> {
        self.found.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn rejected(&self) -> Option<String> {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn reached_end(&self) -> bool {
        self.reached_end.load(Ordering::SeqCst)
    }

    fn halt_rejected(&self, node: &Node) -> TaskDecision {
        info!(node_id = %node.id, "Node was rejected, halting");
        *self.rejected.lock().unwrap_or_else(|e| e.into_inner()) = Some(node.id.clone());
        TaskDecision::Halt
    }

    fn auto_forward(&self, key: &StateKey, node: &Node, state: TaskState) -> Result<TaskDecision> {
        match state {
            TaskState::Unknown | TaskState::Waiting => {
                if self
                    .repository
                    .compare_and_set(key, state, TaskState::Completed)?
                {
                    debug!(node_id = %node.id, "Auto-forwarding node");
                    Ok(TaskDecision::Run)
                } else {
                    debug!(node_id = %node.id, "Auto-forward claimed elsewhere, suspending");
                    Ok(TaskDecision::Suspend)
                }
            }
            TaskState::Completed => Ok(TaskDecision::Pass),
            TaskState::Rejected => Ok(self.halt_rejected(node)),
        }
    }

    fn gated(
        &self,
        ctx: &FlowContext,
        graph: &Graph,
        node: &Node,
        key: &StateKey,
        mut state: TaskState,
    ) -> Result<TaskDecision> {
        if state == TaskState::Unknown {
            if self
                .repository
                .compare_and_set(key, TaskState::Unknown, TaskState::Waiting)?
            {
                debug!(node_id = %node.id, "Task is now waiting");
                publish_state(ctx, graph, node, TaskState::Waiting);
                state = TaskState::Waiting;
            } else {
                state = self.repository.state_get(key)?;
            }
        }

        match state {
            TaskState::Unknown | TaskState::Waiting => {
                if !self.controller.is_operatable(ctx, node) {
                    return Ok(TaskDecision::Suspend);
                }
                self.found
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(Task::new(graph, node, TaskState::Waiting));
                Ok(match self.mode {
                    ScanMode::First => TaskDecision::Halt,
                    ScanMode::All => TaskDecision::Suspend,
                })
            }
            TaskState::Completed => Ok(TaskDecision::Pass),
            TaskState::Rejected => Ok(self.halt_rejected(node)),
        }
    }
}

impl FlowDriver for WorkflowDriver<'_> {
    fn on_node_start(&self, _ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<()> {
        // Only the replayed graph's END finishes the instance, not a sub-flow's.
        if node.node_type == NodeType::End && graph.id() == self.graph_id {
            self.reached_end.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn before_task(&self, ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<TaskDecision> {
        let key = state_key(ctx, graph, node);
        let state = self.repository.state_get(&key)?;
        if self.controller.is_auto_forward(ctx, node) {
            self.auto_forward(&key, node, state)
        } else {
            self.gated(ctx, graph, node, &key, state)
        }
    }

    fn after_task(&self, ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<()> {
        let key = state_key(ctx, graph, node);
        if ctx.is_interrupted() || ctx.is_stopped() {
            // The task did not finish; let the next replay run it again.
            self.repository
                .compare_and_set(&key, TaskState::Completed, TaskState::Waiting)?;
            return Ok(());
        }
        ctx.trace_mut().append(NodeRecord::new(graph, node));
        Ok(())
    }

    fn task_failed(&self, ctx: &mut FlowContext, graph: &Graph, node: &Node) -> Result<()> {
        let key = state_key(ctx, graph, node);
        self.repository
            .compare_and_set(&key, TaskState::Completed, TaskState::Waiting)?;
        Ok(())
    }
}
