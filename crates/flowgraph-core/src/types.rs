use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a graph node. Decides how the engine treats arrivals and links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Activity,
    Exclusive,
    Parallel,
    #[serde(alias = "loop")]
    For,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Activity => "activity",
            Self::Exclusive => "exclusive",
            Self::Parallel => "parallel",
            Self::For => "for",
        }
    }

    /// Whether the engine counts a visit to this node against a step budget.
    pub fn is_transparent(&self) -> bool {
        matches!(self, Self::Start)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a human-gated node within one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Unknown,
    Waiting,
    Completed,
    Rejected,
}

impl TaskState {
    pub fn code(&self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Waiting => 1001,
            Self::Completed => 1002,
            Self::Rejected => 1003,
        }
    }

    /// Decode a persisted state code. Unrecognized codes map to `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1001 => Self::Waiting,
            1002 => Self::Completed,
            1003 => Self::Rejected,
            _ => Self::Unknown,
        }
    }

    /// Whether an actor decision has been recorded for the node.
    pub fn is_decided(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Decision an actor posts against a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Roll back to this (earlier) node so it is surfaced again.
    Withdraw,
    /// Approve: mark COMPLETED and drive the engine onward.
    Forward,
    /// Forward every task this actor meets until the named node is forwarded.
    ForwardJump,
    /// Mark REJECTED; traversal halts at this node.
    Reject,
    /// Forget every recorded state of the instance.
    Restart,
}

impl TaskAction {
    pub fn code(&self) -> i64 {
        match self {
            Self::Withdraw => 1010,
            Self::Forward => 1020,
            Self::ForwardJump => 1021,
            Self::Reject => 1030,
            Self::Restart => 1040,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1010 => Some(Self::Withdraw),
            1020 => Some(Self::Forward),
            1021 => Some(Self::ForwardJump),
            1030 => Some(Self::Reject),
            1040 => Some(Self::Restart),
            _ => None,
        }
    }

    /// State a node ends up in once this action is applied to it.
    pub fn target_state(&self) -> TaskState {
        match self {
            Self::Forward | Self::ForwardJump => TaskState::Completed,
            Self::Reject => TaskState::Rejected,
            Self::Withdraw => TaskState::Waiting,
            Self::Restart => TaskState::Unknown,
        }
    }
}

impl std::str::FromStr for TaskAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "withdraw" | "back" => Ok(Self::Withdraw),
            "forward" | "approve" => Ok(Self::Forward),
            "forward_jump" | "forward-jump" | "jump" => Ok(Self::ForwardJump),
            "reject" | "terminate" => Ok(Self::Reject),
            "restart" => Ok(Self::Restart),
            other => Err(format!("unknown task action: {}", other)),
        }
    }
}

/// Events published on an instance's event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    NodeStarted {
        graph_id: String,
        node_id: String,
    },
    NodeEnded {
        graph_id: String,
        node_id: String,
    },
    BranchSuspended {
        graph_id: String,
        node_id: String,
    },
    Stopped {
        graph_id: String,
        node_id: String,
    },
    GraphCompleted {
        graph_id: String,
    },
    TaskStateChanged {
        graph_id: String,
        node_id: String,
        state: TaskState,
    },
    /// Published by task bodies; listeners may re-drive the engine.
    Custom {
        topic: String,
        payload: serde_json::Value,
    },
}
