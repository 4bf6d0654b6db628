use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph definition errors
    #[error("Invalid graph definition: {0}")]
    GraphDefinition(String),

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Node not found: {graph}/{node}")]
    NodeNotFound { graph: String, node: String },

    // Traversal errors
    #[error("Node has no satisfiable outgoing link: {graph}/{node}")]
    UnreachableNode { graph: String, node: String },

    #[error("No matching branch at exclusive gateway: {graph}/{node}")]
    NoMatchingBranch { graph: String, node: String },

    #[error("Graph exceeded the hard step cap ({cap}): {graph}")]
    StepCapExceeded { graph: String, cap: usize },

    #[error("Loop source is not iterable: {graph}/{node}: {message}")]
    InvalidLoopSource {
        graph: String,
        node: String,
        message: String,
    },

    // Stepper errors
    #[error("Stepper exhausted: {0}")]
    StepperExhausted(String),

    #[error("Invalid stepper range: {0}")]
    InvalidStepper(String),

    // Task and evaluator errors
    #[error("Task execution failed: {graph}/{node}: {message}")]
    TaskExecution {
        graph: String,
        node: String,
        message: String,
    },

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    // Stateful task errors
    #[error("Stale task state for {node}: expected {expected}, found {found}")]
    StaleState {
        node: String,
        expected: String,
        found: String,
    },

    #[error("Operation not permitted on {node}: {reason}")]
    UnauthorizedOperation { node: String, reason: String },

    #[error("Decision on {node} was saved, but advancing past it failed: {source}")]
    AdvanceFailed {
        node: String,
        source: Box<FlowError>,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Wrap an arbitrary task failure with the node it came from.
    pub fn task(graph: &str, node: &str, message: impl std::fmt::Display) -> Self {
        Self::TaskExecution {
            graph: graph.to_string(),
            node: node.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
