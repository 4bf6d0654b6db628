//! Graph traversal engine.
//!
//! Build a [`Graph`] with a [`GraphSpec`], load it into a [`FlowEngine`],
//! and drive a [`FlowContext`] through it with [`FlowEngine::run`] or
//! step by step with [`FlowEngine::run_steps`].

pub mod context;
pub mod engine;
pub mod evaluator;
pub mod graph;
pub mod intercept;
pub mod registry;
pub mod stepper;
pub mod traits;

pub use context::{Cursor, FlowContext, LoopFrame, NodeRecord, Token, TokenMode, Trace};
pub use engine::{Budget, FlowEngine, Outcome};
pub use evaluator::SimpleEvaluator;
pub use graph::{Condition, Graph, GraphSpec, Link, LinkSpec, Node, NodeSpec, TaskDesc};
pub use intercept::{FlowInterceptor, FlowInvocation, SimpleInterceptor};
pub use registry::ComponentRegistry;
pub use stepper::Stepper;
pub use traits::{
    ConditionComponent, DefaultDriver, Evaluator, FlowDriver, TaskComponent, TaskDecision,
};
