//! Human-task layer over the flowgraph engine.
//!
//! Nodes an actor must decide are gated by a [`StateController`]; their
//! decisions live in a [`StateRepository`]; [`WorkflowService`] replays an
//! instance against those states to find and post tasks.

pub mod controller;
mod driver;
pub mod repository;
pub mod service;
pub mod task;

pub use controller::{
    controller_from_config, ActorStateController, BlockStateController, NotBlockStateController,
    StateController,
};
pub use repository::{
    open_repository, InMemoryStateRepository, SqliteStateRepository, StateChange, StateKey,
    StateRepository,
};
pub use service::WorkflowService;
pub use task::{InstanceStatus, Task};
