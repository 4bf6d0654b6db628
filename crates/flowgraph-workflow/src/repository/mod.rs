use std::fmt;
use std::sync::Arc;

use flowgraph_core::config::{StoreConfig, StoreKind};
use flowgraph_core::error::{FlowError, Result};
use flowgraph_core::TaskState;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStateRepository;
pub use sqlite::SqliteStateRepository;

const NAMESPACE_PREFIX: &str = "flow:state:";

/// Address of one node's task state within one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub instance_id: String,
    pub graph_id: String,
    pub node_id: String,
}

impl StateKey {
    pub fn new(
        instance_id: impl Into<String>,
        graph_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            graph_id: graph_id.into(),
            node_id: node_id.into(),
        }
    }

    /// Per-instance namespace the state is stored under.
    pub fn namespace(&self) -> String {
        namespace_of(&self.instance_id)
    }

    /// `graph_id:node_id` field within the namespace.
    pub fn field(&self) -> String {
        format!("{}:{}", self.graph_id, self.node_id)
    }

    /// Rebuild a key from an instance id and a stored field.
    ///
    /// Graph ids are rejected at build time if they contain `:`, so the
    /// field splits at the first one.
    pub fn from_parts(instance_id: &str, field: &str) -> Option<Self> {
        let (graph_id, node_id) = field.split_once(':')?;
        Some(Self::new(instance_id, graph_id, node_id))
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.field())
    }
}

pub(crate) fn namespace_of(instance_id: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, instance_id)
}

/// One conditional write inside an atomic batch.
///
/// `expected` of `None` skips the check for that key. Writing
/// [`TaskState::Unknown`] removes the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub key: StateKey,
    pub expected: Option<TaskState>,
    pub new: TaskState,
}

impl StateChange {
    pub fn new(key: StateKey, expected: TaskState, new: TaskState) -> Self {
        Self {
            key,
            expected: Some(expected),
            new,
        }
    }

    pub fn unchecked(key: StateKey, new: TaskState) -> Self {
        Self {
            key,
            expected: None,
            new,
        }
    }
}

pub(crate) fn stale(key: &StateKey, expected: TaskState, found: TaskState) -> FlowError {
    FlowError::StaleState {
        node: key.to_string(),
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

/// Task-state persistence keyed by (instance, graph, node).
///
/// A missing entry reads as [`TaskState::Unknown`]. Every conditional
/// operation is atomic per key, so two callers racing on the same key see
/// exactly one success.
pub trait StateRepository: Send + Sync {
    fn state_get(&self, key: &StateKey) -> Result<TaskState>;

    fn state_put(&self, key: &StateKey, state: TaskState) -> Result<()>;

    fn state_remove(&self, key: &StateKey) -> Result<()>;

    /// Forget every state of an instance.
    fn state_clear(&self, instance_id: &str) -> Result<()>;

    /// Every stored state of an instance, ordered by field.
    fn state_list(&self, instance_id: &str) -> Result<Vec<(StateKey, TaskState)>>;

    /// Write `new` only if the current state is `expected`.
    ///
    /// Returns whether the write happened.
    fn compare_and_set(&self, key: &StateKey, expected: TaskState, new: TaskState) -> Result<bool>;

    /// Apply a batch of changes all-or-nothing.
    ///
    /// Fails with [`FlowError::StaleState`] without writing anything if any
    /// expected state does not match.
    fn apply(&self, changes: &[StateChange]) -> Result<()>;
}

/// Open the repository selected in the config.
pub fn open_repository(config: &StoreConfig) -> Result<Arc<dyn StateRepository>> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(InMemoryStateRepository::new())),
        StoreKind::Sqlite => Ok(Arc::new(SqliteStateRepository::open(
            &config.resolved_path(),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let key = StateKey::new("inst-1", "leave", "approve:hr");
        assert_eq!(key.namespace(), "flow:state:inst-1");
        assert_eq!(key.field(), "leave:approve:hr");
        assert_eq!(
            StateKey::from_parts("inst-1", &key.field()),
            Some(key.clone())
        );
        assert_eq!(StateKey::from_parts("inst-1", "no-separator"), None);
        assert_eq!(key.to_string(), "inst-1/leave:approve:hr");
    }

    #[test]
    fn test_open_repository_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            kind: StoreKind::Sqlite,
            path: dir.path().join("nested/state.db").display().to_string(),
        };
        let repo = open_repository(&config).unwrap();
        let key = StateKey::new("i", "g", "n");
        repo.state_put(&key, TaskState::Waiting).unwrap();
        assert_eq!(repo.state_get(&key).unwrap(), TaskState::Waiting);
        assert!(dir.path().join("nested/state.db").exists());

        let memory = open_repository(&StoreConfig::default()).unwrap();
        assert_eq!(memory.state_get(&key).unwrap(), TaskState::Unknown);
    }
}
