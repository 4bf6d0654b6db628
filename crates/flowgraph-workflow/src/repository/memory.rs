use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use flowgraph_core::error::Result;
use flowgraph_core::TaskState;

use super::{namespace_of, stale, StateChange, StateKey, StateRepository};

/// Process-local task state. Lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryStateRepository {
    namespaces: Mutex<HashMap<String, BTreeMap<String, TaskState>>>,
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, TaskState>>> {
        self.namespaces.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn read(map: &HashMap<String, BTreeMap<String, TaskState>>, key: &StateKey) -> TaskState {
    map.get(&key.namespace())
        .and_then(|fields| fields.get(&key.field()))
        .copied()
        .unwrap_or(TaskState::Unknown)
}

fn write(map: &mut HashMap<String, BTreeMap<String, TaskState>>, key: &StateKey, state: TaskState) {
    let namespace = key.namespace();
    if state == TaskState::Unknown {
        if let Some(fields) = map.get_mut(&namespace) {
            fields.remove(&key.field());
            if fields.is_empty() {
                map.remove(&namespace);
            }
        }
    } else {
        map.entry(namespace).or_default().insert(key.field(), state);
    }
}

impl StateRepository for InMemoryStateRepository {
    fn state_get(&self, key: &StateKey) -> Result<TaskState> {
        Ok(read(&self.lock(), key))
    }

    fn state_put(&self, key: &StateKey, state: TaskState) -> Result<()> {
        write(&mut self.lock(), key, state);
        Ok(())
    }

    fn state_remove(&self, key: &StateKey) -> Result<()> {
        write(&mut self.lock(), key, TaskState::Unknown);
        Ok(())
    }

    fn state_clear(&self, instance_id: &str) -> Result<()> {
        self.lock().remove(&namespace_of(instance_id));
        Ok(())
    }

    fn state_list(&self, instance_id: &str) -> Result<Vec<(StateKey, TaskState)>> {
        let map = self.lock();
        let Some(fields) = map.get(&namespace_of(instance_id)) else {
            return Ok(Vec::new());
        };
        Ok(fields
            .iter()
            .filter_map(|(field, state)| {
                StateKey::from_parts(instance_id, field).map(|key| (key, *state))
            })
            .collect())
    }

    fn compare_and_set(&self, key: &StateKey, expected: TaskState, new: TaskState) -> Result<bool> {
        let mut map = self.lock();
        if read(&map, key) != expected {
            return Ok(false);
        }
        write(&mut map, key, new);
        Ok(true)
    }

    fn apply(&self, changes: &[StateChange]) -> Result<()> {
        let mut map = self.lock();
        for change in changes {
            if let Some(expected) = change.expected {
                let found = read(&map, &change.key);
                if found != expected {
                    return Err(stale(&change.key, expected, found));
                }
            }
        }
        for change in changes {
            write(&mut map, &change.key, change.new);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::FlowError;
    use std::sync::Arc;

    fn key(node: &str) -> StateKey {
        StateKey::new("inst", "g", node)
    }

    #[test]
    fn test_get_put_remove() {
        let repo = InMemoryStateRepository::new();
        assert_eq!(repo.state_get(&key("a")).unwrap(), TaskState::Unknown);

        repo.state_put(&key("a"), TaskState::Waiting).unwrap();
        repo.state_put(&key("b"), TaskState::Completed).unwrap();
        assert_eq!(repo.state_get(&key("a")).unwrap(), TaskState::Waiting);

        let listed = repo.state_list("inst").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.node_id, "a");

        repo.state_remove(&key("a")).unwrap();
        assert_eq!(repo.state_get(&key("a")).unwrap(), TaskState::Unknown);

        repo.state_clear("inst").unwrap();
        assert!(repo.state_list("inst").unwrap().is_empty());
    }

    #[test]
    fn test_instances_are_separate() {
        let repo = InMemoryStateRepository::new();
        repo.state_put(&StateKey::new("one", "g", "n"), TaskState::Completed)
            .unwrap();
        repo.state_clear("two").unwrap();
        assert_eq!(
            repo.state_get(&StateKey::new("one", "g", "n")).unwrap(),
            TaskState::Completed
        );
        assert_eq!(
            repo.state_get(&StateKey::new("two", "g", "n")).unwrap(),
            TaskState::Unknown
        );
    }

    #[test]
    fn test_compare_and_set() {
        let repo = InMemoryStateRepository::new();
        assert!(repo
            .compare_and_set(&key("a"), TaskState::Unknown, TaskState::Waiting)
            .unwrap());
        assert!(!repo
            .compare_and_set(&key("a"), TaskState::Unknown, TaskState::Waiting)
            .unwrap());
        assert!(repo
            .compare_and_set(&key("a"), TaskState::Waiting, TaskState::Unknown)
            .unwrap());
        assert!(repo.state_list("inst").unwrap().is_empty());
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let repo = InMemoryStateRepository::new();
        repo.state_put(&key("a"), TaskState::Completed).unwrap();
        repo.state_put(&key("b"), TaskState::Waiting).unwrap();

        let err = repo
            .apply(&[
                StateChange::new(key("a"), TaskState::Completed, TaskState::Waiting),
                StateChange::new(key("b"), TaskState::Completed, TaskState::Unknown),
            ])
            .unwrap_err();
        assert!(matches!(err, FlowError::StaleState { .. }));
        assert_eq!(repo.state_get(&key("a")).unwrap(), TaskState::Completed);
        assert_eq!(repo.state_get(&key("b")).unwrap(), TaskState::Waiting);

        repo.apply(&[
            StateChange::new(key("a"), TaskState::Completed, TaskState::Waiting),
            StateChange::unchecked(key("b"), TaskState::Unknown),
        ])
        .unwrap();
        assert_eq!(repo.state_get(&key("a")).unwrap(), TaskState::Waiting);
        assert_eq!(repo.state_get(&key("b")).unwrap(), TaskState::Unknown);
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let repo = Arc::new(InMemoryStateRepository::new());
        repo.state_put(&key("a"), TaskState::Waiting).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = Arc::clone(&repo);
                std::thread::spawn(move || {
                    repo.compare_and_set(&key("a"), TaskState::Waiting, TaskState::Completed)
                        .unwrap()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
