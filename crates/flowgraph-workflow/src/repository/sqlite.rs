use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use flowgraph_core::error::{FlowError, Result};
use flowgraph_core::TaskState;

use super::{namespace_of, stale, StateChange, StateKey, StateRepository};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS task_state (
        namespace TEXT NOT NULL,
        field TEXT NOT NULL,
        state INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (namespace, field)
    );";

/// Durable task state in a SQLite database.
///
/// Several processes may share one database file; conditional writes are
/// single statements or immediate transactions, so they stay atomic across
/// connections.
pub struct SqliteStateRepository {
    conn: Mutex<Connection>,
}

impl SqliteStateRepository {
    /// Open or create a state database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| FlowError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FlowError::Database(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite state store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }
}

fn decode(key: &StateKey, code: i64) -> TaskState {
    let state = TaskState::from_code(code);
    if state == TaskState::Unknown && code != TaskState::Unknown.code() {
        warn!(key = %key, code, "Unknown persisted task state code");
    }
    state
}

fn read(conn: &Connection, key: &StateKey) -> Result<TaskState> {
    let code: Option<i64> = conn
        .query_row(
            "SELECT state FROM task_state WHERE namespace = ?1 AND field = ?2",
            params![key.namespace(), key.field()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| FlowError::Database(e.to_string()))?;
    Ok(code.map(|c| decode(key, c)).unwrap_or(TaskState::Unknown))
}

fn upsert(conn: &Connection, key: &StateKey, state: TaskState) -> Result<()> {
    if state == TaskState::Unknown {
        return delete(conn, key);
    }
    conn.execute(
        "INSERT INTO task_state (namespace, field, state, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(namespace, field) DO UPDATE SET
            state = excluded.state,
            updated_at = excluded.updated_at",
        params![key.namespace(), key.field(), state.code(), Utc::now().to_rfc3339()],
    )
    .map_err(|e| FlowError::Database(e.to_string()))?;
    Ok(())
}

fn delete(conn: &Connection, key: &StateKey) -> Result<()> {
    conn.execute(
        "DELETE FROM task_state WHERE namespace = ?1 AND field = ?2",
        params![key.namespace(), key.field()],
    )
    .map_err(|e| FlowError::Database(e.to_string()))?;
    Ok(())
}

/// Single-statement conditional write. Returns whether a row changed.
fn swap(conn: &Connection, key: &StateKey, expected: TaskState, new: TaskState) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let changed = match (expected, new) {
        (TaskState::Unknown, TaskState::Unknown) => return Ok(read(conn, key)? == TaskState::Unknown),
        (TaskState::Unknown, new) => conn.execute(
            "INSERT OR IGNORE INTO task_state (namespace, field, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.namespace(), key.field(), new.code(), now],
        ),
        (expected, TaskState::Unknown) => conn.execute(
            "DELETE FROM task_state WHERE namespace = ?1 AND field = ?2 AND state = ?3",
            params![key.namespace(), key.field(), expected.code()],
        ),
        (expected, new) => conn.execute(
            "UPDATE task_state SET state = ?3, updated_at = ?4
             WHERE namespace = ?1 AND field = ?2 AND state = ?5",
            params![key.namespace(), key.field(), new.code(), now, expected.code()],
        ),
    }
    .map_err(|e| FlowError::Database(e.to_string()))?;
    Ok(changed == 1)
}

impl StateRepository for SqliteStateRepository {
    fn state_get(&self, key: &StateKey) -> Result<TaskState> {
        let conn = self.lock()?;
        read(&conn, key)
    }

    fn state_put(&self, key: &StateKey, state: TaskState) -> Result<()> {
        let conn = self.lock()?;
        upsert(&conn, key, state)
    }

    fn state_remove(&self, key: &StateKey) -> Result<()> {
        let conn = self.lock()?;
        delete(&conn, key)
    }

    fn state_clear(&self, instance_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM task_state WHERE namespace = ?1",
                params![namespace_of(instance_id)],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
        debug!(instance_id, removed, "Cleared task states");
        Ok(())
    }

    fn state_list(&self, instance_id: &str) -> Result<Vec<(StateKey, TaskState)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT field, state FROM task_state WHERE namespace = ?1 ORDER BY field")
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![namespace_of(instance_id)], |row| {
                let field: String = row.get(0)?;
                let code: i64 = row.get(1)?;
                Ok((field, code))
            })
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let mut states = Vec::new();
        for row in rows {
            let (field, code) = row.map_err(|e| FlowError::Database(e.to_string()))?;
            match StateKey::from_parts(instance_id, &field) {
                Some(key) => {
                    let state = decode(&key, code);
                    states.push((key, state));
                }
                None => warn!(instance_id, field = %field, "Skipping malformed task state field"),
            }
        }
        Ok(states)
    }

    fn compare_and_set(&self, key: &StateKey, expected: TaskState, new: TaskState) -> Result<bool> {
        let conn = self.lock()?;
        swap(&conn, key, expected, new)
    }

    fn apply(&self, changes: &[StateChange]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| FlowError::Database(e.to_string()))?;

        for change in changes {
            match change.expected {
                Some(expected) => {
                    if !swap(&tx, &change.key, expected, change.new)? {
                        let found = read(&tx, &change.key)?;
                        return Err(stale(&change.key, expected, found));
                    }
                }
                None => upsert(&tx, &change.key, change.new)?,
            }
        }

        tx.commit().map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(node: &str) -> StateKey {
        StateKey::new("inst", "g", node)
    }

    #[test]
    fn test_put_get_list() {
        let repo = SqliteStateRepository::in_memory().unwrap();
        repo.state_put(&key("b"), TaskState::Waiting).unwrap();
        repo.state_put(&key("a"), TaskState::Completed).unwrap();
        repo.state_put(&key("b"), TaskState::Rejected).unwrap();

        assert_eq!(repo.state_get(&key("b")).unwrap(), TaskState::Rejected);
        let listed = repo.state_list("inst").unwrap();
        assert_eq!(
            listed,
            vec![(key("a"), TaskState::Completed), (key("b"), TaskState::Rejected)]
        );

        repo.state_put(&key("a"), TaskState::Unknown).unwrap();
        assert_eq!(repo.state_list("inst").unwrap().len(), 1);
        repo.state_clear("inst").unwrap();
        assert!(repo.state_list("inst").unwrap().is_empty());
    }

    #[test]
    fn test_compare_and_set_transitions() {
        let repo = SqliteStateRepository::in_memory().unwrap();
        assert!(repo
            .compare_and_set(&key("a"), TaskState::Unknown, TaskState::Waiting)
            .unwrap());
        assert!(!repo
            .compare_and_set(&key("a"), TaskState::Unknown, TaskState::Waiting)
            .unwrap());
        assert!(!repo
            .compare_and_set(&key("a"), TaskState::Completed, TaskState::Waiting)
            .unwrap());
        assert!(repo
            .compare_and_set(&key("a"), TaskState::Waiting, TaskState::Completed)
            .unwrap());
        assert!(repo
            .compare_and_set(&key("a"), TaskState::Completed, TaskState::Unknown)
            .unwrap());
        assert_eq!(repo.state_get(&key("a")).unwrap(), TaskState::Unknown);
    }

    #[test]
    fn test_apply_rolls_back_on_stale_state() {
        let repo = SqliteStateRepository::in_memory().unwrap();
        repo.state_put(&key("a"), TaskState::Completed).unwrap();
        repo.state_put(&key("b"), TaskState::Completed).unwrap();

        let err = repo
            .apply(&[
                StateChange::new(key("a"), TaskState::Completed, TaskState::Waiting),
                StateChange::new(key("b"), TaskState::Waiting, TaskState::Unknown),
            ])
            .unwrap_err();
        match err {
            FlowError::StaleState { expected, found, .. } => {
                assert_eq!(expected, "waiting");
                assert_eq!(found, "completed");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(repo.state_get(&key("a")).unwrap(), TaskState::Completed);
        assert_eq!(repo.state_get(&key("b")).unwrap(), TaskState::Completed);
    }

    #[test]
    fn test_unknown_code_reads_as_unknown() {
        let repo = SqliteStateRepository::in_memory().unwrap();
        {
            let conn = repo.lock().unwrap();
            conn.execute(
                "INSERT INTO task_state (namespace, field, state, updated_at)
                 VALUES ('flow:state:inst', 'g:x', 77, '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }
        assert_eq!(repo.state_get(&key("x")).unwrap(), TaskState::Unknown);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let repo = SqliteStateRepository::open(&path).unwrap();
            repo.state_put(&key("a"), TaskState::Completed).unwrap();
        }
        let repo = SqliteStateRepository::open(&path).unwrap();
        assert_eq!(repo.state_get(&key("a")).unwrap(), TaskState::Completed);
    }

    #[test]
    fn test_two_connections_race_on_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let first = SqliteStateRepository::open(&path).unwrap();
        let second = SqliteStateRepository::open(&path).unwrap();
        first.state_put(&key("a"), TaskState::Waiting).unwrap();

        assert!(first
            .compare_and_set(&key("a"), TaskState::Waiting, TaskState::Completed)
            .unwrap());
        assert!(!second
            .compare_and_set(&key("a"), TaskState::Waiting, TaskState::Rejected)
            .unwrap());
        assert_eq!(second.state_get(&key("a")).unwrap(), TaskState::Completed);
    }
}
