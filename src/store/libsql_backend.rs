//! libSQL backend: async [`TaskStore`] implementation.
//!
//! One connection guarded by an async mutex. Holding the lock across a
//! read-modify-write is what makes `update` and `create` atomic; the claim is
//! a single guarded `UPDATE` and would stay exclusive even without it.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Value, params};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, Result, TaskError};
use crate::scheduler::graph::DependencyGraph;
use crate::store::migrations;
use crate::store::traits::{TaskMutation, TaskStore};
use crate::task::{LogLevel, Priority, Task, TaskFilter, TaskLogEntry, TaskStatus};

/// libSQL task store.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: Mutex<Connection>,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::with_database(db).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::with_database(db).await
    }

    async fn with_database(db: libsql::Database) -> Result<Self> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = FULL;")
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to configure connection: {e}")))?;

        let store = Self {
            db,
            conn: Mutex::new(conn),
        };
        store.init_schema().await?;
        Ok(store)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so string order equals time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(
    s: Option<String>,
) -> std::result::Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn parse_uuid(s: &str) -> std::result::Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad task id {s:?}: {e}")))
}

fn parse_map(s: &str) -> std::result::Result<Map<String, JsonValue>, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn to_json(map: &Map<String, JsonValue>) -> std::result::Result<String, DatabaseError> {
    serde_json::to_string(map).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> std::result::Result<Task, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("row_to_task: {e}"));

    let status_str: String = row.get(7).map_err(col)?;
    let status = status_str
        .parse::<TaskStatus>()
        .map_err(DatabaseError::Serialization)?;

    let result = row
        .get::<Option<String>>(12)
        .map_err(col)?
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    let dependencies = match row.get::<Option<String>>(20).map_err(col)? {
        Some(list) => list
            .split(',')
            .filter(|s| !s.is_empty())
            .map(parse_uuid)
            .collect::<std::result::Result<BTreeSet<_>, _>>()?,
        None => BTreeSet::new(),
    };

    Ok(Task {
        sequence: row.get(0).map_err(col)?,
        id: parse_uuid(&row.get::<String>(1).map_err(col)?)?,
        name: row.get(2).map_err(col)?,
        description: row.get(3).map_err(col)?,
        action: row.get(4).map_err(col)?,
        parameters: parse_map(&row.get::<String>(5).map_err(col)?)?,
        priority: Priority::from_rank(row.get(6).map_err(col)?),
        status,
        dependencies,
        retry_count: row.get::<i64>(8).map_err(col)? as u32,
        max_retries: row.get::<i64>(9).map_err(col)? as u32,
        progress: row.get::<i64>(10).map_err(col)?.clamp(0, 100) as u8,
        context: parse_map(&row.get::<String>(11).map_err(col)?)?,
        result,
        error: row.get(13).map_err(col)?,
        error_kind: row.get(14).map_err(col)?,
        retry_at: parse_optional_datetime(row.get(15).map_err(col)?)?,
        started_at: parse_optional_datetime(row.get(16).map_err(col)?)?,
        finished_at: parse_optional_datetime(row.get(17).map_err(col)?)?,
        created_at: parse_datetime(&row.get::<String>(18).map_err(col)?)?,
        updated_at: parse_datetime(&row.get::<String>(19).map_err(col)?)?,
    })
}

fn row_to_log(row: &libsql::Row) -> std::result::Result<TaskLogEntry, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("row_to_log: {e}"));
    let level: String = row.get(3).map_err(col)?;

    Ok(TaskLogEntry {
        task_id: parse_uuid(&row.get::<String>(0).map_err(col)?)?,
        sequence: row.get(1).map_err(col)?,
        timestamp: parse_datetime(&row.get::<String>(2).map_err(col)?)?,
        level: level.parse().map_err(DatabaseError::Serialization)?,
        message: row.get(4).map_err(col)?,
    })
}

const TASK_COLUMNS: &str = "seq, id, name, description, action, parameters, priority, status, \
     retry_count, max_retries, progress, context, result, error, error_kind, retry_at, \
     started_at, finished_at, created_at, updated_at, \
     (SELECT group_concat(d.depends_on, ',') FROM task_dependencies d WHERE d.task_id = tasks.id)";

const ORDER_READY: &str = "ORDER BY priority DESC, created_at ASC, seq ASC";

/// Claim only succeeds if the row is still PENDING and nothing upstream is unfinished.
const CLAIM_SQL: &str = "UPDATE tasks SET status = 'running', started_at = ?2, updated_at = ?2, progress = 0 \
     WHERE id = ?1 AND status = 'pending' AND NOT EXISTS ( \
         SELECT 1 FROM task_dependencies d JOIN tasks up ON up.id = d.depends_on \
         WHERE d.task_id = ?1 AND up.status != 'completed')";

async fn fetch(conn: &Connection, id: Uuid) -> std::result::Result<Option<Task>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get row: {e}"))),
    }
}

async fn status_of(
    conn: &Connection,
    id: Uuid,
) -> std::result::Result<Option<TaskStatus>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT status FROM tasks WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("status_of: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("status_of row: {e}")))?;
            Ok(Some(status.parse().map_err(DatabaseError::Serialization)?))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("status_of row: {e}"))),
    }
}

async fn load_edges(conn: &Connection) -> std::result::Result<Vec<(Uuid, Uuid)>, DatabaseError> {
    let mut rows = conn
        .query("SELECT task_id, depends_on FROM task_dependencies", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("dependency_edges: {e}")))?;

    let mut edges = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("dependency_edges row: {e}")))?
    {
        let task: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("dependency_edges row: {e}")))?;
        let dep: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("dependency_edges row: {e}")))?;
        edges.push((parse_uuid(&task)?, parse_uuid(&dep)?));
    }
    Ok(edges)
}

async fn insert_task(conn: &Connection, task: &Task) -> std::result::Result<(), DatabaseError> {
    let result = task
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO tasks (id, name, description, action, parameters, priority, status, retry_count, max_retries, progress, context, result, error, error_kind, retry_at, started_at, finished_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            task.id.to_string(),
            task.name.as_str(),
            task.description.as_str(),
            task.action.as_str(),
            to_json(&task.parameters)?,
            task.priority.rank(),
            task.status.as_str(),
            task.retry_count as i64,
            task.max_retries as i64,
            task.progress as i64,
            to_json(&task.context)?,
            result,
            task.error.clone(),
            task.error_kind.clone(),
            task.retry_at.as_ref().map(ts),
            task.started_at.as_ref().map(ts),
            task.finished_at.as_ref().map(ts),
            ts(&task.created_at),
            ts(&task.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("create: {e}")))?;

    for dep in &task.dependencies {
        conn.execute(
            "INSERT INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
            params![task.id.to_string(), dep.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create dependency: {e}")))?;
    }
    Ok(())
}

async fn begin(conn: &Connection) -> std::result::Result<(), DatabaseError> {
    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;
    Ok(())
}

/// Commit, or roll back if the commit itself fails so the connection never
/// stays inside an open transaction.
async fn commit(conn: &Connection) -> std::result::Result<(), DatabaseError> {
    if let Err(e) = conn.execute("COMMIT", ()).await {
        rollback(conn).await;
        return Err(DatabaseError::Query(format!("commit: {e}")));
    }
    Ok(())
}

async fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute("ROLLBACK", ()).await {
        tracing::warn!(error = %e, "Rollback failed");
    }
}

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await?;
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create(&self, mut task: Task) -> Result<Task> {
        let conn = self.conn.lock().await;

        if status_of(&conn, task.id).await?.is_some() {
            return Err(TaskError::InvalidInput(format!("task {} already exists", task.id)).into());
        }

        let graph = DependencyGraph::from_edges(load_edges(&conn).await?);
        if let Some(path) = graph.cycle_through(task.id, &task.dependencies) {
            return Err(TaskError::Cycle { id: task.id, path }.into());
        }

        let mut ready = true;
        for dep in &task.dependencies {
            match status_of(&conn, *dep).await? {
                None => {
                    return Err(TaskError::UnknownDependency {
                        id: task.id,
                        dependency: *dep,
                    }
                    .into());
                }
                Some(TaskStatus::Completed) => {}
                Some(_) => ready = false,
            }
        }
        task.status = if ready {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };

        begin(&conn).await?;
        if let Err(e) = insert_task(&conn, &task).await {
            rollback(&conn).await;
            return Err(e.into());
        }
        commit(&conn).await?;

        debug!(id = %task.id, status = %task.status, "Task created");
        fetch(&conn, task.id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id: task.id }.into())
    }

    async fn get(&self, id: Uuid) -> Result<Task> {
        let conn = self.conn.lock().await;
        fetch(&conn, id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id }.into())
    }

    async fn update(&self, id: Uuid, mutation: TaskMutation) -> Result<Task> {
        let conn = self.conn.lock().await;
        let original = fetch(&conn, id).await?.ok_or(TaskError::NotFound { id })?;

        let mut task = original.clone();
        mutation(&mut task)?;

        if original.is_terminal() {
            return Err(TaskError::Conflict {
                id,
                state: original.status.to_string(),
                target: task.status.to_string(),
            }
            .into());
        }
        if task.status != original.status {
            original.check_transition(task.status)?;
        }
        if task.retry_count > task.max_retries {
            return Err(TaskError::InvalidInput(format!(
                "retry_count {} exceeds max_retries {}",
                task.retry_count, task.max_retries
            ))
            .into());
        }
        if task.updated_at == original.updated_at {
            task.updated_at = Utc::now();
        }

        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let changed = conn
            .execute(
                "UPDATE tasks SET priority = ?3, status = ?4, retry_count = ?5, max_retries = ?6,
                    progress = ?7, context = ?8, result = ?9, error = ?10, error_kind = ?11,
                    retry_at = ?12, started_at = ?13, finished_at = ?14, updated_at = ?15
                 WHERE id = ?1 AND status = ?2",
                params![
                    id.to_string(),
                    original.status.as_str(),
                    task.priority.rank(),
                    task.status.as_str(),
                    task.retry_count as i64,
                    task.max_retries as i64,
                    task.progress as i64,
                    to_json(&task.context)?,
                    result,
                    task.error.clone(),
                    task.error_kind.clone(),
                    task.retry_at.as_ref().map(ts),
                    task.started_at.as_ref().map(ts),
                    task.finished_at.as_ref().map(ts),
                    ts(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update: {e}")))?;

        if changed != 1 {
            return Err(TaskError::Conflict {
                id,
                state: original.status.to_string(),
                target: task.status.to_string(),
            }
            .into());
        }

        debug!(id = %id, from = %original.status, to = %task.status, "Task updated");
        Ok(task)
    }

    async fn try_claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let claimed = conn
            .execute(CLAIM_SQL, params![id.to_string(), ts(&now)])
            .await
            .map_err(|e| DatabaseError::Query(format!("try_claim: {e}")))?;

        if claimed != 1 {
            return Ok(None);
        }
        Ok(fetch(&conn, id).await?)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders = (0..filter.statuses.len())
                .map(|i| format!("?{}", values.len() + i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            clauses.push(format!("status IN ({placeholders})"));
            values.extend(
                filter
                    .statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
        }
        if !filter.priorities.is_empty() {
            let placeholders = (0..filter.priorities.len())
                .map(|i| format!("?{}", values.len() + i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            clauses.push(format!("priority IN ({placeholders})"));
            values.extend(filter.priorities.iter().map(|p| Value::Integer(p.rank())));
        }
        if let Some(action) = &filter.action {
            clauses.push(format!("action = ?{}", values.len() + 1));
            values.push(Value::Text(action.clone()));
        }

        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push(' ');
        sql.push_str(ORDER_READY);
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("list: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE tasks SET progress = ?2, updated_at = ?3 WHERE id = ?1 AND status = 'running'",
                params![id.to_string(), progress.min(100) as i64, ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_progress: {e}")))?;
        Ok(changed == 1)
    }

    // ── Dependencies ────────────────────────────────────────────────

    async fn dependency_edges(&self) -> Result<Vec<(Uuid, Uuid)>> {
        let conn = self.conn.lock().await;
        Ok(load_edges(&conn).await?)
    }

    async fn unmet_dependencies(&self, id: Uuid) -> Result<usize> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM task_dependencies d JOIN tasks up ON up.id = d.depends_on
                 WHERE d.task_id = ?1 AND up.status != 'completed'",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("unmet_dependencies: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("unmet_dependencies row: {e}")))?;
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("unmet_dependencies row: {e}")).into()),
        }
    }

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(&self, id: Uuid, level: LogLevel, message: &str) -> Result<TaskLogEntry> {
        let conn = self.conn.lock().await;
        if status_of(&conn, id).await?.is_none() {
            return Err(TaskError::NotFound { id }.into());
        }

        let mut rows = conn
            .query(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM task_logs WHERE task_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;
        let sequence: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("append_log row: {e}")))?,
            Ok(None) => 1,
            Err(e) => return Err(DatabaseError::Query(format!("append_log row: {e}")).into()),
        };
        drop(rows);

        let entry = TaskLogEntry {
            task_id: id,
            sequence,
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
        };
        conn.execute(
            "INSERT INTO task_logs (task_id, sequence, timestamp, level, message) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                sequence,
                ts(&entry.timestamp),
                level.as_str(),
                message,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;

        Ok(entry)
    }

    async fn logs(&self, id: Uuid) -> Result<Vec<TaskLogEntry>> {
        let conn = self.conn.lock().await;
        if status_of(&conn, id).await?.is_none() {
            return Err(TaskError::NotFound { id }.into());
        }

        let mut rows = conn
            .query(
                "SELECT task_id, sequence, timestamp, level, message FROM task_logs
                 WHERE task_id = ?1 ORDER BY sequence ASC",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("logs: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("logs row: {e}")))?
        {
            entries.push(row_to_log(&row)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;
    use crate::task::NewTask;

    async fn test_db() -> LibSqlTaskStore {
        LibSqlTaskStore::new_memory().await.unwrap()
    }

    fn make_task(name: &str) -> Task {
        NewTask::new(name, "shell_command")
            .with_param("command", "echo hi")
            .into_task(3, Utc::now())
            .unwrap()
    }

    async fn complete(db: &LibSqlTaskStore, id: Uuid) {
        db.try_claim(id, Utc::now()).await.unwrap().unwrap();
        db.update(
            id,
            Box::new(|t: &mut Task| t.transition(TaskStatus::Completed, Utc::now())),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_open_transaction() {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let conn = db.connect().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (
                 parent_id INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED
             );",
        )
        .await
        .unwrap();

        begin(&conn).await.unwrap();
        conn.execute("INSERT INTO child (parent_id) VALUES (42)", ())
            .await
            .unwrap();
        assert!(commit(&conn).await.is_err());

        assert!(conn.is_autocommit());
        begin(&conn).await.unwrap();
        commit(&conn).await.unwrap();
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_get() {
        let db = test_db().await;
        let mut task = make_task("build");
        task.context.insert("branch".into(), "main".into());
        let id = task.id;

        let stored = db.create(task).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.sequence > 0);

        let fetched = db.get(id).await.unwrap();
        assert_eq!(fetched.name, "build");
        assert_eq!(fetched.parameters["command"], "echo hi");
        assert_eq!(fetched.context["branch"], "main");
        assert_eq!(fetched.max_retries, 3);
    }

    #[tokio::test]
    async fn get_not_found() {
        let db = test_db().await;
        let err = db.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::NotFound { .. })));
    }

    #[tokio::test]
    async fn unknown_dependency_rejected() {
        let db = test_db().await;
        let mut task = make_task("orphan");
        task.dependencies.insert(Uuid::new_v4());

        let err = db.create(task).await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::UnknownDependency { .. })));
    }

    #[tokio::test]
    async fn self_dependency_rejected_as_cycle() {
        let db = test_db().await;
        let mut task = make_task("ouroboros");
        task.dependencies.insert(task.id);

        let err = db.create(task).await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::Cycle { .. })));
    }

    #[tokio::test]
    async fn dependent_starts_blocked_and_loads_edges() {
        let db = test_db().await;
        let a = db.create(make_task("a")).await.unwrap();
        let mut b = make_task("b");
        b.dependencies.insert(a.id);
        let b = db.create(b).await.unwrap();

        assert_eq!(b.status, TaskStatus::Blocked);
        assert_eq!(b.dependencies, BTreeSet::from([a.id]));
        assert_eq!(db.unmet_dependencies(b.id).await.unwrap(), 1);
        assert_eq!(db.dependency_edges().await.unwrap(), vec![(b.id, a.id)]);

        complete(&db, a.id).await;
        assert_eq!(db.unmet_dependencies(b.id).await.unwrap(), 0);

        let mut c = make_task("c");
        c.dependencies.insert(a.id);
        assert_eq!(db.create(c).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn claim_requires_pending_and_completed_dependencies() {
        let db = test_db().await;
        let a = db.create(make_task("a")).await.unwrap();
        let mut b = make_task("b");
        b.dependencies.insert(a.id);
        let b = db.create(b).await.unwrap();

        // Forced to PENDING while `a` is still running: the claim must still refuse.
        db.update(
            b.id,
            Box::new(|t: &mut Task| t.transition(TaskStatus::Pending, Utc::now())),
        )
        .await
        .unwrap();
        assert!(db.try_claim(b.id, Utc::now()).await.unwrap().is_none());

        let claimed = db.try_claim(a.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(claimed.started_at.is_some());
        assert!(db.try_claim(a.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let db = Arc::new(test_db().await);
        let id = db.create(make_task("contended")).await.unwrap().id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.try_claim(id, Utc::now()).await.unwrap().is_some()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn terminal_tasks_cannot_be_updated() {
        let db = test_db().await;
        let id = db.create(make_task("done")).await.unwrap().id;
        complete(&db, id).await;

        let err = db
            .update(id, Box::new(|t: &mut Task| {
                t.progress = 5;
                Ok(())
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::Conflict { .. })));
        assert_eq!(db.get(id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn illegal_transition_is_conflict() {
        let db = test_db().await;
        let id = db.create(make_task("p")).await.unwrap().id;

        let err = db
            .update(id, Box::new(|t: &mut Task| {
                t.status = TaskStatus::Completed;
                Ok(())
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::Conflict { .. })));
    }

    #[tokio::test]
    async fn retry_count_bounded_by_max_retries() {
        let db = test_db().await;
        let id = db.create(make_task("r")).await.unwrap().id;

        let err = db
            .update(id, Box::new(|t: &mut Task| {
                t.retry_count = t.max_retries + 1;
                Ok(())
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn failure_fields_round_trip() {
        let db = test_db().await;
        let id = db.create(make_task("flaky")).await.unwrap().id;
        db.try_claim(id, Utc::now()).await.unwrap().unwrap();

        let retry_at = Utc::now() + chrono::Duration::seconds(30);
        db.update(
            id,
            Box::new(move |t: &mut Task| {
                t.transition(TaskStatus::Failed, Utc::now())?;
                t.retry_count = 1;
                t.retry_at = Some(retry_at);
                t.error = Some("exit status 1".into());
                t.error_kind = Some("application".into());
                Ok(())
            }),
        )
        .await
        .unwrap();

        let t = db.get(id).await.unwrap();
        assert!(t.awaiting_retry());
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.error_kind.as_deref(), Some("application"));
        assert_eq!(
            t.retry_at.map(|at| at.timestamp_micros()),
            Some(retry_at.timestamp_micros())
        );
    }

    #[tokio::test]
    async fn list_orders_by_priority_then_age() {
        let db = test_db().await;
        let mut low = make_task("low");
        low.priority = Priority::Low;
        let mut critical = make_task("critical");
        critical.priority = Priority::Critical;
        let mut high = make_task("high");
        high.priority = Priority::High;
        let mut high2 = make_task("high2");
        high2.priority = Priority::High;
        high2.created_at = high.created_at;

        for t in [low, critical, high, high2] {
            db.create(t).await.unwrap();
        }

        let names: Vec<String> = db
            .list(&TaskFilter::new().with_status(TaskStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["critical", "high", "high2", "low"]);

        let only_low = db
            .list(&TaskFilter::new().with_priority(Priority::Low))
            .await
            .unwrap();
        assert_eq!(only_low.len(), 1);

        let limited = db.list(&TaskFilter::new().with_limit(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn progress_only_recorded_while_running() {
        let db = test_db().await;
        let id = db.create(make_task("p")).await.unwrap().id;

        assert!(!db.set_progress(id, 50).await.unwrap());
        db.try_claim(id, Utc::now()).await.unwrap();
        assert!(db.set_progress(id, 50).await.unwrap());
        assert_eq!(db.get(id).await.unwrap().progress, 50);
    }

    // ── Log tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn log_sequence_is_per_task() {
        let db = test_db().await;
        let a = db.create(make_task("a")).await.unwrap().id;
        let b = db.create(make_task("b")).await.unwrap().id;

        db.append_log(a, LogLevel::Info, "one").await.unwrap();
        db.append_log(b, LogLevel::Info, "other").await.unwrap();
        let second = db.append_log(a, LogLevel::Warn, "two").await.unwrap();
        assert_eq!(second.sequence, 2);

        let logs = db.logs(a).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "one");
        assert_eq!(logs[1].level, LogLevel::Warn);

        let err = db.append_log(Uuid::new_v4(), LogLevel::Info, "x").await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::NotFound { .. })));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");

        let id = {
            let db = LibSqlTaskStore::new_local(&path).await.unwrap();
            let id = db.create(make_task("durable")).await.unwrap().id;
            db.append_log(id, LogLevel::Info, "created").await.unwrap();
            id
        };

        let db = LibSqlTaskStore::new_local(&path).await.unwrap();
        assert_eq!(db.get(id).await.unwrap().name, "durable");
        assert_eq!(db.logs(id).await.unwrap().len(), 1);
    }
}
