use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection as SqlConnection, OptionalExtension, Row};
use tracing::debug;

use refinery_core::error::{RefineryError, Result};
use refinery_core::status::{ExecutionStatus, StepStatus};
use refinery_core::traits::WorkflowStore;
use refinery_core::types::*;

use crate::schema::SCHEMA;

const AGENT_COLUMNS: &str =
    "id, name, display_name, sort_order, is_active, system_prompt, user_prompt_template";
const CONNECTION_COLUMNS: &str = "id, source_agent_id, target_agent_id, is_active";
const EXECUTION_COLUMNS: &str =
    "id, cv_id, status, created_at, started_at, completed_at, error, input_data, output_data";
const STEP_COLUMNS: &str = "id, execution_id, agent_id, status, started_at, completed_at, \
     job_id, input_data, output_data, error";

/// SQLite-backed workflow store.
///
/// All access goes through one connection behind a mutex, so every method sees
/// a consistent view and multi-statement writes run in a transaction.
pub struct SqliteStore {
    conn: Mutex<SqlConnection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RefineryError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn =
            SqlConnection::open(path).map_err(|e| RefineryError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| RefineryError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| RefineryError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            SqlConnection::open_in_memory().map_err(|e| RefineryError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| RefineryError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SqlConnection>> {
        self.conn
            .lock()
            .map_err(|e| RefineryError::Database(e.to_string()))
    }
}

fn ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339())
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_status<T: FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// `'a','b'` list for a status guard. Values come from `as_str`, never user input.
fn status_list<'a>(statuses: impl IntoIterator<Item = &'a str>) -> String {
    statuses
        .into_iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(",")
}

fn agent_from_row(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        order: row.get(3)?,
        is_active: row.get(4)?,
        system_prompt: row.get(5)?,
        user_prompt_template: row.get(6)?,
    })
}

fn connection_from_row(row: &Row) -> rusqlite::Result<Connection> {
    Ok(Connection {
        id: row.get(0)?,
        source_agent_id: row.get(1)?,
        target_agent_id: row.get(2)?,
        is_active: row.get(3)?,
    })
}

fn execution_from_row(row: &Row) -> rusqlite::Result<WorkflowExecution> {
    Ok(WorkflowExecution {
        id: row.get(0)?,
        cv_id: row.get(1)?,
        status: parse_status(2, row.get(2)?)?,
        created_at: parse_ts(row.get(3)?).unwrap_or_else(Utc::now),
        started_at: parse_ts(row.get(4)?),
        completed_at: parse_ts(row.get(5)?),
        error: row.get(6)?,
        input_data: row.get(7)?,
        output_data: row.get(8)?,
    })
}

fn step_from_row(row: &Row) -> rusqlite::Result<WorkflowStep> {
    Ok(WorkflowStep {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        agent_id: row.get(2)?,
        status: parse_status(3, row.get(3)?)?,
        started_at: parse_ts(row.get(4)?),
        completed_at: parse_ts(row.get(5)?),
        job_id: row.get(6)?,
        input_data: row.get(7)?,
        output_data: row.get(8)?,
        error: row.get(9)?,
    })
}

fn query_agent(conn: &SqlConnection, column: &str, value: &str) -> Result<Option<Agent>> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE {column} = ?1"),
        params![value],
        agent_from_row,
    )
    .optional()
    .map_err(|e| RefineryError::Database(e.to_string()))
}

fn query_execution(conn: &SqlConnection, id: &str) -> Result<Option<WorkflowExecution>> {
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
        params![id],
        execution_from_row,
    )
    .optional()
    .map_err(|e| RefineryError::Database(e.to_string()))
}

fn query_steps(conn: &SqlConnection, execution_id: &str) -> Result<Vec<WorkflowStep>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE execution_id = ?1 ORDER BY rowid"
        ))
        .map_err(|e| RefineryError::Database(e.to_string()))?;

    let rows = stmt
        .query_map(params![execution_id], step_from_row)
        .map_err(|e| RefineryError::Database(e.to_string()))?;

    let mut steps = Vec::new();
    for row in rows {
        steps.push(row.map_err(|e| RefineryError::Database(e.to_string()))?);
    }
    Ok(steps)
}

impl WorkflowStore for SqliteStore {
    fn list_agents(&self, active_only: bool) -> BoxFuture<'_, Result<Vec<Agent>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let filter = if active_only { "WHERE is_active = 1" } else { "" };
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents {filter} ORDER BY sort_order, name"
                ))
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let rows = stmt
                .query_map([], agent_from_row)
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let mut agents = Vec::new();
            for row in rows {
                agents.push(row.map_err(|e| RefineryError::Database(e.to_string()))?);
            }
            Ok(agents)
        })
    }

    fn get_agent(&self, id: &str) -> BoxFuture<'_, Result<Option<Agent>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            query_agent(&conn, "id", &id)
        })
    }

    fn get_agent_by_name(&self, name: &str) -> BoxFuture<'_, Result<Option<Agent>>> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            query_agent(&conn, "name", &name)
        })
    }

    fn upsert_agent(&self, agent: Agent) -> BoxFuture<'_, Result<Agent>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO agents (id, name, display_name, sort_order, is_active,
                                     system_prompt, user_prompt_template)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                     display_name = excluded.display_name,
                     sort_order = excluded.sort_order,
                     is_active = excluded.is_active,
                     system_prompt = excluded.system_prompt,
                     user_prompt_template = excluded.user_prompt_template",
                params![
                    agent.id,
                    agent.name,
                    agent.display_name,
                    agent.order,
                    agent.is_active,
                    agent.system_prompt,
                    agent.user_prompt_template,
                ],
            )
            .map_err(|e| RefineryError::Database(e.to_string()))?;

            query_agent(&conn, "name", &agent.name)?
                .ok_or_else(|| RefineryError::AgentNotFound(agent.name.clone()))
        })
    }

    fn delete_agent(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn
                .transaction()
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let edges = tx
                .execute(
                    "DELETE FROM connections WHERE source_agent_id = ?1 OR target_agent_id = ?1",
                    params![id],
                )
                .map_err(|e| RefineryError::Database(e.to_string()))?;
            let deleted = tx
                .execute("DELETE FROM agents WHERE id = ?1", params![id])
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            tx.commit()
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            debug!(agent_id = %id, connections = edges, "Agent deleted");
            Ok(deleted > 0)
        })
    }

    fn list_connections(&self, active_only: bool) -> BoxFuture<'_, Result<Vec<Connection>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let filter = if active_only { "WHERE is_active = 1" } else { "" };
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CONNECTION_COLUMNS} FROM connections {filter} ORDER BY rowid"
                ))
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let rows = stmt
                .query_map([], connection_from_row)
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let mut connections = Vec::new();
            for row in rows {
                connections.push(row.map_err(|e| RefineryError::Database(e.to_string()))?);
            }
            Ok(connections)
        })
    }

    fn create_connection(&self, connection: Connection) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            if connection.is_self_edge() {
                return Err(RefineryError::InvalidConnection(format!(
                    "agent {} cannot connect to itself",
                    connection.source_agent_id
                )));
            }

            let mut conn = self.lock()?;
            let tx = conn
                .transaction()
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            for agent_id in [&connection.source_agent_id, &connection.target_agent_id] {
                if query_agent(&tx, "id", agent_id)?.is_none() {
                    return Err(RefineryError::InvalidConnection(format!(
                        "unknown agent {agent_id}"
                    )));
                }
            }

            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM connections
                                   WHERE source_agent_id = ?1 AND target_agent_id = ?2)",
                    params![connection.source_agent_id, connection.target_agent_id],
                    |row| row.get(0),
                )
                .map_err(|e| RefineryError::Database(e.to_string()))?;
            if exists {
                return Err(RefineryError::InvalidConnection(format!(
                    "connection {} -> {} already exists",
                    connection.source_agent_id, connection.target_agent_id
                )));
            }

            tx.execute(
                "INSERT INTO connections (id, source_agent_id, target_agent_id, is_active)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    connection.id,
                    connection.source_agent_id,
                    connection.target_agent_id,
                    connection.is_active,
                ],
            )
            .map_err(|e| RefineryError::Database(e.to_string()))?;

            tx.commit()
                .map_err(|e| RefineryError::Database(e.to_string()))?;
            Ok(connection)
        })
    }

    fn set_connection_active(&self, id: &str, active: bool) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE connections SET is_active = ?1 WHERE id = ?2",
                    params![active, id],
                )
                .map_err(|e| RefineryError::Database(e.to_string()))?;
            Ok(changed > 0)
        })
    }

    fn delete_connection(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute("DELETE FROM connections WHERE id = ?1", params![id])
                .map_err(|e| RefineryError::Database(e.to_string()))?;
            Ok(changed > 0)
        })
    }

    fn create_execution(
        &self,
        execution: WorkflowExecution,
        steps: Vec<WorkflowStep>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn
                .transaction()
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            tx.execute(
                &format!(
                    "INSERT INTO executions ({EXECUTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    execution.id,
                    execution.cv_id,
                    execution.status.as_str(),
                    execution.created_at.to_rfc3339(),
                    ts(execution.started_at),
                    ts(execution.completed_at),
                    execution.error,
                    execution.input_data,
                    execution.output_data,
                ],
            )
            .map_err(|e| RefineryError::Database(e.to_string()))?;

            for step in &steps {
                tx.execute(
                    &format!(
                        "INSERT INTO steps ({STEP_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                    ),
                    params![
                        step.id,
                        step.execution_id,
                        step.agent_id,
                        step.status.as_str(),
                        ts(step.started_at),
                        ts(step.completed_at),
                        step.job_id,
                        step.input_data,
                        step.output_data,
                        step.error,
                    ],
                )
                .map_err(|e| RefineryError::StepPersistence {
                    execution_id: execution.id.clone(),
                    agent_id: step.agent_id.clone(),
                    message: e.to_string(),
                })?;
            }

            tx.commit()
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            debug!(execution_id = %execution.id, steps = steps.len(), "Execution created");
            Ok(())
        })
    }

    fn get_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowExecution>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            query_execution(&conn, &id)
        })
    }

    fn list_executions(
        &self,
        statuses: &[ExecutionStatus],
    ) -> BoxFuture<'_, Result<Vec<WorkflowExecution>>> {
        let filter = status_list(statuses.iter().map(|s| s.as_str()));
        Box::pin(async move {
            if filter.is_empty() {
                return Ok(Vec::new());
            }
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions
                     WHERE status IN ({filter}) ORDER BY rowid"
                ))
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let rows = stmt
                .query_map([], execution_from_row)
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let mut executions = Vec::new();
            for row in rows {
                executions.push(row.map_err(|e| RefineryError::Database(e.to_string()))?);
            }
            Ok(executions)
        })
    }

    fn list_steps(&self, execution_id: &str) -> BoxFuture<'_, Result<Vec<WorkflowStep>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            query_steps(&conn, &execution_id)
        })
    }

    fn load_snapshot(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionSnapshot>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let Some(execution) = query_execution(&conn, &execution_id)? else {
                return Ok(None);
            };
            let steps = query_steps(&conn, &execution_id)?;
            Ok(Some(ExecutionSnapshot { execution, steps }))
        })
    }

    fn update_execution(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        update: ExecutionUpdate,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        let guard = status_list(from.iter().map(|s| s.as_str()));
        Box::pin(async move {
            if guard.is_empty() {
                return Ok(false);
            }
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE executions SET
                             status = COALESCE(?1, status),
                             started_at = COALESCE(?2, started_at),
                             completed_at = COALESCE(?3, completed_at),
                             error = COALESCE(?4, error),
                             output_data = COALESCE(?5, output_data)
                         WHERE id = ?6 AND status IN ({guard})"
                    ),
                    params![
                        update.status.map(|s| s.as_str()),
                        ts(update.started_at),
                        ts(update.completed_at),
                        update.error,
                        update.output_data,
                        id,
                    ],
                )
                .map_err(|e| RefineryError::Database(e.to_string()))?;
            Ok(changed > 0)
        })
    }

    fn update_step(
        &self,
        execution_id: &str,
        agent_id: &str,
        from: &[StepStatus],
        update: StepUpdate,
    ) -> BoxFuture<'_, Result<bool>> {
        let execution_id = execution_id.to_string();
        let agent_id = agent_id.to_string();
        let guard = status_list(from.iter().map(|s| s.as_str()));
        Box::pin(async move {
            if guard.is_empty() {
                return Ok(false);
            }
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE steps SET
                             status = COALESCE(?1, status),
                             started_at = COALESCE(?2, started_at),
                             completed_at = COALESCE(?3, completed_at),
                             job_id = COALESCE(?4, job_id),
                             input_data = COALESCE(?5, input_data),
                             output_data = COALESCE(?6, output_data),
                             error = COALESCE(?7, error)
                         WHERE execution_id = ?8 AND agent_id = ?9 AND status IN ({guard})"
                    ),
                    params![
                        update.status.map(|s| s.as_str()),
                        ts(update.started_at),
                        ts(update.completed_at),
                        update.job_id,
                        update.input_data,
                        update.output_data,
                        update.error,
                        execution_id,
                        agent_id,
                    ],
                )
                .map_err(|e| RefineryError::StepPersistence {
                    execution_id: execution_id.clone(),
                    agent_id: agent_id.clone(),
                    message: e.to_string(),
                })?;
            Ok(changed > 0)
        })
    }

    fn cancel_execution(&self, id: &str) -> BoxFuture<'_, Result<CancelOutcome>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn
                .transaction()
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let raw: Option<String> = tx
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RefineryError::Database(e.to_string()))?;
            let Some(raw) = raw else {
                return Ok(CancelOutcome::NotFound);
            };
            let status: ExecutionStatus = raw.parse().map_err(RefineryError::Database)?;
            if status.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(status));
            }

            let now = Utc::now().to_rfc3339();
            tx.execute(
                &format!(
                    "UPDATE executions SET status = 'cancelled', completed_at = ?1
                     WHERE id = ?2 AND status IN ({})",
                    status_list(ExecutionStatus::CANCELLABLE.iter().map(|s| s.as_str()))
                ),
                params![now, id],
            )
            .map_err(|e| RefineryError::Database(e.to_string()))?;

            let skipped_steps = tx
                .execute(
                    &format!(
                        "UPDATE steps SET status = 'skipped', completed_at = ?1
                         WHERE execution_id = ?2 AND status IN ({})",
                        status_list(StepStatus::OPEN.iter().map(|s| s.as_str()))
                    ),
                    params![now, id],
                )
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            tx.commit()
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            debug!(execution_id = %id, skipped_steps, "Execution cancelled");
            Ok(CancelOutcome::Cancelled { skipped_steps })
        })
    }

    fn append_audit(&self, entry: AuditEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO audit_log (execution_id, agent_id, action, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.execution_id,
                    entry.agent_id,
                    entry.action,
                    entry.detail,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| RefineryError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn list_audit(&self, execution_id: &str) -> BoxFuture<'_, Result<Vec<AuditEntry>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT execution_id, agent_id, action, detail, created_at
                     FROM audit_log WHERE execution_id = ?1 ORDER BY id",
                )
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let rows = stmt
                .query_map(params![execution_id], |row| {
                    Ok(AuditEntry {
                        execution_id: row.get(0)?,
                        agent_id: row.get(1)?,
                        action: row.get(2)?,
                        detail: row.get(3)?,
                        created_at: parse_ts(row.get(4)?).unwrap_or_else(Utc::now),
                    })
                })
                .map_err(|e| RefineryError::Database(e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| RefineryError::Database(e.to_string()))?);
            }
            Ok(entries)
        })
    }
}
