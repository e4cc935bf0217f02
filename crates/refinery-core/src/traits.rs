use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::status::{ExecutionStatus, StepStatus};
use crate::types::*;

/// Text-generation backend: one request, one response.
pub trait AgentProcessor: Send + Sync + 'static {
    /// Backend name for logs (e.g., "openai").
    fn name(&self) -> &str;

    /// Run one prompt and return the generated text. No internal retry.
    fn process(&self, system_prompt: &str, user_prompt: &str) -> BoxFuture<'_, Result<String>>;
}

/// Work performed when a queue worker picks up a job.
///
/// An `Err` counts as a failed attempt and is subject to the job's retry policy.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: ActiveJob) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Job queue with parent/child dependencies.
///
/// A job is not dispatched until all of its children completed. Lifecycle
/// events are published on the queue's event bus.
pub trait JobQueue: Send + Sync + 'static {
    /// Add a single job. Ids already known to the queue are ignored.
    fn submit(&self, job: JobSpec) -> BoxFuture<'_, Result<()>>;

    /// Add a whole flow. Children must be listed before their parents.
    fn submit_flow(&self, flow: JobFlow) -> BoxFuture<'_, Result<()>>;

    /// Results of the completed children of a job, keyed by child id.
    fn children_results(
        &self,
        job_id: &JobId,
    ) -> BoxFuture<'_, Result<HashMap<JobId, serde_json::Value>>>;

    /// Remove a job that has not started yet. Returns false if it is running,
    /// settled, or unknown.
    fn remove(&self, job_id: &JobId) -> BoxFuture<'_, Result<bool>>;
}

/// Persistence for agents, connections, executions and steps.
///
/// Status writes are conditional: they apply only while the current status is
/// one of `from`, and report whether a row changed.
pub trait WorkflowStore: Send + Sync + 'static {
    // Agents
    fn list_agents(&self, active_only: bool) -> BoxFuture<'_, Result<Vec<Agent>>>;

    fn get_agent(&self, id: &str) -> BoxFuture<'_, Result<Option<Agent>>>;

    fn get_agent_by_name(&self, name: &str) -> BoxFuture<'_, Result<Option<Agent>>>;

    /// Insert, or update the agent with the same name. Returns the stored row.
    fn upsert_agent(&self, agent: Agent) -> BoxFuture<'_, Result<Agent>>;

    /// Delete an agent together with its connections.
    fn delete_agent(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    // Connections
    fn list_connections(&self, active_only: bool) -> BoxFuture<'_, Result<Vec<Connection>>>;

    /// Rejects self-edges, unknown endpoints and duplicate pairs.
    fn create_connection(&self, connection: Connection) -> BoxFuture<'_, Result<Connection>>;

    fn set_connection_active(&self, id: &str, active: bool) -> BoxFuture<'_, Result<bool>>;

    fn delete_connection(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    // Executions
    /// Insert an execution with its step rows in one transaction.
    fn create_execution(
        &self,
        execution: WorkflowExecution,
        steps: Vec<WorkflowStep>,
    ) -> BoxFuture<'_, Result<()>>;

    fn get_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowExecution>>>;

    /// Executions currently in one of `statuses`, in creation order.
    fn list_executions(
        &self,
        statuses: &[ExecutionStatus],
    ) -> BoxFuture<'_, Result<Vec<WorkflowExecution>>>;

    fn list_steps(&self, execution_id: &str) -> BoxFuture<'_, Result<Vec<WorkflowStep>>>;

    /// Execution and steps read together.
    fn load_snapshot(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionSnapshot>>>;

    fn update_execution(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        update: ExecutionUpdate,
    ) -> BoxFuture<'_, Result<bool>>;

    fn update_step(
        &self,
        execution_id: &str,
        agent_id: &str,
        from: &[StepStatus],
        update: StepUpdate,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Cancel a pending or running execution and skip its open steps atomically.
    fn cancel_execution(&self, id: &str) -> BoxFuture<'_, Result<CancelOutcome>>;

    // Audit
    fn append_audit(&self, entry: AuditEntry) -> BoxFuture<'_, Result<()>>;

    fn list_audit(&self, execution_id: &str) -> BoxFuture<'_, Result<Vec<AuditEntry>>>;
}
