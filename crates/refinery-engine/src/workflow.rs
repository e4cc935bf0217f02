use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use refinery_core::config::{AppConfig, RetryPolicy};
use refinery_core::error::{RefineryError, Result};
use refinery_core::event::EventBus;
use refinery_core::status::{ExecutionStatus, StepStatus};
use refinery_core::traits::{JobQueue, WorkflowStore};
use refinery_core::types::{
    Agent, Connection, ExecutionUpdate, JobFlow, JobId, JobPayload, JobSpec, StepUpdate,
    WorkflowEvent, WorkflowExecution, WorkflowStep,
};
use refinery_graph::{Graph, GraphValidator, WorkflowCompiler};

use crate::tracker::{CancelReport, ExecutionReport, ProgressTracker};

/// Counts from seeding agents and connections out of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub agents: usize,
    pub connections: usize,
    /// Connections that already existed.
    pub skipped_connections: usize,
}

/// Outcome of resuming executions left open by a previous process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Executions whose orchestration job was submitted again.
    pub resumed: usize,
    /// Executions failed because they could no longer be resumed.
    pub interrupted: usize,
}

/// Entry point for graph reads and execution control.
pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn JobQueue>,
    event_bus: Arc<EventBus>,
    tracker: Arc<ProgressTracker>,
    validator: GraphValidator,
    compiler: WorkflowCompiler,
    orchestration_retry: RetryPolicy,
}

impl WorkflowService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn JobQueue>,
        event_bus: Arc<EventBus>,
        tracker: Arc<ProgressTracker>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            queue,
            event_bus,
            tracker,
            validator: GraphValidator::new().excluding(config.graph.excluded_agents.clone()),
            compiler: WorkflowCompiler::from_config(&config.queue),
            orchestration_retry: config.queue.orchestration.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Current graph view. With `include_inactive`, inactive agents and
    /// connections appear as well.
    pub async fn graph(&self, include_inactive: bool) -> Result<Graph> {
        let active_only = !include_inactive;
        let agents = self.store.list_agents(active_only).await?;
        let connections = self.store.list_connections(active_only).await?;

        let validator = if include_inactive {
            self.validator.clone().include_inactive()
        } else {
            self.validator.clone()
        };
        Ok(validator.build(&agents, &connections))
    }

    /// Validate and compile the active graph, persist the execution with one
    /// step per agent, and submit its orchestration job.
    ///
    /// Nothing is persisted when validation fails.
    pub async fn start(&self, cv_id: &str, document: &str) -> Result<String> {
        let graph = self.graph(false).await?;
        if !graph.is_valid {
            warn!(errors = ?graph.validation_errors, "Refusing to start invalid graph");
            return Err(RefineryError::GraphCycle);
        }

        let execution = WorkflowExecution::new(cv_id, document);
        let execution_id = execution.id.clone();
        let flow = self.compiler.compile(&graph, &execution_id, cv_id)?;

        let steps = graph
            .nodes
            .iter()
            .map(|node| {
                let status = if node.inputs.is_empty() {
                    StepStatus::Pending
                } else {
                    StepStatus::WaitingInputs
                };
                WorkflowStep::new(&execution_id, &node.id, status)
            })
            .collect::<Vec<_>>();
        let step_count = steps.len();
        self.store.create_execution(execution, steps).await?;

        if let Err(e) = self.queue.submit(self.orchestration_job(&execution_id, flow)).await {
            error!(execution_id = %execution_id, error = %e, "Failed to submit orchestration job");
            let mut update = ExecutionUpdate::status(ExecutionStatus::Failed);
            update.error = Some(e.to_string());
            update.completed_at = Some(Utc::now());
            self.store
                .update_execution(&execution_id, &[ExecutionStatus::Pending], update)
                .await?;
            return Err(e);
        }

        info!(execution_id = %execution_id, cv_id, steps = step_count, "Execution started");
        self.event_bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
        });
        Ok(execution_id)
    }

    fn orchestration_job(&self, execution_id: &str, flow: JobFlow) -> JobSpec {
        JobSpec::new(
            JobId::orchestration(execution_id),
            JobPayload::Orchestrate {
                execution_id: execution_id.to_string(),
                flow,
            },
        )
        .with_retry(self.orchestration_retry.clone())
    }

    /// Resume executions created before `before` that are still pending or
    /// running, typically after a restart emptied the in-process queue.
    ///
    /// The current graph is compiled again and submitted through the usual
    /// orchestration job. Steps that already completed replay their stored
    /// output. An execution whose steps no longer match the graph, or that
    /// already has a failed or skipped step, is failed as interrupted.
    pub async fn recover(&self, before: DateTime<Utc>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let open = self
            .store
            .list_executions(&ExecutionStatus::CANCELLABLE)
            .await?;
        if open.iter().all(|e| e.created_at >= before) {
            return Ok(report);
        }
        let graph = self.graph(false).await?;

        for execution in open.into_iter().filter(|e| e.created_at < before) {
            let steps = self.store.list_steps(&execution.id).await?;
            match self.resumable_flow(&graph, &execution, &steps) {
                Ok(flow) => {
                    self.queue
                        .submit(self.orchestration_job(&execution.id, flow))
                        .await?;
                    info!(execution_id = %execution.id, status = %execution.status, "Execution resumed");
                    report.resumed += 1;
                }
                Err(reason) => {
                    self.interrupt(&execution.id, &reason).await?;
                    report.interrupted += 1;
                }
            }
        }
        Ok(report)
    }

    fn resumable_flow(
        &self,
        graph: &Graph,
        execution: &WorkflowExecution,
        steps: &[WorkflowStep],
    ) -> std::result::Result<JobFlow, String> {
        if !graph.is_valid {
            return Err("graph is no longer valid".into());
        }
        if steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
        {
            return Err("step outcome lost before restart".into());
        }
        let stepped: HashSet<&str> = steps.iter().map(|s| s.agent_id.as_str()).collect();
        let current: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        if stepped != current {
            return Err("graph changed since the execution started".into());
        }
        self.compiler
            .compile(graph, &execution.id, &execution.cv_id)
            .map_err(|e| e.to_string())
    }

    async fn interrupt(&self, execution_id: &str, reason: &str) -> Result<()> {
        let error = format!("interrupted: {reason}");
        let mut update = ExecutionUpdate::status(ExecutionStatus::Failed);
        update.error = Some(error.clone());
        update.completed_at = Some(Utc::now());
        let changed = self
            .store
            .update_execution(execution_id, &ExecutionStatus::CANCELLABLE, update)
            .await?;
        if !changed {
            return Ok(());
        }

        for step in self.store.list_steps(execution_id).await? {
            let mut update = StepUpdate::status(StepStatus::Failed);
            update.error = Some(error.clone());
            update.completed_at = Some(Utc::now());
            self.store
                .update_step(execution_id, &step.agent_id, &StepStatus::OPEN, update)
                .await?;
        }

        warn!(execution_id, reason, "Execution interrupted");
        self.event_bus.publish(WorkflowEvent::ExecutionFinished {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Failed,
        });
        Ok(())
    }

    /// Run the orchestration job: move the execution to running and submit its
    /// step jobs. Returns the number of jobs submitted.
    pub async fn orchestrate(&self, execution_id: &str, flow: JobFlow) -> Result<usize> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| RefineryError::ExecutionNotFound(execution_id.to_string()))?;
        if execution.status.is_terminal() {
            debug!(execution_id, status = %execution.status, "Execution already terminal");
            return Ok(0);
        }

        let mut update = ExecutionUpdate::status(ExecutionStatus::Running);
        update.started_at = Some(Utc::now());
        let started = self
            .store
            .update_execution(execution_id, &[ExecutionStatus::Pending], update)
            .await?;
        // A retried orchestration attempt finds the execution already running
        if !started && execution.status != ExecutionStatus::Running {
            debug!(execution_id, "Execution left pending before orchestration");
            return Ok(0);
        }

        if flow.is_empty() {
            self.tracker.try_finalize(execution_id).await?;
            return Ok(0);
        }

        let jobs = flow.len();
        self.queue.submit_flow(flow).await?;
        debug!(execution_id, jobs, "Step jobs submitted");
        Ok(jobs)
    }

    pub async fn status(&self, execution_id: &str) -> Result<ExecutionReport> {
        self.tracker.status(execution_id).await
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<CancelReport> {
        self.tracker.cancel(execution_id).await
    }

    pub async fn list_agents(&self, active_only: bool) -> Result<Vec<Agent>> {
        self.store.list_agents(active_only).await
    }

    pub async fn create_connection(&self, source: &str, target: &str) -> Result<Connection> {
        let source_id = self.resolve_agent(source).await?;
        let target_id = self.resolve_agent(target).await?;
        self.store
            .create_connection(Connection::new(source_id, target_id))
            .await
    }

    pub async fn delete_connection(&self, id: &str) -> Result<bool> {
        self.store.delete_connection(id).await
    }

    pub async fn set_connection_active(&self, id: &str, active: bool) -> Result<bool> {
        self.store.set_connection_active(id, active).await
    }

    /// Accept either an agent id or an agent name.
    async fn resolve_agent(&self, key: &str) -> Result<String> {
        if let Some(agent) = self.store.get_agent(key).await? {
            return Ok(agent.id);
        }
        match self.store.get_agent_by_name(key).await? {
            Some(agent) => Ok(agent.id),
            None => Err(RefineryError::InvalidConnection(format!(
                "unknown agent '{key}'"
            ))),
        }
    }

    /// Upsert the configured agents by name, then add the configured
    /// connections that do not exist yet.
    pub async fn seed(&self, config: &AppConfig) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        let mut ids: HashMap<String, String> = HashMap::new();

        for seed in &config.agents {
            let display_name = seed.display_name.clone().unwrap_or_else(|| seed.name.clone());
            let mut agent = Agent::new(&seed.name, display_name).with_order(seed.order);
            agent.is_active = seed.is_active;
            agent.system_prompt = seed.system_prompt.clone();
            agent.user_prompt_template = seed.user_prompt_template.clone();

            let stored = self.store.upsert_agent(agent).await?;
            ids.insert(stored.name.clone(), stored.id);
            report.agents += 1;
        }

        let existing = self.store.list_connections(false).await?;
        for seed in &config.connections {
            let source = match ids.get(&seed.source) {
                Some(id) => id.clone(),
                None => self.resolve_agent(&seed.source).await?,
            };
            let target = match ids.get(&seed.target) {
                Some(id) => id.clone(),
                None => self.resolve_agent(&seed.target).await?,
            };

            if existing
                .iter()
                .any(|c| c.source_agent_id == source && c.target_agent_id == target)
            {
                report.skipped_connections += 1;
                continue;
            }
            self.store
                .create_connection(Connection::new(source, target))
                .await?;
            report.connections += 1;
        }

        info!(
            agents = report.agents,
            connections = report.connections,
            skipped = report.skipped_connections,
            "Seeded workflow graph"
        );
        Ok(report)
    }
}
