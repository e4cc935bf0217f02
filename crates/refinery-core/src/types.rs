use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::status::{ExecutionStatus, StepStatus};

/// A named processing step that transforms a document given a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Stable key, unique across agents.
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub order: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// User prompt with `{{document}}` / `{{agent_name}}` placeholders.
    #[serde(default)]
    pub user_prompt_template: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Agent {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            display_name: display_name.into(),
            order: 0,
            is_active: true,
            system_prompt: None,
            user_prompt_template: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_user_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.user_prompt_template = Some(template.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// A directed dependency from one agent to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source_agent_id: String,
    pub target_agent_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Connection {
    pub fn new(source_agent_id: impl Into<String>, target_agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_agent_id: source_agent_id.into(),
            target_agent_id: target_agent_id.into(),
            is_active: true,
        }
    }

    pub fn is_self_edge(&self) -> bool {
        self.source_agent_id == self.target_agent_id
    }
}

/// One end-to-end run of the compiled workflow over one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    /// Reference to the document being refined.
    pub cv_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// The original document text.
    pub input_data: Option<String>,
    pub output_data: Option<String>,
}

impl WorkflowExecution {
    pub fn new(cv_id: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cv_id: cv_id.into(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            input_data: Some(document.into()),
            output_data: None,
        }
    }
}

/// Per-execution record of one agent's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub execution_id: String,
    pub agent_id: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub job_id: Option<String>,
    pub input_data: Option<String>,
    pub output_data: Option<String>,
    pub error: Option<String>,
}

impl WorkflowStep {
    pub fn new(execution_id: impl Into<String>, agent_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            agent_id: agent_id.into(),
            status,
            started_at: None,
            completed_at: None,
            job_id: None,
            input_data: None,
            output_data: None,
            error: None,
        }
    }
}

/// Execution row plus all of its steps, read under one lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution: WorkflowExecution,
    pub steps: Vec<WorkflowStep>,
}

/// Append-only record written for every successful step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub execution_id: String,
    pub agent_id: String,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        execution_id: impl Into<String>,
        agent_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            agent_id: agent_id.into(),
            action: action.into(),
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Conditional write applied to an execution row.
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub output_data: Option<String>,
}

impl ExecutionUpdate {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Conditional write applied to a step row.
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub job_id: Option<String>,
    pub input_data: Option<String>,
    pub output_data: Option<String>,
    pub error: Option<String>,
}

impl StepUpdate {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Outcome of an atomic cancellation attempt in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { skipped_steps: usize },
    AlreadyTerminal(ExecutionStatus),
    NotFound,
}

/// Stable queue job identifier.
///
/// Agent jobs are `{execution_id}:{agent_id}`, so the same agent always maps to the
/// same job within one execution. The orchestration job is `{execution_id}#orchestrate`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct JobId(pub String);

const ORCHESTRATE_SUFFIX: &str = "#orchestrate";

impl JobId {
    pub fn for_step(execution_id: &str, agent_id: &str) -> Self {
        Self(format!("{execution_id}:{agent_id}"))
    }

    pub fn orchestration(execution_id: &str) -> Self {
        Self(format!("{execution_id}{ORCHESTRATE_SUFFIX}"))
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_orchestration(&self) -> bool {
        self.0.ends_with(ORCHESTRATE_SUFFIX)
    }

    /// Execution this job belongs to.
    pub fn execution_id(&self) -> &str {
        if let Some(exec) = self.0.strip_suffix(ORCHESTRATE_SUFFIX) {
            return exec;
        }
        self.0.split_once(':').map(|(e, _)| e).unwrap_or(&self.0)
    }

    /// Agent this job runs, `None` for the orchestration job.
    pub fn agent_id(&self) -> Option<&str> {
        if self.is_orchestration() {
            return None;
        }
        self.0.split_once(':').map(|(_, a)| a)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data an agent job needs to run its step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepJobData {
    pub execution_id: String,
    pub cv_id: String,
    pub agent_id: String,
    pub agent_name: String,
}

/// What a queued job does when a worker picks it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Mark the execution running and submit its compiled flow.
    Orchestrate { execution_id: String, flow: JobFlow },
    /// Run one agent step.
    RunAgent(StepJobData),
}

/// A job description with its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub payload: JobPayload,
    /// Jobs that must complete before this one is dispatched.
    #[serde(default)]
    pub children: Vec<JobId>,
    /// Whether a terminal failure of this job fails the jobs waiting on it.
    #[serde(default = "default_true")]
    pub fail_parent_on_failure: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl JobSpec {
    pub fn new(id: JobId, payload: JobPayload) -> Self {
        Self {
            id,
            payload,
            children: vec![],
            fail_parent_on_failure: true,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_children(mut self, children: Vec<JobId>) -> Self {
        self.children = children;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fail_parent_on_failure(mut self, fail_parent: bool) -> Self {
        self.fail_parent_on_failure = fail_parent;
        self
    }
}

/// A compiled set of jobs, children listed before the parents that wait on them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFlow {
    pub jobs: Vec<JobSpec>,
}

impl JobFlow {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn get(&self, id: &JobId) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    /// Jobs no other job in the flow waits on.
    pub fn top_level(&self) -> Vec<&JobId> {
        self.jobs
            .iter()
            .filter(|j| !self.jobs.iter().any(|other| other.children.contains(&j.id)))
            .map(|j| &j.id)
            .collect()
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub id: JobId,
    pub payload: JobPayload,
    /// 1-based attempt number of this run.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl ActiveJob {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Result an agent job returns for the jobs that depend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub agent_id: String,
    pub output: String,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn success(agent_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            output: output.into(),
            success: true,
            finished_at: Utc::now(),
        }
    }

    /// Result for a job that ran after its execution became terminal.
    pub fn skipped(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            output: String::new(),
            success: false,
            finished_at: Utc::now(),
        }
    }
}

/// Lifecycle event broadcast on the event bus.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A job finished successfully.
    JobCompleted {
        job_id: JobId,
        result: serde_json::Value,
    },
    /// A job failed terminally (retries exhausted or cascaded).
    JobFailed { job_id: JobId, error: String },
    /// A job attempt failed and will be retried.
    JobRetrying {
        job_id: JobId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    ExecutionStarted { execution_id: String },
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
    },
}

impl WorkflowEvent {
    /// Execution the event concerns.
    pub fn execution_id(&self) -> &str {
        match self {
            Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobRetrying { job_id, .. } => job_id.execution_id(),
            Self::ExecutionStarted { execution_id }
            | Self::ExecutionFinished { execution_id, .. } => execution_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobRetrying { .. } => "job_retrying",
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionFinished { .. } => "execution_finished",
        }
    }
}
