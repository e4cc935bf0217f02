use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use refinery_core::error::{RefineryError, Result};
use refinery_core::event::EventBus;
use refinery_core::status::{ExecutionStatus, StepStatus};
use refinery_core::traits::{JobQueue, WorkflowStore};
use refinery_core::types::{
    CancelOutcome, ExecutionUpdate, JobId, StepResult, StepUpdate, WorkflowEvent, WorkflowStep,
};

/// Completed-step summary of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    /// `round(completed / total * 100)`, 0 when there are no steps.
    pub percentage: u32,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u32
        };
        Self {
            completed,
            total,
            percentage,
        }
    }

    pub fn from_steps(steps: &[WorkflowStep]) -> Self {
        let completed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        Self::new(completed, steps.len())
    }
}

/// Status view of one execution, read from a single snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub cv_id: String,
    pub status: ExecutionStatus,
    pub progress: Progress,
    pub steps: Vec<WorkflowStep>,
    pub error: Option<String>,
    pub output_data: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReport {
    pub execution_id: String,
    pub skipped_steps: usize,
    /// Queued jobs withdrawn before they started.
    pub removed_jobs: usize,
}

/// Maintains step and execution status from queue lifecycle events.
///
/// Every status write is conditional, so duplicate or late events are no-ops.
pub struct ProgressTracker {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn JobQueue>,
    event_bus: Arc<EventBus>,
}

impl ProgressTracker {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn JobQueue>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            queue,
            event_bus,
        }
    }

    /// Subscribe now and process events on a background task until cancelled.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = self.event_bus.subscribe();
        let tracker = Arc::clone(self);
        tokio::spawn(async move { tracker.run(rx, cancel).await })
    }

    async fn run(&self, mut rx: Receiver<WorkflowEvent>, cancel: CancellationToken) {
        info!("Progress tracker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            error!(
                                execution_id = %event.execution_id(),
                                event = event.event_type(),
                                error = %e,
                                "Failed to apply workflow event"
                            );
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Progress tracker lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Progress tracker stopped");
    }

    pub async fn handle_event(&self, event: &WorkflowEvent) -> Result<()> {
        match event {
            WorkflowEvent::JobCompleted { job_id, result } => {
                self.on_job_completed(job_id, result).await
            }
            WorkflowEvent::JobFailed { job_id, error } => self.on_job_failed(job_id, error).await,
            _ => Ok(()),
        }
    }

    async fn on_job_completed(&self, job_id: &JobId, result: &serde_json::Value) -> Result<()> {
        let Some(agent_id) = job_id.agent_id() else {
            return Ok(());
        };
        let execution_id = job_id.execution_id();

        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(());
        };
        if execution.status.is_terminal() {
            debug!(execution_id, agent_id, "Completion for terminal execution ignored");
            return Ok(());
        }

        let Ok(step) = serde_json::from_value::<StepResult>(result.clone()) else {
            warn!(execution_id, agent_id, "Unreadable step result");
            return Ok(());
        };
        if !step.success {
            return Ok(());
        }

        let mut update = StepUpdate::status(StepStatus::Completed);
        update.completed_at = Some(step.finished_at);
        update.output_data = Some(step.output);
        self.store
            .update_step(execution_id, agent_id, &[StepStatus::Running], update)
            .await?;

        self.try_finalize(execution_id).await?;
        Ok(())
    }

    async fn on_job_failed(&self, job_id: &JobId, error: &str) -> Result<()> {
        let execution_id = job_id.execution_id();
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(());
        };
        // A failed execution still closes steps failed by the cascade
        if matches!(
            execution.status,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled
        ) {
            debug!(execution_id, job_id = %job_id, "Failure for terminal execution ignored");
            return Ok(());
        }

        let reason = match job_id.agent_id() {
            Some(agent_id) => {
                let mut update = StepUpdate::status(StepStatus::Failed);
                update.error = Some(error.to_string());
                update.completed_at = Some(Utc::now());
                self.store
                    .update_step(execution_id, agent_id, &StepStatus::OPEN, update)
                    .await?;
                format!("step {agent_id} failed: {error}")
            }
            None => format!("orchestration failed: {error}"),
        };

        let mut update = ExecutionUpdate::status(ExecutionStatus::Failed);
        update.error = Some(reason);
        update.completed_at = Some(Utc::now());
        let changed = self
            .store
            .update_execution(execution_id, &ExecutionStatus::CANCELLABLE, update)
            .await?;

        if changed {
            warn!(execution_id, job_id = %job_id, error, "Execution failed");
            self.event_bus.publish(WorkflowEvent::ExecutionFinished {
                execution_id: execution_id.to_string(),
                status: ExecutionStatus::Failed,
            });
        }
        Ok(())
    }

    /// Complete the execution once every step is completed or skipped.
    ///
    /// The final output is the output of the most recently completed step.
    pub async fn try_finalize(&self, execution_id: &str) -> Result<bool> {
        let Some(snapshot) = self.store.load_snapshot(execution_id).await? else {
            return Ok(false);
        };
        if snapshot.execution.status.is_terminal()
            || !snapshot.steps.iter().all(|s| s.status.is_settled_ok())
        {
            return Ok(false);
        }

        let output = snapshot
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .max_by_key(|s| s.completed_at)
            .and_then(|s| s.output_data.clone())
            .or_else(|| snapshot.execution.input_data.clone());

        let mut update = ExecutionUpdate::status(ExecutionStatus::Completed);
        update.completed_at = Some(Utc::now());
        update.output_data = output;
        let changed = self
            .store
            .update_execution(execution_id, &[ExecutionStatus::Running], update)
            .await?;

        if changed {
            info!(execution_id, steps = snapshot.steps.len(), "Execution completed");
            self.event_bus.publish(WorkflowEvent::ExecutionFinished {
                execution_id: execution_id.to_string(),
                status: ExecutionStatus::Completed,
            });
        }
        Ok(changed)
    }

    pub async fn status(&self, execution_id: &str) -> Result<ExecutionReport> {
        let snapshot = self
            .store
            .load_snapshot(execution_id)
            .await?
            .ok_or_else(|| RefineryError::ExecutionNotFound(execution_id.to_string()))?;

        let execution = snapshot.execution;
        Ok(ExecutionReport {
            execution_id: execution.id,
            cv_id: execution.cv_id,
            status: execution.status,
            progress: Progress::from_steps(&snapshot.steps),
            steps: snapshot.steps,
            error: execution.error,
            output_data: execution.output_data,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
        })
    }

    /// Cancel a pending or running execution.
    ///
    /// Open steps are skipped in the same transaction. Queued jobs are then
    /// withdrawn best-effort; running jobs finish and their results are ignored.
    pub async fn cancel(&self, execution_id: &str) -> Result<CancelReport> {
        let skipped_steps = match self.store.cancel_execution(execution_id).await? {
            CancelOutcome::Cancelled { skipped_steps } => skipped_steps,
            CancelOutcome::AlreadyTerminal(status) => {
                return Err(RefineryError::CancellationConflict {
                    execution_id: execution_id.to_string(),
                    status,
                })
            }
            CancelOutcome::NotFound => {
                return Err(RefineryError::ExecutionNotFound(execution_id.to_string()))
            }
        };

        let mut job_ids = vec![JobId::orchestration(execution_id)];
        match self.store.list_steps(execution_id).await {
            Ok(steps) => job_ids.extend(
                steps
                    .iter()
                    .map(|s| JobId::for_step(execution_id, &s.agent_id)),
            ),
            Err(e) => warn!(execution_id, error = %e, "Could not list steps for job removal"),
        }

        let mut removed_jobs = 0;
        for job_id in &job_ids {
            match self.queue.remove(job_id).await {
                Ok(true) => removed_jobs += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to remove queued job"),
            }
        }

        info!(execution_id, skipped_steps, removed_jobs, "Execution cancelled");
        self.event_bus.publish(WorkflowEvent::ExecutionFinished {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Cancelled,
        });

        Ok(CancelReport {
            execution_id: execution_id.to_string(),
            skipped_steps,
            removed_jobs,
        })
    }
}
