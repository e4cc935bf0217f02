use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use refinery_core::error::{RefineryError, Result};
use refinery_core::status::{ExecutionStatus, StepStatus};
use refinery_core::traits::{AgentProcessor, JobQueue, WorkflowStore};
use refinery_core::types::{
    ActiveJob, AuditEntry, StepJobData, StepResult, StepUpdate, WorkflowExecution,
};

use crate::prompt;

/// Runs one agent step for a queue job.
pub struct ExecutionCoordinator {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn AgentProcessor>,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn JobQueue>,
        processor: Arc<dyn AgentProcessor>,
    ) -> Self {
        Self {
            store,
            queue,
            processor,
        }
    }

    /// Run the step and persist its outcome.
    ///
    /// Returns a skipped result without side effects when the execution was
    /// cancelled or completed. A failed execution still runs steps that do not
    /// depend on the failure. Errors are returned after being recorded so the
    /// queue can retry or cascade.
    pub async fn run_step(&self, job: &ActiveJob, data: &StepJobData) -> Result<StepResult> {
        let execution = self
            .store
            .get_execution(&data.execution_id)
            .await?
            .ok_or_else(|| RefineryError::ExecutionNotFound(data.execution_id.clone()))?;

        if matches!(
            execution.status,
            ExecutionStatus::Cancelled | ExecutionStatus::Completed
        ) {
            debug!(
                execution_id = %data.execution_id,
                agent = %data.agent_name,
                status = %execution.status,
                "Execution closed, skipping step"
            );
            return Ok(StepResult::skipped(&data.agent_id));
        }

        let mut running = StepUpdate::status(StepStatus::Running);
        running.job_id = Some(job.id.to_string());
        if job.attempt == 1 {
            running.started_at = Some(Utc::now());
        }
        let started = self
            .store
            .update_step(
                &data.execution_id,
                &data.agent_id,
                &StepStatus::STARTABLE,
                running,
            )
            .await?;
        if !started {
            return self.settled_result(data).await;
        }

        match self.process(job, data, &execution).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.record_failure(job, data, &e).await;
                Err(match e {
                    RefineryError::ProcessorRequest(_) | RefineryError::ProcessorTimeout(_) => {
                        RefineryError::AgentProcessor {
                            agent: data.agent_name.clone(),
                            message: e.to_string(),
                        }
                    }
                    other => other,
                })
            }
        }
    }

    async fn process(
        &self,
        job: &ActiveJob,
        data: &StepJobData,
        execution: &WorkflowExecution,
    ) -> Result<StepResult> {
        let agent = self
            .store
            .get_agent(&data.agent_id)
            .await?
            .ok_or_else(|| RefineryError::AgentNotFound(data.agent_id.clone()))?;

        let document = self.resolve_input(job, execution).await?;
        let system = prompt::system_prompt(&agent);
        let user = prompt::user_prompt(&agent, &document);

        info!(
            execution_id = %data.execution_id,
            agent = %agent.name,
            attempt = job.attempt,
            processor = self.processor.name(),
            "Running agent step"
        );
        let output = self.processor.process(&system, &user).await?;

        let result = StepResult::success(&data.agent_id, output);
        let mut done = StepUpdate::status(StepStatus::Completed);
        done.completed_at = Some(result.finished_at);
        done.input_data = Some(document);
        done.output_data = Some(result.output.clone());
        let persisted = self
            .store
            .update_step(&data.execution_id, &data.agent_id, &[StepStatus::Running], done)
            .await?;

        if persisted {
            self.store
                .append_audit(
                    AuditEntry::new(&data.execution_id, &data.agent_id, "step_completed")
                        .with_detail(format!("{} chars", result.output.chars().count())),
                )
                .await?;
        } else {
            debug!(
                execution_id = %data.execution_id,
                agent = %agent.name,
                "Step left RUNNING before completion, result not persisted"
            );
        }

        Ok(result)
    }

    /// Result for a step that can no longer start. A step completed before a
    /// restart replays its stored output so parents still receive it.
    async fn settled_result(&self, data: &StepJobData) -> Result<StepResult> {
        let step = self
            .store
            .list_steps(&data.execution_id)
            .await?
            .into_iter()
            .find(|s| s.agent_id == data.agent_id);

        match step {
            Some(step) if step.status == StepStatus::Completed => {
                debug!(
                    execution_id = %data.execution_id,
                    agent = %data.agent_name,
                    "Step already completed, replaying stored output"
                );
                Ok(StepResult {
                    agent_id: data.agent_id.clone(),
                    output: step.output_data.unwrap_or_default(),
                    success: true,
                    finished_at: step.completed_at.unwrap_or_else(Utc::now),
                })
            }
            _ => {
                // Skipped by a cancel that raced this job
                debug!(
                    execution_id = %data.execution_id,
                    agent = %data.agent_name,
                    "Step no longer startable, skipping"
                );
                Ok(StepResult::skipped(&data.agent_id))
            }
        }
    }

    /// Most recently finished successful child output, else the original document.
    async fn resolve_input(&self, job: &ActiveJob, execution: &WorkflowExecution) -> Result<String> {
        let children = self.queue.children_results(&job.id).await?;

        let latest = children
            .into_values()
            .filter_map(|value| serde_json::from_value::<StepResult>(value).ok())
            .filter(|r| r.success)
            .max_by_key(|r| r.finished_at);

        Ok(match latest {
            Some(result) => result.output,
            None => execution.input_data.clone().unwrap_or_default(),
        })
    }

    async fn record_failure(&self, job: &ActiveJob, data: &StepJobData, error: &RefineryError) {
        let mut update = StepUpdate {
            error: Some(error.to_string()),
            ..Default::default()
        };
        if job.is_final_attempt() {
            update.status = Some(StepStatus::Failed);
            update.completed_at = Some(Utc::now());
        }

        if let Err(e) = self
            .store
            .update_step(&data.execution_id, &data.agent_id, &[StepStatus::Running], update)
            .await
        {
            warn!(
                execution_id = %data.execution_id,
                agent = %data.agent_name,
                error = %e,
                "Failed to record step failure"
            );
        }

        warn!(
            execution_id = %data.execution_id,
            agent = %data.agent_name,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            error = %error,
            "Agent step failed"
        );
    }
}
