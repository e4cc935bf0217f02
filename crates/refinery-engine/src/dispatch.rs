use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use refinery_core::error::Result;
use refinery_core::traits::JobHandler;
use refinery_core::types::{ActiveJob, JobPayload};

use crate::coordinator::ExecutionCoordinator;
use crate::workflow::WorkflowService;

/// Routes queue jobs to the workflow service or the step coordinator.
pub struct JobDispatcher {
    service: Arc<WorkflowService>,
    coordinator: Arc<ExecutionCoordinator>,
}

impl JobDispatcher {
    pub fn new(service: Arc<WorkflowService>, coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self {
            service,
            coordinator,
        }
    }
}

impl JobHandler for JobDispatcher {
    fn handle(&self, job: ActiveJob) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            match &job.payload {
                JobPayload::Orchestrate { execution_id, flow } => {
                    let jobs = self.service.orchestrate(execution_id, flow.clone()).await?;
                    Ok(json!({ "execution_id": execution_id, "jobs": jobs }))
                }
                JobPayload::RunAgent(data) => {
                    let result = self.coordinator.run_step(&job, data).await?;
                    Ok(serde_json::to_value(result)?)
                }
            }
        })
    }
}
