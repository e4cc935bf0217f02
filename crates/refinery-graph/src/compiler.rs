use std::collections::HashSet;

use tracing::debug;

use refinery_core::config::{QueueConfig, RetryPolicy};
use refinery_core::error::{RefineryError, Result};
use refinery_core::types::{JobFlow, JobId, JobPayload, JobSpec, StepJobData};

use crate::graph::Graph;

/// Compiles a valid graph into a job flow for one execution.
///
/// Every agent becomes exactly one job. A job lists the jobs of its input agents
/// as children, so an agent shared by several consumers runs once and its result
/// is visible to all of them.
#[derive(Debug, Clone)]
pub struct WorkflowCompiler {
    agent_retry: RetryPolicy,
    fail_parent_on_failure: bool,
}

impl WorkflowCompiler {
    pub fn new(agent_retry: RetryPolicy, fail_parent_on_failure: bool) -> Self {
        Self {
            agent_retry,
            fail_parent_on_failure,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.agent.clone(), config.fail_parent_on_failure)
    }

    /// Build the flow, children listed before their parents.
    ///
    /// The walk starts at the leaves and follows `inputs` with an explicit stack.
    pub fn compile(&self, graph: &Graph, execution_id: &str, cv_id: &str) -> Result<JobFlow> {
        if !graph.is_valid {
            return Err(RefineryError::GraphCycle);
        }
        if graph.is_empty() {
            return Ok(JobFlow::default());
        }
        if graph.roots().is_empty() {
            return Err(RefineryError::NoRootAgent);
        }

        let mut leaves = graph.leaves();
        leaves.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then_with(|| a.order.cmp(&b.order))
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut emitted: HashSet<&str> = HashSet::with_capacity(graph.len());
        let mut jobs = Vec::with_capacity(graph.len());
        // (agent id, inputs already pushed)
        let mut stack: Vec<(&str, bool)> =
            leaves.iter().rev().map(|n| (n.id.as_str(), false)).collect();

        while let Some((id, expanded)) = stack.pop() {
            if emitted.contains(id) {
                continue;
            }
            let Some(node) = graph.node(id) else {
                continue;
            };

            if expanded {
                let children = node
                    .inputs
                    .iter()
                    .map(|input| JobId::for_step(execution_id, input))
                    .collect();
                let payload = JobPayload::RunAgent(StepJobData {
                    execution_id: execution_id.to_string(),
                    cv_id: cv_id.to_string(),
                    agent_id: node.id.clone(),
                    agent_name: node.name.clone(),
                });
                jobs.push(
                    JobSpec::new(JobId::for_step(execution_id, &node.id), payload)
                        .with_children(children)
                        .with_retry(self.agent_retry.clone())
                        .with_fail_parent_on_failure(self.fail_parent_on_failure),
                );
                emitted.insert(id);
            } else {
                stack.push((id, true));
                for input in node.inputs.iter().rev() {
                    if !emitted.contains(input.as_str()) {
                        stack.push((input.as_str(), false));
                    }
                }
            }
        }

        debug!(execution_id, jobs = jobs.len(), "Compiled job flow");
        Ok(JobFlow { jobs })
    }
}
