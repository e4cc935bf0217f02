use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use refinery_core::traits::JobHandler;

use crate::memory::MemoryQueue;

/// Fixed set of workers, each running one job at a time.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers. They stop taking jobs once `cancel` fires;
    /// a job already running is allowed to finish.
    pub fn spawn(
        queue: Arc<MemoryQueue>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let handles = (0..concurrency)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tokio::spawn(run_worker(worker, queue, handler, cancel))
            })
            .collect();

        info!(concurrency, "Worker pool started");
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task panicked");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<MemoryQueue>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = queue.next_job() => job,
        };

        let job_id = job.id.clone();
        debug!(worker, job_id = %job_id, attempt = job.attempt, "Job started");

        match handler.handle(job).await {
            Ok(result) => queue.complete(&job_id, result),
            Err(e) => {
                warn!(worker, job_id = %job_id, error = %e, "Job attempt failed");
                queue.fail(&job_id, e.to_string());
            }
        }
    }
    debug!(worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use serde_json::Value;

    use refinery_core::config::{Backoff, RetryPolicy};
    use refinery_core::error::{RefineryError, Result};
    use refinery_core::event::EventBus;
    use refinery_core::traits::JobQueue;
    use refinery_core::types::{
        ActiveJob, JobFlow, JobId, JobPayload, JobSpec, StepJobData, WorkflowEvent,
    };

    /// Records run order; fails jobs for `flaky` on their first attempt.
    struct RecordingHandler {
        order: Mutex<Vec<String>>,
        flaky: Option<String>,
    }

    impl JobHandler for RecordingHandler {
        fn handle(&self, job: ActiveJob) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move {
                let JobPayload::RunAgent(data) = job.payload else {
                    return Ok(Value::Null);
                };
                if self.flaky.as_deref() == Some(data.agent_id.as_str()) && job.attempt == 1 {
                    return Err(RefineryError::ProcessorRequest("flaky".into()));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                if let Ok(mut order) = self.order.lock() {
                    order.push(data.agent_id.clone());
                }
                Ok(Value::from(data.agent_id))
            })
        }
    }

    fn spec(agent: &str, children: &[&str]) -> JobSpec {
        JobSpec::new(
            JobId::for_step("e", agent),
            JobPayload::RunAgent(StepJobData {
                execution_id: "e".into(),
                cv_id: "cv".into(),
                agent_id: agent.into(),
                agent_name: agent.into(),
            }),
        )
        .with_children(children.iter().map(|c| JobId::for_step("e", c)).collect())
        .with_retry(RetryPolicy::new(2, Backoff::Fixed { delay_ms: 10 }))
    }

    async fn wait_for_completion(rx: &mut tokio::sync::broadcast::Receiver<WorkflowEvent>, id: &JobId) {
        loop {
            if let Ok(WorkflowEvent::JobCompleted { job_id, .. }) = rx.recv().await {
                if &job_id == id {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_pool_runs_children_before_parents() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let queue = Arc::new(MemoryQueue::new(bus));
        let handler = Arc::new(RecordingHandler {
            order: Mutex::new(Vec::new()),
            flaky: Some("b".into()),
        });
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(queue.clone(), handler.clone(), 3, cancel.clone());
        assert_eq!(pool.size(), 3);

        queue
            .submit_flow(JobFlow {
                jobs: vec![
                    spec("a", &[]),
                    spec("b", &["a"]),
                    spec("c", &["a"]),
                    spec("d", &["b", "c"]),
                ],
            })
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_completion(&mut rx, &JobId::for_step("e", "d")),
        )
        .await
        .unwrap();

        cancel.cancel();
        pool.join().await;

        let order = handler.order.lock().unwrap().clone();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_stops_on_cancel() {
        let queue = Arc::new(MemoryQueue::new(Arc::new(EventBus::default())));
        let handler = Arc::new(RecordingHandler {
            order: Mutex::new(Vec::new()),
            flaky: None,
        });
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(queue, handler, 2, cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .unwrap();
    }
}
