use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use refinery_core::config::AppConfig;
use refinery_core::error::Result;
use refinery_core::event::EventBus;
use refinery_core::traits::{AgentProcessor, WorkflowStore};
use refinery_queue::{MemoryQueue, WorkerPool};

use crate::coordinator::ExecutionCoordinator;
use crate::dispatch::JobDispatcher;
use crate::run_log::ExecutionLogger;
use crate::tracker::{ExecutionReport, ProgressTracker};
use crate::workflow::WorkflowService;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wires store, queue, tracker and workers into one running engine.
pub struct WorkflowRuntime {
    config: AppConfig,
    event_bus: Arc<EventBus>,
    queue: Arc<MemoryQueue>,
    tracker: Arc<ProgressTracker>,
    service: Arc<WorkflowService>,
    dispatcher: Arc<JobDispatcher>,
    cancel: CancellationToken,
    pool: Option<WorkerPool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkflowRuntime {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn WorkflowStore>,
        processor: Arc<dyn AgentProcessor>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.queue.event_capacity));
        let queue = Arc::new(MemoryQueue::new(event_bus.clone()));
        let tracker = Arc::new(ProgressTracker::new(
            store.clone(),
            queue.clone(),
            event_bus.clone(),
        ));
        let service = Arc::new(WorkflowService::new(
            store.clone(),
            queue.clone(),
            event_bus.clone(),
            tracker.clone(),
            &config,
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(store, queue.clone(), processor));
        let dispatcher = Arc::new(JobDispatcher::new(service.clone(), coordinator));

        Self {
            config,
            event_bus,
            queue,
            tracker,
            service,
            dispatcher,
            cancel: CancellationToken::new(),
            pool: None,
            tasks: Vec::new(),
        }
    }

    pub fn service(&self) -> Arc<WorkflowService> {
        self.service.clone()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the tracker, the JSONL logger when enabled, and the worker pool,
    /// then resume executions a previous process left open.
    /// Calling it again is a no-op.
    pub fn start(&mut self) {
        if self.pool.is_some() {
            return;
        }
        let started_at = Utc::now();

        self.tasks.push(self.tracker.spawn(self.cancel.clone()));
        if self.config.log.enabled {
            let logger = ExecutionLogger::new(self.config.log_dir());
            self.tasks
                .push(logger.spawn(&self.event_bus, self.cancel.clone()));
        }
        self.pool = Some(WorkerPool::spawn(
            self.queue.clone(),
            self.dispatcher.clone(),
            self.config.workers.concurrency,
            self.cancel.clone(),
        ));
        info!(
            workers = self.config.workers.concurrency,
            "Workflow runtime started"
        );

        let service = self.service.clone();
        self.tasks.push(tokio::spawn(async move {
            match service.recover(started_at).await {
                Ok(report) if report.resumed + report.interrupted > 0 => info!(
                    resumed = report.resumed,
                    interrupted = report.interrupted,
                    "Recovered open executions"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to recover open executions"),
            }
        }));
    }

    /// Wait until the execution is terminal or `timeout` elapses, then return
    /// its latest status.
    pub async fn wait_for(&self, execution_id: &str, timeout: Duration) -> Result<ExecutionReport> {
        let mut events = self.event_bus.subscribe_execution(execution_id);
        let report = self.service.status(execution_id).await?;
        if report.status.is_terminal() {
            return Ok(report);
        }

        let waited = tokio::time::timeout(timeout, async {
            loop {
                tokio::select! {
                    finished = events.finished() => {
                        if finished.is_some() {
                            return;
                        }
                        // Bus closed, fall back to polling
                        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                    }
                    // Covers a terminal event dropped by a lagged receiver
                    _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
                }
                if let Ok(report) = self.service.status(execution_id).await {
                    if report.status.is_terminal() {
                        return;
                    }
                }
            }
        })
        .await;

        if waited.is_err() {
            warn!(execution_id, timeout_secs = timeout.as_secs(), "Timed out waiting for execution");
        }
        self.service.status(execution_id).await
    }

    /// Stop taking jobs and wait for workers and background tasks to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(pool) = self.pool.take() {
            pool.join().await;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task panicked");
            }
        }
        info!("Workflow runtime stopped");
    }
}
