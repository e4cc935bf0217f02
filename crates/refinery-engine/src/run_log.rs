use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use refinery_core::event::EventBus;
use refinery_core::types::WorkflowEvent;

/// JSONL execution logger.
///
/// Subscribes to the EventBus and appends one JSON object per lifecycle event
/// to `{log_dir}/{execution_id}.jsonl`. Lines are flushed as they are written,
/// so a crash never leaves a partial history behind earlier entries.
pub struct ExecutionLogger {
    log_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl ExecutionLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn path_for(&self, execution_id: &str) -> PathBuf {
        self.log_dir.join(format!("{execution_id}.jsonl"))
    }

    /// Subscribe now and write entries on a background task until cancelled.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: Receiver<WorkflowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, path = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(path = %self.log_dir.display(), "Execution logger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Execution logger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        let path = self.path_for(event.execution_id());
                        if let Err(e) = append_entry(&path, &entry_for(&event)).await {
                            error!(error = %e, path = %path.display(), "Failed to write log entry");
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Execution logger lagged, skipped events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, execution logger stopping");
                        break;
                    }
                },
            }
        }
    }
}

async fn append_entry(path: &Path, entry: &LogEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

fn entry_for(event: &WorkflowEvent) -> LogEntry {
    let (job_id, detail) = match event {
        WorkflowEvent::JobCompleted { job_id, result } => {
            let chars = result
                .get("output")
                .and_then(|o| o.as_str())
                .map(|o| o.chars().count());
            (
                Some(job_id.to_string()),
                chars.map(|c| serde_json::json!({ "output_chars": c })),
            )
        }
        WorkflowEvent::JobFailed { job_id, error } => (
            Some(job_id.to_string()),
            Some(serde_json::json!({ "error": error })),
        ),
        WorkflowEvent::JobRetrying {
            job_id,
            attempt,
            delay_ms,
            error,
        } => (
            Some(job_id.to_string()),
            Some(serde_json::json!({
                "attempt": attempt,
                "delay_ms": delay_ms,
                "error": error,
            })),
        ),
        WorkflowEvent::ExecutionStarted { .. } => (None, None),
        WorkflowEvent::ExecutionFinished { status, .. } => {
            (None, Some(serde_json::json!({ "status": status })))
        }
    };

    LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        execution_id: event.execution_id().to_string(),
        event_type: event.event_type().to_string(),
        job_id,
        detail,
    }
}
