use std::sync::Arc;
use std::time::Duration;

use refinery_core::config::AppConfig;
use refinery_core::status::{ExecutionStatus, StepStatus};
use refinery_core::traits::WorkflowStore;
use refinery_core::types::{ExecutionUpdate, StepUpdate};
use refinery_engine::{ExecutionReport, WorkflowRuntime};
use refinery_store::SqliteStore;
use refinery_test_utils::{agent, connection, test_config, MockProcessor};

const WAIT: Duration = Duration::from_secs(10);

async fn runtime_with(
    config: AppConfig,
    store: Arc<SqliteStore>,
    agents: &[&str],
    edges: &[(&str, &str)],
    processor: Arc<MockProcessor>,
) -> WorkflowRuntime {
    for name in agents {
        store.upsert_agent(agent(name)).await.unwrap();
    }
    for (source, target) in edges {
        store
            .create_connection(connection(source, target))
            .await
            .unwrap();
    }
    let mut runtime = WorkflowRuntime::new(config, store, processor);
    runtime.start();
    runtime
}

async fn runtime(
    agents: &[&str],
    edges: &[(&str, &str)],
    processor: Arc<MockProcessor>,
) -> (WorkflowRuntime, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let runtime = runtime_with(test_config(), store.clone(), agents, edges, processor).await;
    (runtime, store)
}

fn step_status(report: &ExecutionReport, agent_id: &str) -> StepStatus {
    report
        .steps
        .iter()
        .find(|s| s.agent_id == agent_id)
        .map(|s| s.status)
        .unwrap()
}

/// Poll until `check` holds for the execution's status report.
async fn eventually(
    runtime: &WorkflowRuntime,
    id: &str,
    check: impl Fn(&ExecutionReport) -> bool,
) -> ExecutionReport {
    let service = runtime.service();
    for _ in 0..200 {
        let report = service.status(id).await.unwrap();
        if check(&report) {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached for execution {id}");
}

#[tokio::test]
async fn test_chain_passes_output_downstream() {
    let processor = Arc::new(MockProcessor::new());
    let (runtime, store) = runtime(&["a", "b", "c"], &[("a", "b"), ("b", "c")], processor).await;

    let id = runtime.service().start("cv-1", "doc").await.unwrap();
    let report = runtime.wait_for(&id, WAIT).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.output_data.as_deref(), Some("doc|a|b|c"));
    assert_eq!(report.cv_id, "cv-1");
    assert!(report.started_at.is_some());
    assert!(report.completed_at.is_some());

    let steps = store.list_steps(&id).await.unwrap();
    let b = steps.iter().find(|s| s.agent_id == "b").unwrap();
    assert_eq!(b.input_data.as_deref(), Some("doc|a"));
    assert_eq!(b.output_data.as_deref(), Some("doc|a|b"));
    assert!(b.job_id.is_some());

    let audit = store.list_audit(&id).await.unwrap();
    assert_eq!(audit.len(), 3);
    assert!(audit.iter().all(|e| e.action == "step_completed"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_diamond_runs_shared_agent_once() {
    let processor = Arc::new(MockProcessor::new());
    let (runtime, _store) = runtime(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        processor.clone(),
    )
    .await;

    let id = runtime.service().start("cv", "doc").await.unwrap();
    let report = runtime.wait_for(&id, WAIT).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(processor.calls_for("a"), 1);
    assert_eq!(processor.calls_for("d"), 1);
    assert_eq!(processor.call_count(), 4);

    // d consumes whichever of b and c finished last
    let output = report.output_data.unwrap();
    assert!(
        output == "doc|a|b|d" || output == "doc|a|c|d",
        "unexpected output {output}"
    );
    assert_eq!(report.progress.percentage, 100);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_disconnected_agents_all_start_from_document() {
    let processor = Arc::new(MockProcessor::new());
    let (runtime, store) = runtime(&["a", "b"], &[], processor).await;

    let id = runtime.service().start("cv", "doc").await.unwrap();
    let report = runtime.wait_for(&id, WAIT).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);

    for step in store.list_steps(&id).await.unwrap() {
        assert_eq!(step.input_data.as_deref(), Some("doc"));
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_failure_cascades_to_dependents() {
    let processor = Arc::new(MockProcessor::new().always_failing("b"));
    let (runtime, _store) = runtime(
        &["a", "b", "c"],
        &[("a", "b"), ("b", "c")],
        processor.clone(),
    )
    .await;

    let id = runtime.service().start("cv", "doc").await.unwrap();
    let report = runtime.wait_for(&id, WAIT).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert!(report.error.as_deref().unwrap_or_default().contains("b"));
    assert!(report.output_data.is_none());

    let report = eventually(&runtime, &id, |r| step_status(r, "c") == StepStatus::Failed).await;
    assert_eq!(step_status(&report, "a"), StepStatus::Completed);
    assert_eq!(step_status(&report, "b"), StepStatus::Failed);
    assert_eq!(processor.calls_for("b"), 3);
    assert_eq!(processor.calls_for("c"), 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_sibling_failure_leaves_other_branch_completed() {
    // b fails slowly so that c finishes while the execution is still running
    let processor = Arc::new(
        MockProcessor::new()
            .delayed("b", Duration::from_millis(100))
            .always_failing("b"),
    );
    let (runtime, _store) = runtime(&["a", "b", "c"], &[("a", "b"), ("a", "c")], processor).await;

    let id = runtime.service().start("cv", "doc").await.unwrap();
    runtime.wait_for(&id, WAIT).await.unwrap();

    let report = eventually(&runtime, &id, |r| {
        step_status(r, "c") == StepStatus::Completed
    })
    .await;
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(step_status(&report, "b"), StepStatus::Failed);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_failed_execution_still_runs_independent_branch() {
    // a fails at once while b is still running; c depends only on b
    let processor = Arc::new(
        MockProcessor::new()
            .always_failing("a")
            .delayed("b", Duration::from_millis(200)),
    );
    let (runtime, store) = runtime(&["a", "b", "c"], &[("b", "c")], processor.clone()).await;

    let id = runtime.service().start("cv", "doc").await.unwrap();
    let report = runtime.wait_for(&id, WAIT).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_ne!(step_status(&report, "c"), StepStatus::Completed);

    let report = eventually(&runtime, &id, |r| step_status(r, "c") == StepStatus::Completed).await;
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(step_status(&report, "a"), StepStatus::Failed);
    assert_eq!(step_status(&report, "b"), StepStatus::Completed);
    assert!(report.output_data.is_none());
    assert_eq!(processor.calls_for("c"), 1);

    let steps = store.list_steps(&id).await.unwrap();
    let c = steps.iter().find(|s| s.agent_id == "c").unwrap();
    assert_eq!(c.input_data.as_deref(), Some("doc|b"));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let processor = Arc::new(MockProcessor::new().delayed("a", Duration::from_millis(300)));
    let (runtime, store) = runtime(&["a", "b"], &[("a", "b")], processor.clone()).await;
    let service = runtime.service();

    let id = service.start("cv", "doc").await.unwrap();
    eventually(&runtime, &id, |r| step_status(r, "a") == StepStatus::Running).await;

    let cancelled = service.cancel(&id).await.unwrap();
    assert_eq!(cancelled.skipped_steps, 2);

    // The running job finishes, but its result is ignored
    tokio::time::sleep(Duration::from_millis(500)).await;
    let report = service.status(&id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Cancelled);
    assert!(report.output_data.is_none());
    assert_eq!(step_status(&report, "a"), StepStatus::Skipped);
    assert_eq!(step_status(&report, "b"), StepStatus::Skipped);
    assert_eq!(processor.calls_for("b"), 0);
    assert!(store.list_audit(&id).await.unwrap().is_empty());

    let err = service.cancel(&id).await.unwrap_err();
    assert!(matches!(
        err,
        refinery_core::RefineryError::CancellationConflict { .. }
    ));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_completed_execution_cannot_be_cancelled() {
    let processor = Arc::new(MockProcessor::new());
    let (runtime, _store) = runtime(&["a"], &[], processor).await;

    let id = runtime.service().start("cv", "doc").await.unwrap();
    runtime.wait_for(&id, WAIT).await.unwrap();

    let err = runtime.service().cancel(&id).await.unwrap_err();
    assert!(matches!(
        err,
        refinery_core::RefineryError::CancellationConflict {
            status: ExecutionStatus::Completed,
            ..
        }
    ));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_empty_graph_completes_with_original_document() {
    let processor = Arc::new(MockProcessor::new());
    let (runtime, _store) = runtime(&[], &[], processor.clone()).await;

    let id = runtime.service().start("cv", "untouched").await.unwrap();
    let report = runtime.wait_for(&id, WAIT).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.output_data.as_deref(), Some("untouched"));
    assert_eq!(report.progress.total, 0);
    assert_eq!(report.progress.percentage, 0);
    assert_eq!(processor.call_count(), 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_cycle_rejected_before_any_work() {
    let processor = Arc::new(MockProcessor::new());
    let (runtime, _store) = runtime(&["a", "b"], &[("a", "b"), ("b", "a")], processor.clone()).await;

    let err = runtime.service().start("cv", "doc").await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(err.to_string(), "graph contains a cycle");
    assert_eq!(processor.call_count(), 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_on_disk_store_and_execution_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.store.path = dir.path().join("refinery.db").display().to_string();
    config.log.enabled = true;
    config.log.log_dir = dir.path().join("logs").display().to_string();

    let store = Arc::new(SqliteStore::open(&config.store_path()).unwrap());
    let processor = Arc::new(MockProcessor::new());
    let runtime = runtime_with(config.clone(), store, &["a", "b"], &[("a", "b")], processor).await;

    let id = runtime.service().start("cv", "doc").await.unwrap();
    let report = runtime.wait_for(&id, WAIT).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);

    let log_path = config.log_dir().join(format!("{id}.jsonl"));
    let mut lines = Vec::new();
    for _ in 0..200 {
        if let Ok(content) = std::fs::read_to_string(&log_path) {
            lines = content.lines().map(str::to_string).collect::<Vec<_>>();
            if lines.iter().any(|l| l.contains("execution_finished")) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(first["event_type"], "execution_started");
    assert!(lines.iter().any(|l| l.contains("job_completed")));
    runtime.shutdown().await;

    // State survives reopening the database
    let reopened = SqliteStore::open(&dir.path().join("refinery.db")).unwrap();
    let execution = reopened.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output_data.as_deref(), Some("doc|a|b"));
}

/// Leave an a→b execution running with a completed, as a crashed process would.
async fn interrupted_execution(config: &AppConfig) -> String {
    let store = Arc::new(SqliteStore::open(&config.store_path()).unwrap());
    store.upsert_agent(agent("a")).await.unwrap();
    store.upsert_agent(agent("b")).await.unwrap();
    store.create_connection(connection("a", "b")).await.unwrap();

    // Never started: the orchestration job dies with this runtime
    let runtime = WorkflowRuntime::new(config.clone(), store.clone(), Arc::new(MockProcessor::new()));
    let id = runtime.service().start("cv", "doc").await.unwrap();

    store
        .update_execution(
            &id,
            &[ExecutionStatus::Pending],
            ExecutionUpdate::status(ExecutionStatus::Running),
        )
        .await
        .unwrap();
    let mut done = StepUpdate::status(StepStatus::Completed);
    done.input_data = Some("doc".into());
    done.output_data = Some("doc|a".into());
    done.completed_at = Some(chrono::Utc::now());
    store
        .update_step(&id, "a", &[StepStatus::Pending], done)
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn test_restart_resumes_running_execution() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.store.path = dir.path().join("refinery.db").display().to_string();
    let id = interrupted_execution(&config).await;

    let store = Arc::new(SqliteStore::open(&config.store_path()).unwrap());
    let processor = Arc::new(MockProcessor::new());
    let mut runtime = WorkflowRuntime::new(config, store, processor.clone());
    runtime.start();

    let report = runtime.wait_for(&id, WAIT).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.output_data.as_deref(), Some("doc|a|b"));
    assert_eq!(processor.calls_for("a"), 0);
    assert_eq!(processor.calls_for("b"), 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_restart_fails_execution_when_graph_changed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.store.path = dir.path().join("refinery.db").display().to_string();
    let id = interrupted_execution(&config).await;

    let store = Arc::new(SqliteStore::open(&config.store_path()).unwrap());
    store.upsert_agent(agent("c")).await.unwrap();
    let processor = Arc::new(MockProcessor::new());
    let mut runtime = WorkflowRuntime::new(config, store, processor.clone());
    runtime.start();

    let report = runtime.wait_for(&id, WAIT).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert!(report.error.as_ref().unwrap().starts_with("interrupted:"));
    assert_eq!(step_status(&report, "a"), StepStatus::Completed);
    assert_eq!(step_status(&report, "b"), StepStatus::Failed);
    assert_eq!(processor.call_count(), 0);
    runtime.shutdown().await;
}
