use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use refinery_core::error::{RefineryError, Result};
use refinery_core::event::EventBus;
use refinery_core::traits::JobQueue;
use refinery_core::types::{ActiveJob, JobFlow, JobId, JobSpec, WorkflowEvent};

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    /// Some children have not completed yet.
    WaitingChildren,
    Ready,
    /// Failed an attempt, waiting out its backoff.
    Delayed,
    Active,
    Completed(Value),
    Failed(String),
    Removed,
}

impl JobState {
    fn is_waiting(&self) -> bool {
        matches!(self, Self::WaitingChildren | Self::Ready | Self::Delayed)
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_) | Self::Removed)
    }
}

struct JobEntry {
    spec: JobSpec,
    state: JobState,
    /// Attempts started so far.
    attempts: u32,
    pending_children: HashSet<JobId>,
    parents: Vec<JobId>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, JobEntry>,
    ready: VecDeque<JobId>,
    /// Job ids grouped by execution, for eviction.
    executions: HashMap<String, HashSet<JobId>>,
}

impl QueueState {
    /// Drop every job of the execution once none is waiting or running.
    /// Returns how many jobs were dropped.
    fn evict_if_settled(&mut self, execution_id: &str) -> usize {
        let Some(ids) = self.executions.get(execution_id) else {
            return 0;
        };
        let open = ids
            .iter()
            .any(|id| self.jobs.get(id).is_some_and(|e| !e.state.is_settled()));
        if open {
            return 0;
        }

        let ids = self.executions.remove(execution_id).unwrap_or_default();
        for id in &ids {
            self.jobs.remove(id);
        }
        debug!(execution_id, jobs = ids.len(), "Evicted settled jobs");
        ids.len()
    }
}

/// In-process job queue.
///
/// State lives behind a std mutex that is never held across an await. Jobs
/// are dropped together once every job of their execution has settled, so a
/// parent can always read its children's results while it is still open.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    event_bus: Arc<EventBus>,
}

impl MemoryQueue {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            event_bus,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| RefineryError::Queue(e.to_string()))
    }

    pub fn job_state(&self, id: &JobId) -> Option<JobState> {
        let state = self.lock().ok()?;
        state.jobs.get(id).map(|e| e.state.clone())
    }

    /// Jobs not yet completed, failed or removed.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .map(|s| {
                s.jobs
                    .values()
                    .filter(|e| e.state.is_waiting() || e.state == JobState::Active)
                    .count()
            })
            .unwrap_or(0)
    }

    fn insert(&self, spec: JobSpec) -> Result<()> {
        let mut events = Vec::new();
        let mut wake = false;
        {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            if state.jobs.contains_key(&spec.id) {
                debug!(job_id = %spec.id, "Job already queued, ignoring");
                return Ok(());
            }

            let id = spec.id.clone();
            let mut pending = HashSet::new();
            let mut failed_child: Option<(JobId, String)> = None;

            for child in &spec.children {
                match state.jobs.get_mut(child) {
                    Some(entry) => {
                        entry.parents.push(id.clone());
                        match &entry.state {
                            JobState::Completed(_) | JobState::Removed => {}
                            JobState::Failed(err) if entry.spec.fail_parent_on_failure => {
                                failed_child = Some((child.clone(), err.clone()));
                            }
                            JobState::Failed(_) => {}
                            _ => {
                                pending.insert(child.clone());
                            }
                        }
                    }
                    // Not submitted yet; the parent waits for it.
                    None => {
                        pending.insert(child.clone());
                    }
                }
            }

            let job_state = if failed_child.is_some() {
                // Failed by the cascade below
                JobState::WaitingChildren
            } else if pending.is_empty() {
                state.ready.push_back(id.clone());
                wake = true;
                JobState::Ready
            } else {
                JobState::WaitingChildren
            };

            // Parents submitted ahead of this job
            let parents = state
                .jobs
                .iter()
                .filter(|(_, e)| e.spec.children.contains(&id))
                .map(|(k, _)| k.clone())
                .collect();

            state.jobs.insert(
                id.clone(),
                JobEntry {
                    spec,
                    state: job_state,
                    attempts: 0,
                    pending_children: pending,
                    parents,
                },
            );
            state
                .executions
                .entry(id.execution_id().to_string())
                .or_default()
                .insert(id.clone());

            if let Some((child, err)) = failed_child {
                let message = format!("dependency {child} failed: {err}");
                wake |= cascade_failure(state, id.clone(), message, &mut events) > 0;
                state.evict_if_settled(id.execution_id());
            }
        }

        for event in events {
            self.event_bus.publish(event);
        }
        if wake {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Wait for the next ready job and mark it active.
    pub async fn next_job(&self) -> ActiveJob {
        loop {
            if let Some(job) = self.try_take() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    fn try_take(&self) -> Option<ActiveJob> {
        let mut state = self.lock().ok()?;
        while let Some(id) = state.ready.pop_front() {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            // Removed jobs stay in the ready deque until popped.
            if entry.state != JobState::Ready {
                continue;
            }
            entry.state = JobState::Active;
            entry.attempts += 1;
            let job = ActiveJob {
                id: id.clone(),
                payload: entry.spec.payload.clone(),
                attempt: entry.attempts,
                max_attempts: entry.spec.retry.attempts.max(1),
            };
            if !state.ready.is_empty() {
                self.notify.notify_one();
            }
            return Some(job);
        }
        None
    }

    /// Record a successful run and release parents whose children are all done.
    pub fn complete(&self, id: &JobId, result: Value) {
        let mut released = 0;
        {
            let Ok(mut guard) = self.lock() else {
                return;
            };
            let state = &mut *guard;
            let parents = match state.jobs.get_mut(id) {
                Some(entry) if entry.state == JobState::Active => {
                    entry.state = JobState::Completed(result.clone());
                    entry.parents.clone()
                }
                _ => {
                    warn!(job_id = %id, "Completion for a job that is not active");
                    return;
                }
            };

            for parent in parents {
                if let Some(entry) = state.jobs.get_mut(&parent) {
                    entry.pending_children.remove(id);
                    if entry.state == JobState::WaitingChildren && entry.pending_children.is_empty()
                    {
                        entry.state = JobState::Ready;
                        state.ready.push_back(parent);
                        released += 1;
                    }
                }
            }

            // Published under the lock so a released parent cannot report first
            self.event_bus.publish(WorkflowEvent::JobCompleted {
                job_id: id.clone(),
                result,
            });
            state.evict_if_settled(id.execution_id());
        }

        debug!(job_id = %id, released, "Job completed");
        for _ in 0..released {
            self.notify.notify_one();
        }
    }

    /// Record a failed attempt. Retries after the backoff while attempts remain,
    /// otherwise fails the job and cascades to parents.
    pub fn fail(self: &Arc<Self>, id: &JobId, error: String) {
        let mut events = Vec::new();
        let mut retry_delay = None;
        let mut released = 0;
        {
            let Ok(mut guard) = self.lock() else {
                return;
            };
            let state = &mut *guard;
            let Some(entry) = state.jobs.get_mut(id) else {
                return;
            };
            if entry.state != JobState::Active {
                warn!(job_id = %id, "Failure for a job that is not active");
                return;
            }

            if entry.attempts < entry.spec.retry.attempts {
                let delay = entry.spec.retry.delay_for(entry.attempts);
                entry.state = JobState::Delayed;
                events.push(WorkflowEvent::JobRetrying {
                    job_id: id.clone(),
                    attempt: entry.attempts,
                    delay_ms: delay.as_millis() as u64,
                    error: error.clone(),
                });
                retry_delay = Some(delay);
            } else {
                released = cascade_failure(state, id.clone(), error, &mut events);
                state.evict_if_settled(id.execution_id());
            }
        }

        for event in events {
            self.event_bus.publish(event);
        }
        for _ in 0..released {
            self.notify.notify_one();
        }

        if let Some(delay) = retry_delay {
            if delay.is_zero() {
                self.requeue(id);
            } else {
                let queue = Arc::clone(self);
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.requeue(&id);
                });
            }
        }
    }

    fn requeue(&self, id: &JobId) {
        {
            let Ok(mut state) = self.lock() else {
                return;
            };
            match state.jobs.get_mut(id) {
                Some(entry) if entry.state == JobState::Delayed => {
                    entry.state = JobState::Ready;
                }
                // Removed during backoff
                _ => return,
            }
            state.ready.push_back(id.clone());
        }
        self.notify.notify_one();
    }
}

/// Fail `root` and every waiting ancestor reachable through cascading children.
/// Returns how many parents of non-cascading children became ready.
fn cascade_failure(
    state: &mut QueueState,
    root: JobId,
    error: String,
    events: &mut Vec<WorkflowEvent>,
) -> usize {
    let mut work = vec![(root, error)];
    let mut released = 0;

    while let Some((id, error)) = work.pop() {
        let Some(entry) = state.jobs.get_mut(&id) else {
            continue;
        };
        // Reached twice through a shared dependency
        if matches!(entry.state, JobState::Failed(_)) {
            continue;
        }
        entry.state = JobState::Failed(error.clone());
        let cascade = entry.spec.fail_parent_on_failure;
        let parents = entry.parents.clone();
        events.push(WorkflowEvent::JobFailed {
            job_id: id.clone(),
            error: error.clone(),
        });

        for parent in parents {
            let Some(p) = state.jobs.get_mut(&parent) else {
                continue;
            };
            if !p.state.is_waiting() {
                continue;
            }
            if cascade {
                work.push((parent, format!("dependency {id} failed: {error}")));
            } else {
                p.pending_children.remove(&id);
                if p.state == JobState::WaitingChildren && p.pending_children.is_empty() {
                    p.state = JobState::Ready;
                    state.ready.push_back(parent);
                    released += 1;
                }
            }
        }
    }
    released
}

impl JobQueue for MemoryQueue {
    fn submit(&self, job: JobSpec) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.insert(job) })
    }

    fn submit_flow(&self, flow: JobFlow) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let count = flow.len();
            for job in flow.jobs {
                self.insert(job)?;
            }
            debug!(jobs = count, "Flow submitted");
            Ok(())
        })
    }

    fn children_results(&self, job_id: &JobId) -> BoxFuture<'_, Result<HashMap<JobId, Value>>> {
        let job_id = job_id.clone();
        Box::pin(async move {
            let state = self.lock()?;
            let Some(entry) = state.jobs.get(&job_id) else {
                return Ok(HashMap::new());
            };
            let mut results = HashMap::new();
            for child in &entry.spec.children {
                if let Some(JobState::Completed(value)) = state.jobs.get(child).map(|c| &c.state) {
                    results.insert(child.clone(), value.clone());
                }
            }
            Ok(results)
        })
    }

    fn remove(&self, job_id: &JobId) -> BoxFuture<'_, Result<bool>> {
        let job_id = job_id.clone();
        Box::pin(async move {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let removed = match state.jobs.get_mut(&job_id) {
                Some(entry) if entry.state.is_waiting() => {
                    entry.state = JobState::Removed;
                    true
                }
                _ => false,
            };
            if removed {
                state.evict_if_settled(job_id.execution_id());
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinery_core::config::{Backoff, RetryPolicy};
    use refinery_core::types::{JobPayload, StepJobData};

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
    }

    fn id(agent: &str) -> JobId {
        JobId::for_step("e", agent)
    }

    fn queue() -> Arc<MemoryQueue> {
        Arc::new(MemoryQueue::new(Arc::new(EventBus::default())))
    }

    #[tokio::test]
    async fn test_parent_waits_for_children() {
        let q = queue();
        q.submit_flow(JobFlow {
            jobs: vec![spec("a", &[]), spec("b", &[]), spec("c", &["a", "b"])],
        })
        .await
        .unwrap();

        assert_eq!(q.job_state(&id("c")), Some(JobState::WaitingChildren));
        let first = q.next_job().await;
        q.complete(&first.id, Value::from(1));
        assert_eq!(q.job_state(&id("c")), Some(JobState::WaitingChildren));

        let second = q.next_job().await;
        assert_ne!(second.id, id("c"));
        q.complete(&second.id, Value::from(2));
        assert_eq!(q.job_state(&id("c")), Some(JobState::Ready));

        let results = q.children_results(&id("c")).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_child_submitted_after_parent() {
        let q = queue();
        q.submit(spec("b", &["a"])).await.unwrap();
        q.submit(spec("a", &[])).await.unwrap();
        let job = q.next_job().await;
        assert_eq!(job.id, id("a"));
        q.complete(&job.id, Value::Null);
        assert_eq!(q.job_state(&id("b")), Some(JobState::Ready));
    }

    #[tokio::test]
    async fn test_duplicate_submit_ignored() {
        let q = queue();
        q.submit(spec("a", &[])).await.unwrap();
        q.submit(spec("a", &[])).await.unwrap();
        assert_eq!(q.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_terminal_failure_cascades() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let q = Arc::new(MemoryQueue::new(bus));
        let retry = RetryPolicy::new(2, Backoff::Fixed { delay_ms: 0 });
        q.submit_flow(JobFlow {
            jobs: vec![
                spec("a", &[]).with_retry(retry),
                spec("b", &["a"]),
                spec("c", &["b"]),
            ],
        })
        .await
        .unwrap();

        let job = q.next_job().await;
        assert_eq!(job.attempt, 1);
        assert!(!job.is_final_attempt());
        q.fail(&job.id, "boom".into());
        assert!(matches!(rx.recv().await.unwrap(), WorkflowEvent::JobRetrying { attempt: 1, .. }));

        let job = q.next_job().await;
        assert_eq!(job.attempt, 2);
        assert!(job.is_final_attempt());
        q.fail(&job.id, "boom".into());

        let mut failed = Vec::new();
        for _ in 0..3 {
            if let WorkflowEvent::JobFailed { job_id, .. } = rx.recv().await.unwrap() {
                failed.push(job_id);
            }
        }
        assert_eq!(failed, vec![id("a"), id("b"), id("c")]);
        assert_eq!(q.job_state(&id("c")), None);
        assert_eq!(q.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_without_cascade_releases_parent() {
        let q = queue();
        q.submit_flow(JobFlow {
            jobs: vec![
                spec("a", &[]).with_fail_parent_on_failure(false),
                spec("b", &["a"]),
            ],
        })
        .await
        .unwrap();

        let job = q.next_job().await;
        q.fail(&job.id, "boom".into());
        assert_eq!(q.job_state(&id("b")), Some(JobState::Ready));
        assert!(q.children_results(&id("b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_only_waiting_jobs() {
        let q = queue();
        q.submit_flow(JobFlow {
            jobs: vec![spec("a", &[]), spec("b", &["a"])],
        })
        .await
        .unwrap();

        let active = q.next_job().await;
        assert!(!q.remove(&active.id).await.unwrap());
        assert!(q.remove(&id("b")).await.unwrap());
        assert!(!q.remove(&id("b")).await.unwrap());
        assert!(!q.remove(&id("zzz")).await.unwrap());

        // Completing the running child does not revive the removed parent
        q.complete(&active.id, Value::Null);
        assert_eq!(q.job_state(&id("b")), None);
        assert_eq!(q.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_removed_ready_job_is_never_dispatched() {
        let q = queue();
        q.submit(spec("a", &[])).await.unwrap();
        q.submit(spec("b", &[])).await.unwrap();
        assert!(q.remove(&id("a")).await.unwrap());
        let job = q.next_job().await;
        assert_eq!(job.id, id("b"));
    }

    #[tokio::test]
    async fn test_shared_child_completes_once_for_all_parents() {
        let q = queue();
        q.submit_flow(JobFlow {
            jobs: vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["a"])],
        })
        .await
        .unwrap();

        let job = q.next_job().await;
        q.complete(&job.id, Value::from("shared"));
        assert_eq!(q.job_state(&id("b")), Some(JobState::Ready));
        assert_eq!(q.job_state(&id("c")), Some(JobState::Ready));
        for parent in ["b", "c"] {
            let results = q.children_results(&id(parent)).await.unwrap();
            assert_eq!(results.get(&id("a")), Some(&Value::from("shared")));
        }
    }

    #[tokio::test]
    async fn test_settled_execution_is_evicted() {
        let q = queue();
        let other = JobSpec::new(
            JobId::for_step("other", "x"),
            JobPayload::RunAgent(StepJobData {
                execution_id: "other".into(),
                cv_id: "cv".into(),
                agent_id: "x".into(),
                agent_name: "x".into(),
            }),
        );
        q.submit(other).await.unwrap();
        q.submit_flow(JobFlow {
            jobs: vec![spec("a", &[]), spec("b", &["a"])],
        })
        .await
        .unwrap();

        let mut taken = Vec::new();
        while taken.len() < 2 {
            let job = q.next_job().await;
            if job.id == id("a") {
                q.complete(&job.id, Value::from("a"));
                // b still needs a's result
                assert!(q.job_state(&id("a")).is_some());
                assert_eq!(q.children_results(&id("b")).await.unwrap().len(), 1);
            }
            taken.push(job.id);
        }
        let b = q.next_job().await;
        assert_eq!(b.id, id("b"));
        q.complete(&b.id, Value::from("b"));

        assert_eq!(q.job_state(&id("a")), None);
        assert_eq!(q.job_state(&id("b")), None);
        // Other executions are untouched
        assert_eq!(q.job_state(&JobId::for_step("other", "x")), Some(JobState::Active));
    }

    #[tokio::test]
    async fn test_shared_dependency_fails_once() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let q = Arc::new(MemoryQueue::new(bus));
        // y and z wait on r, z also waits on y and is reached through both
        q.submit(spec("r", &[])).await.unwrap();
        q.submit(spec("z", &["r", "y"])).await.unwrap();
        q.submit(spec("y", &["r"])).await.unwrap();

        let job = q.next_job().await;
        q.fail(&job.id, "boom".into());

        let mut failed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::JobFailed { job_id, .. } = event {
                failed.push(job_id);
            }
        }
        failed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(failed, vec![id("r"), id("y"), id("z")]);
    }
}
