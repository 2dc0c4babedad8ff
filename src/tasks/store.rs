// Clima Agent -- Task store
//
// Authoritative in-memory record of every asynchronous task. All lifecycle
// transitions go through `transition`, under one lock, so per-task ordering
// is total. The queue holds `(priority desc, submission order asc)`; stale
// queue entries (cancelled or timed out before claim) are skipped on pop.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{FailureKind, Task, TaskError, TaskFailure, TaskId, TaskStatus};

#[derive(Debug, Clone)]
pub struct NewTask {
    pub agent_id: String,
    pub capability: String,
    pub input_data: Value,
    pub priority: i32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub total: usize,
    pub submitted: usize,
    pub working: usize,
    pub completed: usize,
    pub failed: usize,
    pub queued: usize,
    pub discarded_results: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<TaskId, Task>,
    queue: BinaryHeap<QueueEntry>,
    seq: u64,
}

impl StoreInner {
    fn transition(
        &mut self,
        id: &TaskId,
        to: TaskStatus,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut Task),
    ) -> Result<Task, TaskError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;
        if !task.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                task_id: id.clone(),
                from: task.status,
                to,
            });
        }
        task.status = to;
        task.updated_at = now;
        if to.is_terminal() {
            task.completed_at = Some(now);
        }
        apply(task);
        Ok(task.clone())
    }
}

pub struct TaskStore {
    inner: Mutex<StoreInner>,
    wake: Notify,
    accepting: AtomicBool,
    discarded_results: AtomicU64,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            wake: Notify::new(),
            accepting: AtomicBool::new(true),
            discarded_results: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn create_task(&self, new: NewTask) -> Result<Task, TaskError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(TaskError::Closed);
        }
        let now = Utc::now();
        let task = Task {
            task_id: TaskId::generate(),
            agent_id: new.agent_id,
            capability: new.capability,
            input_data: new.input_data,
            status: TaskStatus::Submitted,
            priority: new.priority,
            timeout_seconds: new.timeout.as_secs(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        {
            let mut inner = self.lock();
            inner.seq += 1;
            let seq = inner.seq;
            inner.queue.push(QueueEntry {
                priority: task.priority,
                seq,
                task_id: task.task_id.clone(),
            });
            inner.tasks.insert(task.task_id.clone(), task.clone());
        }
        self.wake.notify_one();
        tracing::info!(
            task_id = %task.task_id,
            capability = %task.capability,
            priority = task.priority,
            "task: submitted"
        );
        Ok(task)
    }

    /// submitted -> working.
    pub fn claim_task(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.lock()
            .transition(id, TaskStatus::Working, Utc::now(), |_| {})
    }

    /// working -> completed. A result for a task that already finished
    /// (cancelled or timed out meanwhile) is discarded and counted.
    pub fn complete_task(&self, id: &TaskId, result: Value) -> Result<Task, TaskError> {
        let outcome = self
            .lock()
            .transition(id, TaskStatus::Completed, Utc::now(), |t| t.result = Some(result));
        if let Err(TaskError::InvalidTransition { from, .. }) = &outcome
            && from.is_terminal()
        {
            self.discarded_results.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task_id = %id, status = %from, "task: late result discarded");
        }
        outcome
    }

    /// working|submitted -> failed. Unlike `complete_task`, a failure for a
    /// task that already finished is not counted as a discarded result.
    pub fn fail_task(&self, id: &TaskId, failure: TaskFailure) -> Result<Task, TaskError> {
        let outcome = self
            .lock()
            .transition(id, TaskStatus::Failed, Utc::now(), |t| t.error = Some(failure));
        match &outcome {
            Ok(task) => {
                if let Some(err) = &task.error {
                    tracing::info!(task_id = %id, kind = ?err.kind, "task: failed: {}", err.message);
                }
            }
            Err(TaskError::InvalidTransition { from, .. }) if from.is_terminal() => {
                tracing::debug!(task_id = %id, status = %from, "task: late failure ignored");
            }
            Err(_) => {}
        }
        outcome
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.lock()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    /// Advisory: marks the task failed/cancelled. Work already running is not
    /// interrupted; its result is discarded when it arrives.
    pub fn cancel_task(&self, id: &TaskId) -> Result<Task, TaskError> {
        let task = self
            .lock()
            .transition(id, TaskStatus::Failed, Utc::now(), |t| {
                t.error = Some(TaskFailure::cancelled())
            })?;
        tracing::info!(task_id = %id, "task: cancelled");
        Ok(task)
    }

    /// Pop the highest-priority submitted task and claim it, waiting until one
    /// is available. Returns `None` once `shutdown` fires.
    pub async fn next_claimed(&self, shutdown: &CancellationToken) -> Option<Task> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(task) = self.pop_and_claim() {
                return Some(task);
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    fn pop_and_claim(&self) -> Option<Task> {
        let mut inner = self.lock();
        let now = Utc::now();
        while let Some(entry) = inner.queue.pop() {
            if let Ok(task) = inner.transition(&entry.task_id, TaskStatus::Working, now, |_| {}) {
                return Some(task);
            }
        }
        None
    }

    /// Fail every non-terminal task whose deadline has passed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let expired: Vec<(TaskId, u64)> = inner
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal() && t.deadline() <= now)
            .map(|t| (t.task_id.clone(), t.timeout_seconds))
            .collect();
        for (id, timeout) in &expired {
            let failure = TaskFailure::timed_out(*timeout);
            if inner.transition(id, TaskStatus::Failed, now, |t| t.error = Some(failure)).is_ok() {
                tracing::warn!(task_id = %id, timeout_seconds = timeout, "task: timed out");
            }
        }
        expired.len()
    }

    /// Drop terminal tasks that finished more than `retention` ago.
    pub fn purge_finished(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };
        let mut inner = self.lock();
        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|_, t| !t.status.is_terminal() || t.completed_at.is_none_or(|at| at > cutoff));
        before - inner.tasks.len()
    }

    /// Snapshot of every task, oldest first, optionally only one status.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .lock()
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        tasks
    }

    /// Refuse new tasks from now on.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        self.wake.notify_waiters();
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Fail everything still pending, e.g. on shutdown.
    pub fn fail_unfinished(&self, kind: FailureKind, message: &str) -> usize {
        let mut inner = self.lock();
        let now = Utc::now();
        let pending: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.task_id.clone())
            .collect();
        for id in &pending {
            let failure = TaskFailure::new(kind, message);
            let _ = inner.transition(id, TaskStatus::Failed, now, |t| t.error = Some(failure));
        }
        inner.queue.clear();
        pending.len()
    }

    pub fn counts(&self) -> TaskCounts {
        let inner = self.lock();
        let mut counts = TaskCounts {
            total: inner.tasks.len(),
            queued: inner.queue.len(),
            discarded_results: self.discarded_results.load(Ordering::Relaxed),
            ..TaskCounts::default()
        };
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Submitted => counts.submitted += 1,
                TaskStatus::Working => counts.working += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Tasks that are submitted or working.
    pub fn active(&self) -> usize {
        let c = self.counts();
        c.submitted + c.working
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn new_task(priority: i32) -> NewTask {
        NewTask {
            agent_id: "agent:test".into(),
            capability: "get_current_weather".into(),
            input_data: json!({"location": "Madrid"}),
            priority,
            timeout: Duration::from_secs(120),
        }
    }

    #[test]
    fn full_lifecycle_sets_completed_at_once() {
        let store = TaskStore::new();
        let task = store.create_task(new_task(0)).unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);
        assert!(task.completed_at.is_none());

        store.claim_task(&task.task_id).unwrap();
        let done = store.complete_task(&task.task_id, json!({"ok": true})).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"ok": true})));
        let completed_at = done.completed_at.unwrap();

        let err = store
            .fail_task(&task.task_id, TaskFailure::new(FailureKind::Execution, "boom"))
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { from: TaskStatus::Completed, .. }));
        assert_eq!(store.get_task(&task.task_id).unwrap().completed_at, Some(completed_at));
    }

    #[test]
    fn complete_requires_working() {
        let store = TaskStore::new();
        let task = store.create_task(new_task(0)).unwrap();
        let err = store.complete_task(&task.task_id, json!(1)).unwrap_err();
        assert_eq!(
            err,
            TaskError::InvalidTransition {
                task_id: task.task_id.clone(),
                from: TaskStatus::Submitted,
                to: TaskStatus::Completed
            }
        );
        assert_eq!(store.counts().discarded_results, 0);
    }

    #[test]
    fn unknown_task_is_not_found() {
        let store = TaskStore::new();
        let id = TaskId::from("nope");
        assert_eq!(store.get_task(&id).unwrap_err(), TaskError::NotFound(id.clone()));
        assert_eq!(store.cancel_task(&id).unwrap_err(), TaskError::NotFound(id));
    }

    #[test]
    fn cancel_then_late_result_is_discarded() {
        let store = TaskStore::new();
        let task = store.create_task(new_task(0)).unwrap();
        store.claim_task(&task.task_id).unwrap();

        let cancelled = store.cancel_task(&task.task_id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);
        assert_eq!(cancelled.error.unwrap().kind, FailureKind::Cancelled);

        assert!(store.complete_task(&task.task_id, json!("late")).is_err());
        assert!(store.cancel_task(&task.task_id).is_err());
        let snap = store.get_task(&task.task_id).unwrap();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert!(snap.result.is_none());
        assert_eq!(store.counts().discarded_results, 1);
    }

    #[test]
    fn late_failure_is_not_a_discarded_result() {
        let store = TaskStore::new();
        let task = store.create_task(new_task(0)).unwrap();
        store.claim_task(&task.task_id).unwrap();
        store.cancel_task(&task.task_id).unwrap();

        let late = TaskFailure::new(FailureKind::Execution, "upstream down");
        assert!(store.fail_task(&task.task_id, late).is_err());
        assert_eq!(store.counts().discarded_results, 0);
        let snap = store.get_task(&task.task_id).unwrap();
        assert_eq!(snap.error.unwrap().kind, FailureKind::Cancelled);
    }

    #[test]
    fn sweep_fails_overdue_tasks_in_any_live_state() {
        let store = TaskStore::new();
        let queued = store.create_task(new_task(0)).unwrap();
        let running = store.create_task(new_task(0)).unwrap();
        store.claim_task(&running.task_id).unwrap();
        let finished = store.create_task(new_task(0)).unwrap();
        store.claim_task(&finished.task_id).unwrap();
        store.complete_task(&finished.task_id, json!(1)).unwrap();

        assert_eq!(store.sweep_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(121);
        assert_eq!(store.sweep_expired(later), 2);

        for id in [&queued.task_id, &running.task_id] {
            let t = store.get_task(id).unwrap();
            assert_eq!(t.status, TaskStatus::Failed);
            assert_eq!(t.error.unwrap().kind, FailureKind::Timeout);
        }
        assert_eq!(store.get_task(&finished.task_id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn list_filters_by_status() {
        let store = TaskStore::new();
        let a = store.create_task(new_task(0)).unwrap();
        let b = store.create_task(new_task(0)).unwrap();
        store.cancel_task(&b.task_id).unwrap();

        assert_eq!(store.list(None).len(), 2);
        let failed = store.list(Some(TaskStatus::Failed));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_id, b.task_id);
        let submitted = store.list(Some(TaskStatus::Submitted));
        assert_eq!(submitted[0].task_id, a.task_id);
        assert!(store.list(Some(TaskStatus::Working)).is_empty());
    }

    #[test]
    fn purge_keeps_live_and_recent_tasks() {
        let store = TaskStore::new();
        let live = store.create_task(new_task(0)).unwrap();
        let done = store.create_task(new_task(0)).unwrap();
        store.cancel_task(&done.task_id).unwrap();

        let day = Duration::from_secs(86_400);
        assert_eq!(store.purge_finished(Utc::now(), day), 0);
        let tomorrow = Utc::now() + chrono::Duration::seconds(86_401);
        assert_eq!(store.purge_finished(tomorrow, day), 1);
        assert!(store.get_task(&live.task_id).is_ok());
        assert!(store.get_task(&done.task_id).is_err());
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_submission() {
        let store = TaskStore::new();
        let low = store.create_task(new_task(0)).unwrap();
        let high_a = store.create_task(new_task(5)).unwrap();
        let high_b = store.create_task(new_task(5)).unwrap();
        let skipped = store.create_task(new_task(9)).unwrap();
        store.cancel_task(&skipped.task_id).unwrap();

        let token = CancellationToken::new();
        let order: Vec<TaskId> = vec![
            store.next_claimed(&token).await.unwrap().task_id,
            store.next_claimed(&token).await.unwrap().task_id,
            store.next_claimed(&token).await.unwrap().task_id,
        ];
        assert_eq!(order, vec![high_a.task_id, high_b.task_id, low.task_id]);
        assert_eq!(store.counts().working, 3);
    }

    #[tokio::test]
    async fn next_claimed_returns_none_on_shutdown() {
        let store = Arc::new(TaskStore::new());
        let token = CancellationToken::new();
        let waiter = {
            let store = store.clone();
            let token = token.clone();
            tokio::spawn(async move { store.next_claimed(&token).await })
        };
        token.cancel();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_succeed_at_most_once() {
        let store = Arc::new(TaskStore::new());
        let task = store.create_task(new_task(0)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = task.task_id.clone();
            handles.push(tokio::spawn(async move { store.claim_task(&id).is_ok() }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[test]
    fn closed_store_refuses_and_shutdown_fails_leftovers() {
        let store = TaskStore::new();
        let pending = store.create_task(new_task(0)).unwrap();
        store.close();
        assert_eq!(store.create_task(new_task(0)).unwrap_err(), TaskError::Closed);

        assert_eq!(store.fail_unfinished(FailureKind::Shutdown, "agent shutting down"), 1);
        let t = store.get_task(&pending.task_id).unwrap();
        assert_eq!(t.error.unwrap().kind, FailureKind::Shutdown);
        assert_eq!(store.counts().queued, 0);
    }
}
