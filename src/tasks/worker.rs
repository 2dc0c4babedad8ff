// Clima Agent -- Task workers
//
// Fixed pool of tokio tasks draining the store's priority queue. Each claimed
// task runs through `Dispatcher::execute_task` (rate limit excluded, breaker
// and cache included) bounded by whatever is left of its deadline. The
// deadline is handed down so a hung upstream call is cut off inside the
// dispatcher and counted against its breaker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{FailureKind, Task, TaskFailure};
use crate::dispatcher::Dispatcher;

pub fn spawn_workers(
    count: usize,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    tracing::info!("workers: starting {} task workers", count);
    (0..count)
        .map(|worker| {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while let Some(task) = dispatcher.tasks().next_claimed(&shutdown).await {
                    run_task(worker, &dispatcher, task).await;
                }
                tracing::debug!(worker, "workers: worker stopped");
            })
        })
        .collect()
}

async fn run_task(worker: usize, dispatcher: &Dispatcher, task: Task) {
    let remaining = (task.deadline() - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    tracing::info!(
        worker,
        task_id = %task.task_id,
        capability = %task.capability,
        remaining_ms = remaining.as_millis() as u64,
        "task: started"
    );

    let store = dispatcher.tasks();
    if remaining.is_zero() {
        let _ = store.fail_task(&task.task_id, TaskFailure::timed_out(task.timeout_seconds));
        return;
    }

    let deadline = Instant::now() + remaining;
    let failure = match tokio::time::timeout_at(deadline, dispatcher.execute_task(&task, deadline)).await {
        Ok(Ok(result)) => {
            if store.complete_task(&task.task_id, result).is_ok() {
                tracing::info!(worker, task_id = %task.task_id, "task: completed");
            }
            return;
        }
        // The upstream call was cut off at the deadline and already reported
        // to its breaker.
        Ok(Err(_)) if Instant::now() >= deadline => TaskFailure::timed_out(task.timeout_seconds),
        Ok(Err(err)) => TaskFailure::new(FailureKind::Execution, err.to_rpc_error().message),
        Err(_) => TaskFailure::timed_out(task.timeout_seconds),
    };
    let _ = store.fail_task(&task.task_id, failure);
}
