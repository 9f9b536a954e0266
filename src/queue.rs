use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::job::Job;
use crate::registry::Registry;
use crate::result_store::ResultStore;

pub type PercentCb = Arc<dyn Fn(i32) + Send + Sync>;
pub type CompleteCb = Box<dyn FnOnce(Value) + Send>;

/// An evaluator: given the raw submission payload and the two callbacks a
/// Job exposes, runs to completion (calling `complete_cb` itself) or returns
/// an error message describing why it could not.
pub type EvaluatorTask =
    Box<dyn FnOnce(Value, PercentCb, CompleteCb) -> BoxFuture<'static, Result<(), String>> + Send>;

/// Bounded worker pool draining a FIFO wait queue. A `tokio::sync::Semaphore`
/// bounds parallelism to `max_workers`; its waiters are served in admission
/// order, giving the wait queue FIFO semantics without a dedicated
/// dispatcher task.
pub struct QueueManager {
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    wait_queue: Arc<Mutex<VecDeque<String>>>,
}

impl QueueManager {
    pub fn new(max_workers: usize) -> Self {
        QueueManager {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            wait_queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// 1-based position in the wait queue, or 0 if the job isn't waiting.
    pub fn get_position(&self, job_id: &str) -> usize {
        let queue = self.wait_queue.lock().unwrap();
        queue.iter().position(|id| id == job_id).map(|idx| idx + 1).unwrap_or(0)
    }

    /// Marks `job` waiting, enqueues it, and spawns the work item that will
    /// run `task` once a worker slot is free. Crashes (panics or returned
    /// errors) are caught at this boundary and transition the job to
    /// `Failed` so it never sits orphaned in `Processing`.
    pub fn submit(
        &self,
        job: Arc<Job>,
        payload: Value,
        task: EvaluatorTask,
        store: Arc<ResultStore>,
        registry: Arc<Registry>,
    ) {
        job.mark_waiting();
        self.wait_queue.lock().unwrap().push_back(job.id.clone());

        let semaphore = self.semaphore.clone();
        let wait_queue = self.wait_queue.clone();

        tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await.expect("semaphore closed");

            wait_queue.lock().unwrap().retain(|id| id != &job.id);
            job.notify_started();

            let percent_job = job.clone();
            let percent_cb: PercentCb = Arc::new(move |p| percent_job.notify_percentage(p));

            let complete_job = job.clone();
            let complete_store = store.clone();
            let complete_registry = registry.clone();
            let complete_cb: CompleteCb = Box::new(move |results| {
                complete_job.notify_complete(results, &complete_store, &complete_registry)
            });

            let outcome = AssertUnwindSafe(task(payload, percent_cb, complete_cb))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    tracing::error!(job_id = %job.id, error = %message, "evaluator reported failure");
                    job.notify_failed(message, &store, &registry);
                }
                Err(panic) => {
                    let message = panic_message(panic);
                    tracing::error!(job_id = %job.id, error = %message, "worker panicked");
                    job.notify_failed(message, &store, &registry);
                }
            }

            drop(permit);
        });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;

    fn ok_task(sleep_ms: u64) -> EvaluatorTask {
        Box::new(move |_payload, _percent_cb, complete_cb| {
            async move {
                if sleep_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                }
                complete_cb(serde_json::json!({}));
                Ok(())
            }
            .boxed()
        })
    }

    fn failing_task() -> EvaluatorTask {
        Box::new(|_payload, _percent_cb, _complete_cb| {
            async move { Err("deliberate failure".to_string()) }.boxed()
        })
    }

    fn panicking_task() -> EvaluatorTask {
        Box::new(|_payload, _percent_cb, _complete_cb| {
            async move { panic!("boom") }.boxed()
        })
    }

    #[tokio::test]
    async fn position_is_zero_before_submit_and_nonzero_while_waiting() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ResultStore::new(tmp.path()).unwrap());
        let queue = QueueManager::new(1);
        assert_eq!(queue.get_position("nope"), 0);

        let (id, _) = store.reserve("comment").unwrap();
        let job = Arc::new(Job::new(id.clone(), JobType::Comment));
        let registry = Arc::new(Registry::new());
        queue.submit(job, serde_json::json!({}), ok_task(50), store, registry);
        // position may already be 0 if the single worker grabbed it
        // immediately; either 0 (processing) or 1 (still queued) is valid.
        let pos = queue.get_position(&id);
        assert!(pos == 0 || pos == 1);
    }

    #[tokio::test]
    async fn failing_task_transitions_job_to_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ResultStore::new(tmp.path()).unwrap());
        let queue = QueueManager::new(1);
        let (id, path) = store.reserve("comment").unwrap();
        let job = Arc::new(Job::new(id.clone(), JobType::Comment));
        let registry = Arc::new(Registry::new());

        queue.submit(job.clone(), serde_json::json!({}), failing_task(), store, registry);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(job.status(), crate::job::JobStatus::Failed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn panicking_task_transitions_job_to_failed_not_stuck() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ResultStore::new(tmp.path()).unwrap());
        let queue = QueueManager::new(1);
        let (id, _) = store.reserve("comment").unwrap();
        let job = Arc::new(Job::new(id.clone(), JobType::Comment));
        let registry = Arc::new(Registry::new());

        queue.submit(job.clone(), serde_json::json!({}), panicking_task(), store, registry);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(job.status(), crate::job::JobStatus::Failed);
    }

    #[tokio::test]
    async fn max_workers_plus_one_stays_waiting_at_position_one() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ResultStore::new(tmp.path()).unwrap());
        let queue = QueueManager::new(2);
        let registry = Arc::new(Registry::new());

        let mut jobs = Vec::new();
        for _ in 0..3 {
            let (id, _) = store.reserve("comment").unwrap();
            let job = Arc::new(Job::new(id, JobType::Comment));
            queue.submit(
                job.clone(),
                serde_json::json!({}),
                ok_task(200),
                store.clone(),
                registry.clone(),
            );
            jobs.push(job);
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(queue.get_position(&jobs[2].id), 1);
    }
}
