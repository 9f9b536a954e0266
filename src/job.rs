use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use uuid::Uuid;

use crate::observer::Observer;
use crate::registry::Registry;
use crate::result_store::ResultStore;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    Comment,
    Refinement,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Comment => "comment",
            JobType::Refinement => "refinement",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comment" => Ok(JobType::Comment),
            "refinement" => Ok(JobType::Refinement),
            _ => Err(()),
        }
    }
}

/// `Created -> Waiting -> Processing -> {Complete | Failed}`. `Failed` is an
/// added terminal state: the reference implementation left a crashed worker's
/// job stuck in `Processing` forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Waiting,
    Processing,
    Complete,
    Failed,
}

/// One submission's state, observer set, percent, and results. `id` equals
/// the backing result-store filename so recovery can rebind it.
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub created_at: i64,
    status: Mutex<JobStatus>,
    percent: Mutex<i32>,
    results: Mutex<Option<Value>>,
    error: Mutex<Option<String>>,
    observers: Mutex<HashMap<Uuid, Arc<dyn Observer>>>,
}

impl Job {
    pub fn new(id: String, job_type: JobType) -> Self {
        Job {
            id,
            job_type,
            created_at: chrono::Utc::now().timestamp(),
            status: Mutex::new(JobStatus::Created),
            percent: Mutex::new(-1),
            results: Mutex::new(None),
            error: Mutex::new(None),
            observers: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds an already-completed Job, as recovered from the result store
    /// at startup.
    pub fn recovered(id: String, job_type: JobType, results: Value) -> Self {
        Job {
            id,
            job_type,
            created_at: chrono::Utc::now().timestamp(),
            status: Mutex::new(JobStatus::Complete),
            percent: Mutex::new(100),
            results: Mutex::new(Some(results)),
            error: Mutex::new(None),
            observers: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap()
    }

    pub fn percent(&self) -> i32 {
        *self.percent.lock().unwrap()
    }

    pub fn results(&self) -> Option<Value> {
        self.results.lock().unwrap().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    pub fn mark_waiting(&self) {
        *self.status.lock().unwrap() = JobStatus::Waiting;
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.lock().unwrap().insert(observer.id(), observer);
    }

    pub fn unregister_observer(&self, observer_id: &Uuid) -> Option<Arc<dyn Observer>> {
        self.observers.lock().unwrap().remove(observer_id)
    }

    fn drain_observers(&self) -> Vec<Arc<dyn Observer>> {
        std::mem::take(&mut *self.observers.lock().unwrap()).into_values().collect()
    }

    fn snapshot_observers(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.lock().unwrap().values().cloned().collect()
    }

    /// Transitions into `Processing` and fans `update_started` out to every
    /// observer. Actually invoked from the queue manager on dequeue, unlike
    /// the reference implementation where the equivalent call is a dead
    /// method reference.
    pub fn notify_started(&self) {
        *self.status.lock().unwrap() = JobStatus::Processing;
        for obs in self.snapshot_observers() {
            obs.update_started();
        }
    }

    pub fn notify_percentage(&self, percent: i32) {
        *self.percent.lock().unwrap() = percent;
        for obs in self.snapshot_observers() {
            obs.update_percentage(percent);
        }
    }

    /// Marks the job complete, fans out and drains observers (unbinding each
    /// from the session registry since it is single-shot), and finalizes the
    /// backing result-store entry.
    pub fn notify_complete(&self, results: Value, store: &ResultStore, registry: &Registry) {
        *self.status.lock().unwrap() = JobStatus::Complete;
        *self.results.lock().unwrap() = Some(results.clone());
        let observers = self.drain_observers();
        for obs in observers {
            obs.update_complete(self.job_type, results.clone());
            registry.unbind_session(obs.session_id());
        }
        if let Err(e) = store.finalize(&self.id, &results) {
            tracing::error!(job_id = %self.id, error = %e, "failed to finalize job results");
        }
    }

    /// Marks the job failed, fans out and drains observers (unbinding each
    /// from the session registry since it is single-shot), and removes the
    /// reserved (still-empty) result file rather than finalizing it.
    pub fn notify_failed(&self, message: String, store: &ResultStore, registry: &Registry) {
        *self.status.lock().unwrap() = JobStatus::Failed;
        *self.error.lock().unwrap() = Some(message.clone());
        let observers = self.drain_observers();
        for obs in observers {
            obs.update_failed(&message);
            registry.unbind_session(obs.session_id());
        }
        store.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::SocketObserver;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        events: StdMutex<Vec<(String, String)>>,
    }

    impl crate::observer::EventSink for RecordingSink {
        fn send(&self, session_id: &str, event: &str, _payload: Value) {
            self.events.lock().unwrap().push((session_id.to_string(), event.to_string()));
        }
    }

    #[test]
    fn starts_created_and_transitions_forward() {
        let job = Job::new("id-1".into(), JobType::Comment);
        assert_eq!(job.status(), JobStatus::Created);
        job.mark_waiting();
        assert_eq!(job.status(), JobStatus::Waiting);
        job.notify_started();
        assert_eq!(job.status(), JobStatus::Processing);
    }

    #[test]
    fn notify_complete_drains_observers_and_unbinds_the_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path()).unwrap();
        let (id, _) = store.reserve("comment").unwrap();
        let job = Job::new(id.clone(), JobType::Comment);
        let registry = Registry::new();

        let sink = Arc::new(RecordingSink { events: StdMutex::new(Vec::new()) });
        let obs = Arc::new(SocketObserver::new("sess", sink.clone()));
        registry.bind("sess", obs.id(), &job.id);
        job.register_observer(obs);

        job.notify_complete(serde_json::json!({"ok": true}), &store, &registry);

        assert_eq!(job.status(), JobStatus::Complete);
        assert!(job.observers.lock().unwrap().is_empty());
        assert!(registry.lookup("sess").is_none());
        let events = sink.events.lock().unwrap();
        assert_eq!(events.last().unwrap().1, "complete");

        let finalized = std::fs::read_to_string(tmp.path().join(&id)).unwrap();
        assert!(!finalized.is_empty());
    }

    #[test]
    fn notify_failed_removes_reserved_file_and_unbinds_the_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path()).unwrap();
        let (id, path) = store.reserve("refinement").unwrap();
        let job = Job::new(id.clone(), JobType::Refinement);
        let registry = Registry::new();

        let sink = Arc::new(RecordingSink { events: StdMutex::new(Vec::new()) });
        let obs = Arc::new(SocketObserver::new("sess", sink.clone()));
        registry.bind("sess", obs.id(), &job.id);
        job.register_observer(obs);

        job.notify_failed("worker panicked".into(), &store, &registry);

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error().as_deref(), Some("worker panicked"));
        assert!(!path.exists());
        assert!(registry.lookup("sess").is_none());
    }

    #[test]
    fn percent_starts_at_negative_one() {
        let job = Job::new("id-2".into(), JobType::Comment);
        assert_eq!(job.percent(), -1);
        job.notify_percentage(0);
        assert_eq!(job.percent(), 0);
        job.notify_percentage(50);
        assert_eq!(job.percent(), 50);
    }
}
