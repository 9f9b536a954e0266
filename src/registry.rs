use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

/// Process-wide relations `sessionId -> Observer` and `Observer -> Job`,
/// kept as id pairs rather than module-level mutable globals so lifetimes
/// stay bounded by registry membership. A single coarse lock serializes all
/// mutations; callers (the status endpoint, the disconnect handler) use the
/// primitives here to enforce "one live subscription per session per job".
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    session_to_observer: HashMap<String, Uuid>,
    observer_to_job: HashMap<Uuid, String>,
}

/// What a session is currently bound to, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub observer_id: Uuid,
    pub job_id: String,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Current binding for a session, without mutating anything.
    pub fn lookup(&self, session_id: &str) -> Option<Binding> {
        let inner = self.inner.lock().unwrap();
        let observer_id = *inner.session_to_observer.get(session_id)?;
        let job_id = inner.observer_to_job.get(&observer_id)?.clone();
        Some(Binding { observer_id, job_id })
    }

    /// Records a fresh session -> observer -> job binding. Callers must have
    /// already unbound any previous binding for this session.
    pub fn bind(&self, session_id: &str, observer_id: Uuid, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.session_to_observer.insert(session_id.to_string(), observer_id);
        inner.observer_to_job.insert(observer_id, job_id.to_string());
    }

    /// Removes a session's binding and returns what it was bound to, if
    /// anything. Idempotent.
    pub fn unbind_session(&self, session_id: &str) -> Option<Binding> {
        let mut inner = self.inner.lock().unwrap();
        let observer_id = inner.session_to_observer.remove(session_id)?;
        let job_id = inner.observer_to_job.remove(&observer_id)?;
        Some(Binding { observer_id, job_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_then_lookup_round_trips() {
        let reg = Registry::new();
        let obs_id = Uuid::new_v4();
        reg.bind("sess-1", obs_id, "job-1");
        let binding = reg.lookup("sess-1").unwrap();
        assert_eq!(binding.observer_id, obs_id);
        assert_eq!(binding.job_id, "job-1");
    }

    #[test]
    fn unbind_removes_both_sides_and_is_idempotent() {
        let reg = Registry::new();
        let obs_id = Uuid::new_v4();
        reg.bind("sess-1", obs_id, "job-1");

        let first = reg.unbind_session("sess-1");
        assert!(first.is_some());
        assert!(reg.lookup("sess-1").is_none());

        let second = reg.unbind_session("sess-1");
        assert!(second.is_none());
    }

    #[test]
    fn unknown_session_lookup_is_none() {
        let reg = Registry::new();
        assert!(reg.lookup("nobody").is_none());
    }

    #[test]
    fn rebinding_a_session_to_a_new_job_replaces_the_old_binding() {
        let reg = Registry::new();
        let obs_a = Uuid::new_v4();
        reg.bind("sess-1", obs_a, "job-1");
        reg.unbind_session("sess-1");

        let obs_b = Uuid::new_v4();
        reg.bind("sess-1", obs_b, "job-2");
        let binding = reg.lookup("sess-1").unwrap();
        assert_eq!(binding.job_id, "job-2");
        assert_eq!(binding.observer_id, obs_b);
    }
}
