use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::job::JobType;

/// Push-message sink keyed by client session id; the transport (WebSocket
/// layer) supplies the concrete implementation.
pub trait EventSink: Send + Sync {
    fn send(&self, session_id: &str, event: &str, payload: Value);
}

/// Abstract push sink over a Job's lifecycle events. `SocketObserver` is the
/// only concrete variant specified.
pub trait Observer: Send + Sync {
    fn id(&self) -> Uuid;
    fn session_id(&self) -> &str;
    fn update_started(&self);
    fn update_percentage(&self, percent: i32);
    fn update_complete(&self, job_type: JobType, results: Value);
    fn update_failed(&self, message: &str);
}

/// Delivers job lifecycle events to one client session through an
/// `EventSink`. Single-shot: callers remove it from the session registry
/// after `update_complete`/`update_failed` fires.
pub struct SocketObserver {
    id: Uuid,
    session_id: String,
    sink: Arc<dyn EventSink>,
}

impl SocketObserver {
    pub fn new(session_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        SocketObserver { id: Uuid::new_v4(), session_id: session_id.into(), sink }
    }
}

impl Observer for SocketObserver {
    fn id(&self) -> Uuid {
        self.id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn update_started(&self) {
        self.sink.send(&self.session_id, "started-processing", json!({}));
    }

    fn update_percentage(&self, percent: i32) {
        self.sink.send(&self.session_id, "progress", json!({ "percent": percent }));
    }

    fn update_complete(&self, job_type: JobType, results: Value) {
        self.sink.send(
            &self.session_id,
            "complete",
            json!({ "type": job_type.as_str(), "results": results }),
        );
    }

    fn update_failed(&self, message: &str) {
        self.sink.send(&self.session_id, "failed", json!({ "error": message }));
    }
}
