pub mod http;
pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::job::Job;
use crate::observer::EventSink;
use crate::queue::QueueManager;
use crate::reference::ReferenceMap;
use crate::registry::Registry;
use crate::result_store::{RecoveredJob, ResultStore};

/// Per-session outbound event channel, the WebSocket layer's concrete
/// implementation of the push-message sink an `Observer` delivers through.
#[derive(Default)]
pub struct WsSink {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<(String, Value)>>>,
}

impl WsSink {
    pub fn register(&self, session_id: String) -> mpsc::UnboundedReceiver<(String, Value)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(session_id, tx);
        rx
    }

    pub fn unregister(&self, session_id: &str) {
        self.senders.lock().unwrap().remove(session_id);
    }
}

impl EventSink for WsSink {
    fn send(&self, session_id: &str, event: &str, payload: Value) {
        let senders = self.senders.lock().unwrap();
        if let Some(tx) = senders.get(session_id) {
            let _ = tx.send((event.to_string(), payload));
        }
    }
}

/// Process-wide shared state handed to every axum handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub reference: Arc<ReferenceMap>,
    pub result_store: Arc<ResultStore>,
    pub registry: Arc<Registry>,
    pub queue: Arc<QueueManager>,
    pub jobs: Mutex<HashMap<String, Arc<Job>>>,
    pub sink: Arc<WsSink>,
}

impl AppState {
    pub fn new(config: Config) -> std::io::Result<Arc<Self>> {
        let config = Arc::new(config);

        let reference = match ReferenceMap::load(&config.dataset_path, false) {
            Ok(map) => Arc::new(map),
            Err(e) => {
                tracing::warn!(error = %e, path = %config.dataset_path.display(), "failed to load reference dataset, starting with an empty one");
                Arc::new(ReferenceMap::default())
            }
        };

        let result_store = Arc::new(ResultStore::new(&config.results_dir)?);
        let recovered = result_store.recover()?;

        let mut jobs = HashMap::new();
        for RecoveredJob { id, job_type, results } in recovered {
            let Ok(job_type) = job_type.parse() else {
                tracing::warn!(id = %id, job_type, "recovered job has an unrecognized type, dropping");
                continue;
            };
            jobs.insert(id.clone(), Arc::new(Job::recovered(id, job_type, results)));
        }
        tracing::info!(count = jobs.len(), "recovered completed jobs from result store");

        Ok(Arc::new(AppState {
            queue: Arc::new(QueueManager::new(config.max_workers)),
            registry: Arc::new(Registry::new()),
            sink: Arc::new(WsSink::default()),
            config,
            reference,
            result_store,
            jobs: Mutex::new(jobs),
        }))
    }

    pub fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    pub fn insert_job(&self, job: Arc<Job>) {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
    }
}

/// Builds the full axum router: static index, health route, submission and
/// status routes, dataset downloads, and the WebSocket upgrade endpoint.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    use tower_http::trace::TraceLayer;

    axum::Router::new()
        .merge(http::router())
        .merge(ws::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
