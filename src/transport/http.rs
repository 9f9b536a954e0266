use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{ServerError, ServerResult};
use crate::evaluators::{comment, refinement};
use crate::job::{Job, JobStatus, JobType};
use crate::observer::SocketObserver;

use super::AppState;

pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/", get(index))
        .route("/api/hello", get(hello))
        .route("/answers/submit/:task", post(submit))
        .route("/answers/status/:id", get(status))
        .route("/datasets/download/:dataset", get(download_dataset))
}

async fn index() -> &'static str {
    "crab-server evaluation API"
}

async fn hello() -> Json<Value> {
    Json(json!({ "message": "hello" }))
}

fn validate_comment_submission(raw: &Value) -> Result<Map<String, Value>, String> {
    let obj = raw
        .as_object()
        .ok_or_else(|| "Submitted json doesn't contain an object".to_string())?;

    for submission in obj.values() {
        match submission {
            Value::String(_) => {}
            Value::Object(fields) => {
                let body_ok = fields.get("body").map(|v| v.is_string()).unwrap_or(false);
                if !body_ok {
                    return Err(
                        "Submitted json object must be str -> {path, line_from, line_to, body}, with body as a string"
                            .to_string(),
                    );
                }
                if let Some(path) = fields.get("path") {
                    if !path.is_string() {
                        return Err("`path` must be a string".to_string());
                    }
                }
                for key in ["line_from", "line_to"] {
                    if let Some(v) = fields.get(key) {
                        if !v.is_i64() && !v.is_u64() && !v.is_null() {
                            return Err(format!("`{key}` must be an int or null"));
                        }
                    }
                }
            }
            _ => {
                return Err(
                    "Submitted json object must only be str -> str, or str -> object".to_string(),
                )
            }
        }
    }
    Ok(obj.clone())
}

fn validate_refinement_submission(raw: &Value) -> Result<Map<String, Value>, String> {
    let obj = raw
        .as_object()
        .ok_or_else(|| "Submitted json doesn't contain an object".to_string())?;

    for submission in obj.values() {
        let inner = submission
            .as_object()
            .ok_or_else(|| "Submitted json object must be str -> {str -> str}".to_string())?;
        for content in inner.values() {
            if !content.is_string() {
                return Err(
                    "Submitted json object must be str -> {filename -> contents}, with contents as a string"
                        .to_string(),
                );
            }
        }
    }
    Ok(obj.clone())
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Path(task): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ServerResult<Json<Value>> {
    let job_type: JobType = task
        .parse()
        .map_err(|_| ServerError::BadRequest(format!("unknown task `{task}`")))?;

    let mut file_bytes: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("").to_string();
            if !filename.to_lowercase().ends_with(".json") {
                return Err(ServerError::BadRequest("Only JSON files are allowed".to_string()));
            }
            let bytes = field.bytes().await.map_err(|e| ServerError::BadRequest(e.to_string()))?;
            file_bytes = Some(bytes.to_vec());
        }
    }
    let Some(bytes) = file_bytes else {
        return Err(ServerError::BadRequest("Only JSON files are allowed".to_string()));
    };

    let raw: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ServerError::BadRequest(format!("Invalid JSON format: {e}")))?;

    let validated = match job_type {
        JobType::Comment => validate_comment_submission(&raw),
        JobType::Refinement => validate_refinement_submission(&raw),
    }
    .map_err(|msg| ServerError::BadRequest(format!("Invalid JSON format: {msg}")))?;

    let (id, _path) = state
        .result_store
        .reserve(job_type.as_str())
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    let job = Arc::new(Job::new(id.clone(), job_type));
    state.insert_job(job.clone());

    let payload = Value::Object(validated);
    let reference = state.reference.clone();
    let config = state.config.clone();

    match job_type {
        JobType::Comment => {
            let task: crate::queue::EvaluatorTask =
                Box::new(move |payload, percent_cb, complete_cb| {
                    let submissions = payload.as_object().cloned().unwrap_or_default();
                    comment::task(reference, submissions, percent_cb, complete_cb)
                });
            state.queue.submit(
                job.clone(),
                payload,
                task,
                state.result_store.clone(),
                state.registry.clone(),
            );
        }
        JobType::Refinement => {
            let task: crate::queue::EvaluatorTask =
                Box::new(move |payload, percent_cb, complete_cb| {
                    let submissions = payload.as_object().cloned().unwrap_or_default();
                    refinement::task(reference, config, submissions, percent_cb, complete_cb)
                });
            state.queue.submit(
                job.clone(),
                payload,
                task,
                state.result_store.clone(),
                state.registry.clone(),
            );
        }
    }

    if let Some(sid) = headers.get("X-Socket-Id").and_then(|v| v.to_str().ok()) {
        state.sink.send(sid, "successful-upload", json!({ "id": id }));
    }

    Ok(Json(json!({
        "id": id,
        "status_url": format!("/answers/status/{id}"),
        "help_msg": "Check the status of this process at /answers/status/<id>. Once the evaluation is complete, a call to this URL will return the results.",
    })))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ServerResult<Json<Value>> {
    let job = state
        .get_job(&id)
        .ok_or_else(|| ServerError::NotFound(format!("Id {id} doesn't exist")))?;

    if job.status() == JobStatus::Complete {
        return Ok(Json(json!({
            "status": "complete",
            "type": job.job_type.as_str(),
            "created_at": job.created_at,
            "results": job.results(),
        })));
    }
    if job.status() == JobStatus::Failed {
        return Ok(Json(json!({
            "status": "failed",
            "created_at": job.created_at,
            "error": job.error(),
        })));
    }

    let session_id = headers.get("X-Socket-Id").and_then(|v| v.to_str().ok());

    if let Some(sid) = session_id {
        if let Some(binding) = state.registry.lookup(sid) {
            if binding.job_id == job.id {
                return Err(ServerError::AlreadyListening);
            }
            if let Some(prev_job) = state.get_job(&binding.job_id) {
                prev_job.unregister_observer(&binding.observer_id);
            }
            state.registry.unbind_session(sid);
            state.sink.send(sid, "changing-subject", json!({}));
        }
    }

    match job.status() {
        JobStatus::Processing => {
            if let Some(sid) = session_id {
                attach_observer(&state, &job, sid, true);
            }
            Ok(Json(json!({ "status": "processing", "percent": job.percent() })))
        }
        JobStatus::Waiting => {
            if let Some(sid) = session_id {
                attach_observer(&state, &job, sid, false);
            }
            Ok(Json(json!({
                "status": "waiting",
                "queue_position": state.queue.get_position(&job.id),
            })))
        }
        JobStatus::Created => Ok(Json(json!({ "status": "created" }))),
        JobStatus::Complete | JobStatus::Failed => unreachable!("handled above"),
    }
}

fn attach_observer(state: &Arc<AppState>, job: &Arc<Job>, session_id: &str, fire_immediately: bool) {
    let observer = Arc::new(SocketObserver::new(session_id.to_string(), state.sink.clone()));
    if fire_immediately {
        observer.update_percentage(job.percent());
    }
    state.registry.bind(session_id, observer.id(), &job.id);
    job.register_observer(observer);
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default, rename = "withContext")]
    with_context: Option<bool>,
}

async fn download_dataset(
    State(state): State<Arc<AppState>>,
    Path(dataset): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ServerResult<impl IntoResponse> {
    const DATASETS: [&str; 2] = ["comment_generation", "code_refinement"];
    if !DATASETS.contains(&dataset.as_str()) {
        return Err(ServerError::BadRequest(format!("unknown dataset `{dataset}`")));
    }

    let suffix = if query.with_context.unwrap_or(false) { "with_context" } else { "no_context" };
    let filename = format!("{dataset}_{suffix}.zip");
    let path = state.config.data_path.join(&filename);

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ServerError::NotFound(format!("dataset archive `{filename}` not found")))?;

    let content_disposition = format!("attachment; filename=\"{filename}\"");
    Ok((
        StatusCode::OK,
        [
            ("Content-Type", "application/zip".to_string()),
            ("Content-Disposition", content_disposition),
        ],
        bytes,
    ))
}
