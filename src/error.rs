use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

pub type ServerResult<T> = Result<T, ServerError>;

/// Top-level error surfaced across the HTTP/WS boundary.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already listening")]
    AlreadyListening,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServerError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ServerError::AlreadyListening => (
                StatusCode::BAD_REQUEST,
                "You are already seeing the real-time progress of that request, please don't spam"
                    .to_string(),
            ),
            ServerError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ServerError::Json(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ServerError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        tracing::error!(status = %status, error = %message, "request failed");

        (status, Json(json!({ "error": status.to_string(), "message": message }))).into_response()
    }
}

impl From<&str> for ServerError {
    fn from(value: &str) -> Self {
        ServerError::Internal(value.to_string())
    }
}

impl From<String> for ServerError {
    fn from(value: String) -> Self {
        ServerError::Internal(value)
    }
}

/// Errors encountered while resolving and preparing a build handler for a
/// code-refinement submission (archive resolution, not per-step execution).
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetupError {
    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("archive is not a valid gzip tarball: {0}")]
    NotATarball(String),

    #[error("no recognized build file (pom.xml or build.gradle) found at archive root")]
    NoBuildFileFound,

    #[error("archive root is ambiguous: both pom.xml and build.gradle are present")]
    AmbiguousBuildFile,

    #[error("io error while preparing archive: {0}")]
    Io(String),
}

impl SetupError {
    pub fn reason_for_failure(&self) -> String {
        self.to_string()
    }
}

/// Errors encountered while operating a resolved build handler: injection,
/// compilation, testing, coverage.
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerError {
    #[error("path escapes repository root: {0}")]
    PathEscape(String),

    #[error("container runtime error: {0}")]
    Container(String),

    #[error("compilation failed: {0}")]
    CompileFailed(String),

    #[error("tests failed: {0}")]
    TestFailed(String),

    #[error("build timed out after one hour")]
    Timeout,

    #[error("no test results found in build output")]
    NoTestResults,

    #[error("failed to inject coverage plugin: {0}")]
    CoverageInjectionFailed(String),

    #[error("file is not a Java source file: {0}")]
    NotJavaFile(String),

    #[error("file not found in repository: {0}")]
    FileNotFoundInRepo(String),

    #[error("no package declaration found in file: {0}")]
    NoPackageFound(String),

    #[error("file not covered by any report: {0}")]
    FileNotCovered(String),

    #[error("io error: {0}")]
    Io(String),
}

impl HandlerError {
    pub fn reason_for_failure(&self) -> String {
        self.to_string()
    }
}
