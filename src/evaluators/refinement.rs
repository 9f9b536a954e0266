use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::build::{get_build_handler, BUILD_TIMEOUT};
use crate::config::Config;
use crate::error::HandlerError;
use crate::queue::{CompleteCb, PercentCb};
use crate::reference::{ArchiveState, ReferenceMap};

const STEPS_PER_ID: i32 = 4;

fn parse_changes(raw: &Value) -> Option<HashMap<String, String>> {
    let obj = raw.as_object()?;
    let mut out = HashMap::with_capacity(obj.len());
    for (filename, content) in obj {
        out.insert(filename.clone(), content.as_str()?.to_string());
    }
    Some(out)
}

/// Materializes, compiles, and tests each submission's file changes inside an
/// isolated build-handler container. Matches the `EvaluatorTask` signature
/// expected by the queue manager.
pub fn task(
    reference: Arc<ReferenceMap>,
    config: Arc<Config>,
    submissions: Map<String, Value>,
    percent_cb: PercentCb,
    complete_cb: CompleteCb,
) -> BoxFuture<'static, Result<(), String>> {
    Box::pin(async move { run(reference, config, submissions, percent_cb, complete_cb).await })
}

async fn run(
    reference: Arc<ReferenceMap>,
    config: Arc<Config>,
    submissions: Map<String, Value>,
    percent_cb: PercentCb,
    complete_cb: CompleteCb,
) -> Result<(), String> {
    let mut results = Map::new();
    let total_ids = submissions.len().max(1);
    let total_steps = (total_ids as i32) * STEPS_PER_ID;

    for (i, (id, raw)) in submissions.into_iter().enumerate() {
        let mut current = (i as i32) * STEPS_PER_ID;
        let report = |current: i32| {
            let pct = ((current as f64 / total_steps as f64) * 100.0).round() as i32;
            percent_cb(pct);
        };

        let Some(entry) = reference.lookup(&id) else {
            tracing::warn!(id = %id, "unknown reference id, skipping");
            continue;
        };

        let Some(changes) = parse_changes(&raw) else {
            tracing::warn!(id = %id, "malformed refinement submission, skipping");
            continue;
        };

        let archive_name = entry.archive_name(ArchiveState::Merged);
        let mut handler = match get_build_handler(&config, &archive_name).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(id = %id, error = %e.reason_for_failure(), "failed to resolve build handler");
                continue;
            }
        };
        current += 1;
        report(current);

        if let Err(e) = handler.enter().await {
            tracing::warn!(id = %id, error = %e.reason_for_failure(), "failed to start build container");
            continue;
        }

        let mut id_result = Map::new();
        let injection = handler.inject_changes(&changes);
        match injection {
            Ok(()) => {
                id_result.insert("changes_injection".to_string(), json!(true));
                current += 1;
                report(current);

                let compile_result = match tokio::time::timeout(BUILD_TIMEOUT, handler.compile_repo()).await {
                    Ok(res) => res,
                    Err(_) => Err(HandlerError::Timeout),
                };
                match compile_result {
                    Ok(()) => {
                        id_result.insert("compilation".to_string(), json!(true));
                        current += 1;
                        report(current);

                        let test_result = match tokio::time::timeout(BUILD_TIMEOUT, handler.test_repo()).await {
                            Ok(res) => res,
                            Err(_) => Err(HandlerError::Timeout),
                        };
                        match test_result {
                            Ok(test_summary) => {
                                id_result.insert("test".to_string(), json!(true));
                                id_result.insert("tests_passed".to_string(), json!(test_summary.passed));
                                id_result.insert("tests_run".to_string(), json!(test_summary.total));
                                current += 1;
                                report(current);
                            }
                            Err(e) => {
                                id_result.insert("test".to_string(), json!(false));
                                id_result.insert("test_error_msg".to_string(), json!(e.reason_for_failure()));
                            }
                        }
                    }
                    Err(e) => {
                        id_result.insert("compilation".to_string(), json!(false));
                        id_result.insert("compilation_error_msg".to_string(), json!(e.reason_for_failure()));
                    }
                }
            }
            Err(e) => {
                id_result.insert("changes_injection".to_string(), json!(false));
                id_result.insert("changes_injection_error_msg".to_string(), json!(e.reason_for_failure()));
            }
        }

        handler.exit().await;
        results.insert(id, Value::Object(id_result));
    }

    complete_cb(Value::Object(results));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_filename_to_content_map() {
        let raw = json!({"src/A.java": "class A {}", "README.md": "hi"});
        let changes = parse_changes(&raw).unwrap();
        assert_eq!(changes.get("src/A.java").unwrap(), "class A {}");
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn rejects_non_string_values() {
        let raw = json!({"A.java": 5});
        assert!(parse_changes(&raw).is_none());
    }

    #[test]
    fn rejects_non_object_payload() {
        assert!(parse_changes(&json!("not an object")).is_none());
    }

    #[tokio::test]
    async fn run_actually_builds_and_tests_entries_loaded_from_a_flat_json_array() {
        let raw = r#"[
            {"id": "x", "repo": "owner/name", "pr_number": 1, "merge_commit_sha": "sha"}
        ]"#;
        let reference = Arc::new(ReferenceMap::from_json_str(raw, false).unwrap());

        let mut config = Config::default();
        config.mock_build_handler = true;
        let config = Arc::new(config);

        let mut submissions = Map::new();
        submissions.insert("x".to_string(), json!({"A.java": "class A {}"}));

        let percent_cb: PercentCb = Arc::new(|_| {});
        let (tx, rx) = tokio::sync::oneshot::channel();
        let complete_cb: CompleteCb = Box::new(move |results| {
            let _ = tx.send(results);
        });

        run(reference, config, submissions, percent_cb, complete_cb).await.unwrap();
        let results = rx.await.unwrap();

        let entry_result = &results["x"];
        assert_eq!(entry_result["changes_injection"], json!(true));
        assert_eq!(entry_result["compilation"], json!(true));
        assert_eq!(entry_result["test"], json!(true));
        assert_eq!(entry_result["tests_passed"], json!(1));
    }
}
