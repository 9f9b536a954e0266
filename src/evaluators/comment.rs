use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::bleu::sentence_bleu;
use crate::queue::{CompleteCb, PercentCb};
use crate::reference::ReferenceMap;

struct ParsedComment {
    path: Option<String>,
    line_from: Option<i64>,
    line_to: Option<i64>,
    body: String,
}

/// Accepts either the legacy `id -> string` shape or the full
/// `id -> {path, line_from, line_to, body}` shape.
fn parse_submission(raw: &Value) -> Option<ParsedComment> {
    match raw {
        Value::String(body) => Some(ParsedComment {
            path: None,
            line_from: None,
            line_to: None,
            body: body.clone(),
        }),
        Value::Object(map) => {
            let body = map.get("body")?.as_str()?.to_string();
            let path = map.get("path").and_then(|v| v.as_str()).map(|s| s.to_string());
            let line_from = map.get("line_from").and_then(|v| v.as_i64());
            let line_to = map.get("line_to").and_then(|v| v.as_i64());
            Some(ParsedComment { path, line_from, line_to, body })
        }
        _ => None,
    }
}

fn collapse(from: Option<i64>, to: Option<i64>) -> Option<(i64, i64)> {
    match (from, to) {
        (None, None) => None,
        (Some(x), None) => Some((x, x)),
        (None, Some(y)) => Some((y, y)),
        (Some(x), Some(y)) => Some((x.min(y), x.max(y))),
    }
}

/// Line-gap distance between a submitted and a reference range. `"NA"` when
/// either side has no usable endpoints at all.
pub fn comment_distance(
    sub_from: Option<i64>,
    sub_to: Option<i64>,
    ref_from: Option<i64>,
    ref_to: Option<i64>,
) -> Value {
    let reference = collapse(ref_from, ref_to);
    let submission = collapse(sub_from, sub_to);
    match (reference, submission) {
        (Some((r_start, r_end)), Some((s_start, s_end))) => {
            if r_end >= s_start && s_end >= r_start {
                json!(0)
            } else if r_end < s_start {
                json!(s_start - r_end)
            } else {
                json!(r_start - s_end)
            }
        }
        _ => json!("NA"),
    }
}

fn round2(score: f64) -> f64 {
    (score * 100.0).round() / 100.0
}

/// Scores each submitted comment against its reference's paraphrases. Unknown
/// ids are skipped with a warning; they never appear in `results`. Matches
/// the `EvaluatorTask` signature expected by the queue manager.
pub fn task(
    reference: Arc<ReferenceMap>,
    submissions: Map<String, Value>,
    percent_cb: PercentCb,
    complete_cb: CompleteCb,
) -> BoxFuture<'static, Result<(), String>> {
    Box::pin(async move { run(reference, submissions, Some(percent_cb), Some(complete_cb)).await })
}

async fn run(
    reference: Arc<ReferenceMap>,
    submissions: Map<String, Value>,
    percent_cb: Option<PercentCb>,
    complete_cb: Option<CompleteCb>,
) -> Result<(), String> {
    let mut results = Map::new();
    let total = submissions.len().max(1);

    for (idx, (id, raw)) in submissions.into_iter().enumerate() {
        if let Some(entry) = reference.lookup(&id) {
            if let Some(ref_comment) = entry.comments.first() {
                if let Some(submission) = parse_submission(&raw) {
                    let mut candidates = vec![ref_comment.body.clone()];
                    candidates.extend(ref_comment.paraphrases.iter().cloned());

                    let scores: Vec<f64> = candidates
                        .iter()
                        .map(|candidate| round2(sentence_bleu(&submission.body, &[candidate.as_str()])))
                        .collect();
                    let max_score = scores.iter().cloned().fold(f64::MIN, f64::max);

                    let correct_file = submission
                        .path
                        .as_deref()
                        .map(|p| p == ref_comment.file)
                        .unwrap_or(false);
                    let distance = if correct_file {
                        comment_distance(
                            submission.line_from,
                            submission.line_to,
                            ref_comment.from,
                            ref_comment.to,
                        )
                    } else {
                        json!("NA")
                    };

                    results.insert(
                        id.clone(),
                        json!({
                            "max_bleu_score": max_score,
                            "bleu_scores": scores,
                            "proposed_comment": {
                                "path": submission.path,
                                "line_from": submission.line_from,
                                "line_to": submission.line_to,
                                "body": submission.body,
                            },
                            "correct_file": correct_file,
                            "distance": distance,
                        }),
                    );
                } else {
                    tracing::warn!(id = %id, "malformed comment submission, skipping");
                }
            }
        } else {
            tracing::warn!(id = %id, "unknown reference id, skipping");
        }

        if let Some(cb) = &percent_cb {
            let pct = (((idx + 1) as f64 / total as f64) * 100.0).round() as i32;
            cb(pct);
        }
    }

    if let Some(cb) = complete_cb {
        cb(Value::Object(results));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{Comment, ReferenceEntry};

    fn ref_map_with_one_entry() -> Arc<ReferenceMap> {
        let entry = ReferenceEntry {
            id: "x".into(),
            repo: "owner/name".into(),
            pr_number: 1,
            merge_commit_sha: "sha".into(),
            comments: vec![Comment {
                body: "Fix typo".into(),
                file: "a.java".into(),
                from: Some(10),
                to: Some(12),
                paraphrases: vec!["fix the typo".into()],
            }],
            reason_for_failure: None,
        };
        Arc::new(ReferenceMap::from_rows(vec![entry], false))
    }

    #[tokio::test]
    async fn scores_full_shape_submission_against_paraphrases() {
        let reference = ref_map_with_one_entry();
        let mut submissions = Map::new();
        submissions.insert(
            "x".to_string(),
            json!({"path": "a.java", "line_from": 10, "line_to": 12, "body": "fix typo"}),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        let complete_cb: CompleteCb = Box::new(move |results| {
            let _ = tx.send(results);
        });
        run(reference, submissions, None, Some(complete_cb)).await.unwrap();
        let results = rx.await.unwrap();
        let entry = &results["x"];
        assert_eq!(entry["correct_file"], json!(true));
        assert_eq!(entry["distance"], json!(0));
        assert!(entry["max_bleu_score"].as_f64().unwrap() > 90.0);
    }

    #[tokio::test]
    async fn unknown_id_is_omitted_from_results() {
        let reference = ref_map_with_one_entry();
        let mut submissions = Map::new();
        submissions.insert("unknown".to_string(), json!({"path": "a.java", "body": "whatever"}));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let complete_cb: CompleteCb = Box::new(move |results| {
            let _ = tx.send(results);
        });
        run(reference, submissions, None, Some(complete_cb)).await.unwrap();
        let results = rx.await.unwrap();
        assert!(results.as_object().unwrap().is_empty());
    }

    #[test]
    fn distance_is_zero_when_ranges_overlap_at_one_point() {
        let d = comment_distance(Some(12), Some(15), Some(10), Some(12));
        assert_eq!(d, json!(0));
    }

    #[test]
    fn distance_collapses_single_null_endpoint_per_side() {
        let d = comment_distance(Some(20), None, Some(10), None);
        assert_eq!(d, json!(10));
    }

    #[test]
    fn distance_is_na_when_both_sides_fully_null() {
        assert_eq!(comment_distance(None, None, Some(1), Some(2)), json!("NA"));
        assert_eq!(comment_distance(Some(1), Some(2), None, None), json!("NA"));
    }
}
