use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;
use uuid::Uuid;

const PREFIX: &str = "crab";
const TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A completed job rehydrated from disk at startup.
pub struct RecoveredJob {
    pub id: String,
    pub job_type: String,
    pub results: serde_json::Value,
}

/// On-disk directory of job results. Each filename is `<prefix>_<type>_<nonce>`;
/// a zero-size file means "reserved, still running", non-empty means
/// "completed, payload is the JSON of results".
pub struct ResultStore {
    dir: PathBuf,
    /// Cancellation handles for in-flight TTL expiry timers, keyed by job id.
    timers: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(ResultStore { dir, timers: Mutex::new(HashMap::new()) })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Atomically creates a uniquely-named empty file inside the results
    /// directory and returns its id and path.
    pub fn reserve(&self, job_type: &str) -> std::io::Result<(String, PathBuf)> {
        let nonce = Uuid::new_v4().simple().to_string();
        let id = format!("{PREFIX}_{job_type}_{nonce}");
        let path = self.path_for(&id);
        // `create_new` is the atomic-uniqueness primitive: fails if the name
        // already exists instead of silently truncating.
        std::fs::OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok((id, path))
    }

    /// Overwrites the reserved file with the serialized results and schedules
    /// a one-week expiry timer.
    pub fn finalize(&self, id: &str, results: &serde_json::Value) -> std::io::Result<()> {
        let path = self.path_for(id);
        let body = serde_json::to_vec(results)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, body)?;
        self.schedule_expiry(id.to_string(), TTL);
        Ok(())
    }

    /// Idempotent deletion of a job's file, cancelling any pending timer.
    pub fn remove(&self, id: &str) {
        if let Some(tx) = self.timers.lock().unwrap().remove(id) {
            let _ = tx.send(());
        }
        let path = self.path_for(id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(id, error = %e, "failed to remove result file");
            }
        }
    }

    fn schedule_expiry(&self, id: String, delay: Duration) {
        let (tx, rx) = oneshot::channel();
        self.timers.lock().unwrap().insert(id.clone(), tx);
        let dir = self.dir.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let path = dir.join(&id);
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(id = %id, error = %e, "failed to expire result file");
                        }
                    } else {
                        tracing::debug!(id = %id, "result file expired");
                    }
                }
                _ = rx => {
                    tracing::debug!(id = %id, "result expiry timer cancelled");
                }
            }
        });
    }

    /// Called once at startup. Deletes zero-size (reserved-but-lost) files
    /// and rehydrates non-empty ones into completed jobs, scheduling their
    /// remaining TTL. Filenames that don't match `<prefix>_<type>_<nonce>`
    /// are skipped with a warning rather than treated as a fatal error.
    pub fn recover(&self) -> std::io::Result<Vec<RecoveredJob>> {
        let mut recovered = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let meta = entry.metadata()?;
            if meta.len() == 0 {
                tracing::warn!(filename, "discarding orphaned reserved result file");
                let _ = std::fs::remove_file(&path);
                continue;
            }

            let Some(job_type) = parse_type(filename) else {
                tracing::warn!(filename, "skipping result file with unrecognized name");
                continue;
            };

            let ctime = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::now());
            let age = SystemTime::now().duration_since(ctime).unwrap_or_default();
            if age >= TTL {
                tracing::debug!(filename, "result file already past TTL, removing");
                let _ = std::fs::remove_file(&path);
                continue;
            }

            let raw = std::fs::read_to_string(&path)?;
            let results = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(filename, error = %e, "skipping unparseable result file");
                    continue;
                }
            };

            self.schedule_expiry(filename.to_string(), TTL - age);
            recovered.push(RecoveredJob { id: filename.to_string(), job_type, results });
        }
        Ok(recovered)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn parse_type(filename: &str) -> Option<String> {
    let rest = filename.strip_prefix(PREFIX)?.strip_prefix('_')?;
    let (job_type, _nonce) = rest.split_once('_')?;
    if job_type.is_empty() {
        return None;
    }
    Some(job_type.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_filenames() {
        assert_eq!(parse_type("crab_comment_abc123"), Some("comment".to_string()));
        assert_eq!(parse_type("crab_refinement_deadbeef"), Some("refinement".to_string()));
    }

    #[test]
    fn rejects_malformed_filenames() {
        assert_eq!(parse_type("not_ours_at_all"), None);
        assert_eq!(parse_type("crab_"), None);
        assert_eq!(parse_type("crab__nonce"), None);
    }

    #[tokio::test]
    async fn reserve_creates_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path()).unwrap();
        let (id, path) = store.reserve("comment").unwrap();
        assert!(id.starts_with("crab_comment_"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn finalize_then_recover_rehydrates_completed_job() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path()).unwrap();
        let (id, _) = store.reserve("comment").unwrap();
        store.finalize(&id, &serde_json::json!({"x": 1})).unwrap();

        let recovered = store.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, id);
        assert_eq!(recovered[0].job_type, "comment");
        assert_eq!(recovered[0].results, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn recover_discards_zero_size_reservations() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path()).unwrap();
        let (id, path) = store.reserve("refinement").unwrap();
        assert!(path.exists());

        let recovered = store.recover().unwrap();
        assert!(recovered.is_empty());
        assert!(!store.path_for(&id).exists());
    }

    #[tokio::test]
    async fn recover_skips_unrecognized_filenames_without_crashing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("leftover.tmp"), b"garbage").unwrap();
        let store = ResultStore::new(tmp.path()).unwrap();
        let recovered = store.recover().unwrap();
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path()).unwrap();
        let (id, _) = store.reserve("comment").unwrap();
        store.remove(&id);
        store.remove(&id);
    }
}
