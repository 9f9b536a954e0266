use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One paraphrased candidate of a reference review comment plus the location
/// it attaches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub body: String,
    pub file: String,
    #[serde(rename = "from")]
    pub from: Option<i64>,
    #[serde(rename = "to")]
    pub to: Option<i64>,
    #[serde(default)]
    pub paraphrases: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArchiveState {
    Base,
    Merged,
}

/// One row of the reference dataset: a pull request with its merge metadata
/// and the review comments scored against submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub id: String,
    pub repo: String,
    pub pr_number: i64,
    pub merge_commit_sha: String,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub reason_for_failure: Option<String>,
}

impl ReferenceEntry {
    /// Name of the archive for this PR at a given snapshot state, e.g.
    /// `owner_name_42_merged.tar.gz`.
    pub fn archive_name(&self, state: ArchiveState) -> String {
        let repo_slug = self.repo.replace('/', "_");
        let state_str = match state {
            ArchiveState::Base => "base",
            ArchiveState::Merged => "merged",
        };
        format!("{}_{}_{}.tar.gz", repo_slug, self.pr_number, state_str)
    }
}

/// Process-wide immutable `id -> ReferenceEntry` map, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct ReferenceMap {
    entries: HashMap<String, ReferenceEntry>,
}

const STILL_PROCESSING_REASON: &str = "Was still being processed";

impl ReferenceMap {
    pub fn lookup(&self, id: &str) -> Option<&ReferenceEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads the dataset from a JSON document at `path`. Rows whose metadata
    /// marks them as still being processed are dropped unless
    /// `keep_still_in_progress` is set.
    pub fn load(path: &Path, keep_still_in_progress: bool) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw, keep_still_in_progress)
    }

    pub fn from_json_str(raw: &str, keep_still_in_progress: bool) -> std::io::Result<Self> {
        let rows: Vec<ReferenceEntry> = serde_json::from_str(raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::from_rows(rows, keep_still_in_progress))
    }

    pub fn from_rows(rows: Vec<ReferenceEntry>, keep_still_in_progress: bool) -> Self {
        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            let still_in_progress = row.reason_for_failure.as_deref() == Some(STILL_PROCESSING_REASON);
            if still_in_progress && !keep_still_in_progress {
                tracing::debug!(id = %row.id, "skipping row still being processed");
                continue;
            }
            entries.insert(row.id.clone(), row);
        }
        ReferenceMap { entries }
    }
}
