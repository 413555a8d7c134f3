use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;

/// The combined record handed to the peer after a run:
/// `target_entries,value_size,chaos_duration_ms,settle_seconds,<baseline
/// csv>,<post-chaos csv>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResultRecord {
    pub target_entries: u64,
    pub value_size_bytes: u64,
    pub chaos_duration_ms: u64,
    pub settle_seconds: u64,
    pub baseline_csv: String,
    pub post_chaos_csv: String,
}

impl TestResultRecord {
    #[must_use]
    pub fn to_csv(&self) -> String {
        [
            self.target_entries.to_string(),
            self.value_size_bytes.to_string(),
            self.chaos_duration_ms.to_string(),
            self.settle_seconds.to_string(),
            self.baseline_csv.clone(),
            self.post_chaos_csv.clone(),
        ]
        .join(",")
    }
}

/// Per-probe snapshot captured at a phase boundary, for the artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeReport {
    pub name: String,
    pub snapshot: StatsSnapshot,
}

/// Everything worth keeping from one completed run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunArtifact {
    pub result: TestResultRecord,
    pub baseline: Vec<ProbeReport>,
    pub post_chaos: Vec<ProbeReport>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to create artifact parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize run artifact: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write run artifact at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Writes a pretty-printed run artifact JSON file to disk.
///
/// # Errors
///
/// Returns [`ReportError`] if parent directory creation, serialization, or
/// file writing fails.
pub fn write_run_artifact(path: &Path, artifact: &RunArtifact) -> Result<(), ReportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ReportError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let payload = serde_json::to_string_pretty(artifact)?;
    fs::write(path, payload).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })
}
