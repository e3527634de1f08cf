//! Job-identity record written next to a submitted job.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Who runs a job, for inspection by tools outside this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Scheduler job id
    pub job_id: String,

    /// Name given at submission
    pub job_name: String,

    /// Backend that accepted the job
    pub driver: String,

    pub submitted_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, job_name: impl Into<String>, driver: &str) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            driver: driver.to_string(),
            submitted_at: Utc::now(),
        }
    }

    /// Write the record as `<run_path>/<file_name>`, returning the path.
    pub fn write(&self, run_path: &Utf8Path, file_name: &str) -> Result<Utf8PathBuf, RecordError> {
        fs::create_dir_all(run_path)?;
        let path = run_path.join(file_name);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn load(path: &Utf8Path) -> Result<Self, RecordError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
