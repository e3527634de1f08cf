//! Torque/PBS driver.

use crate::qstat::parse_status;
use crate::qsub::{parse_job_id, write_submit_script, QsubSettings};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use chrono::Utc;
use runq_core::{Driver, DriverStatus, HandleAllocator, JobHandle, JobSpec, SubmitError};
use runq_parsers::{parse_bool, run_command_allow_failure, run_command_merged};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

pub const QSUB_CMD: &str = "QSUB_CMD";
pub const QSTAT_CMD: &str = "QSTAT_CMD";
pub const QDEL_CMD: &str = "QDEL_CMD";
pub const QUEUE: &str = "QUEUE";
pub const NUM_CPUS_PER_NODE: &str = "NUM_CPUS_PER_NODE";
pub const NUM_NODES: &str = "NUM_NODES";
pub const CLUSTER_LABEL: &str = "CLUSTER_LABEL";
pub const JOB_PREFIX: &str = "JOB_PREFIX";
pub const KEEP_QSUB_OUTPUT: &str = "KEEP_QSUB_OUTPUT";
pub const SUBMIT_SLEEP: &str = "SUBMIT_SLEEP";
pub const DEBUG_OUTPUT: &str = "DEBUG_OUTPUT";

const MAX_ERROR_COUNT: u32 = 100;
const SUBMIT_ERROR_SLEEP: Duration = Duration::from_secs(2);

pub struct TorqueDriver {
    handles: HandleAllocator,
    qsub_cmd: String,
    qstat_cmd: String,
    qdel_cmd: String,
    settings: QsubSettings,
    submit_sleep: Duration,
    debug_file: Option<Utf8PathBuf>,
    /// Handle key to Torque job id
    jobs: Mutex<HashMap<u64, u64>>,
    error_count: AtomicU32,
    max_error_count: u32,
    submit_error_sleep: Duration,
}

impl Default for TorqueDriver {
    fn default() -> Self {
        Self {
            handles: HandleAllocator::new(),
            qsub_cmd: "qsub".to_string(),
            qstat_cmd: "qstat".to_string(),
            qdel_cmd: "qdel".to_string(),
            settings: QsubSettings::default(),
            submit_sleep: Duration::ZERO,
            debug_file: None,
            jobs: Mutex::new(HashMap::new()),
            error_count: AtomicU32::new(0),
            max_error_count: MAX_ERROR_COUNT,
            submit_error_sleep: SUBMIT_ERROR_SLEEP,
        }
    }
}

fn positive(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok().filter(|n| *n > 0)
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl TorqueDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submission failures tolerated before the integration counts as broken.
    pub fn with_max_error_count(mut self, max: u32) -> Self {
        self.max_error_count = max;
        self
    }

    /// Pause after a failed submission.
    pub fn with_submit_error_sleep(mut self, sleep: Duration) -> Self {
        self.submit_error_sleep = sleep;
        self
    }

    /// Count a failed qsub; past the budget every failure is fatal.
    async fn submit_failed(&self, spec: &JobSpec, error: SubmitError) -> SubmitError {
        let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.max_error_count {
            tracing::error!(job = %spec.job_name, count, "too many qsub failures");
            return SubmitError::Fatal(format!("{} qsub submissions failed, last: {}", count, error));
        }

        tracing::error!(job = %spec.job_name, error = %error, "qsub failed, will retry");
        tokio::time::sleep(self.submit_error_sleep).await;
        error
    }

    /// Trace a message, and append it to the debug file when one is set.
    fn debug(&self, message: &str) {
        tracing::debug!("{}", message);
        let Some(path) = &self.debug_file else {
            return;
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{} {}", Utc::now().to_rfc3339(), message));
        if let Err(e) = written {
            tracing::warn!(path = %path, error = %e, "could not write debug output");
        }
    }

    fn job_id(&self, handle: &JobHandle) -> Option<u64> {
        let jobs = self.jobs.lock().ok()?;
        jobs.get(&handle.key()).copied()
    }
}

#[async_trait]
impl Driver for TorqueDriver {
    fn name(&self) -> &'static str {
        "torque"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError> {
        spec.validate()?;
        if u64::from(spec.num_cpu) > self.settings.capacity() {
            return Err(SubmitError::InvalidSpec(format!(
                "job {} requests {} CPUs but {} x {} gives {}",
                spec.job_name,
                spec.num_cpu,
                NUM_NODES,
                NUM_CPUS_PER_NODE,
                self.settings.capacity()
            )));
        }
        if !self.submit_sleep.is_zero() {
            tokio::time::sleep(self.submit_sleep).await;
        }

        self.debug(&format!("Submitting job in: {}", spec.run_path));
        let script = write_submit_script(spec)
            .map_err(|e| SubmitError::Transient(format!("{}: {}", spec.run_path, e)))?;

        let args = self.settings.args(&spec.job_name, &script);
        self.debug(&format!("Submit arguments: {}", args.join(" ")));

        let mut cmd = Command::new(&self.qsub_cmd);
        cmd.args(&args);
        let output = match run_command_merged(&mut cmd, &self.qsub_cmd).await {
            Ok(output) => output,
            Err(e) => {
                let error = SubmitError::Transient(e.to_string());
                return Err(self.submit_failed(spec, error).await);
            }
        };

        let Some(job_id) = parse_job_id(&output) else {
            self.debug(&format!("No job id in qsub output: {}", output.trim()));
            let error = SubmitError::JobIdParse { output };
            return Err(self.submit_failed(spec, error).await);
        };
        self.debug(&format!("Job: {} Id: {}", spec.run_path, job_id));

        let handle = self.handles.allocate(job_id.to_string());
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SubmitError::Fatal("torque job table poisoned".to_string()))?;
        jobs.insert(handle.key(), job_id);
        Ok(handle)
    }

    async fn status(&self, handle: Option<&JobHandle>) -> DriverStatus {
        let Some(handle) = handle else {
            return DriverStatus::NotActive;
        };
        let Some(job_id) = self.job_id(handle) else {
            return DriverStatus::NotActive;
        };

        let job_id = job_id.to_string();
        let mut cmd = Command::new(&self.qstat_cmd);
        cmd.arg(&job_id);
        let output = match run_command_allow_failure(&mut cmd, &self.qstat_cmd).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "qstat failed");
                return DriverStatus::Unknown;
            }
        };

        match parse_status(&output, &job_id) {
            Some(status) => status,
            None => {
                self.debug(&format!("Failed to get status for job {} from qstat", job_id));
                DriverStatus::Unknown
            }
        }
    }

    async fn kill(&self, handle: &JobHandle) {
        let Some(job_id) = self.job_id(handle) else {
            return;
        };
        let mut cmd = Command::new(&self.qdel_cmd);
        cmd.arg(job_id.to_string());
        if let Err(e) = run_command_allow_failure(&mut cmd, &self.qdel_cmd).await {
            tracing::warn!(job_id, error = %e, "qdel failed");
        }
    }

    async fn release(&self, handle: &JobHandle) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&handle.key());
        }
    }

    fn set_option(&mut self, key: &str, value: &str) -> bool {
        match key {
            QSUB_CMD => self.qsub_cmd = value.to_string(),
            QSTAT_CMD => self.qstat_cmd = value.to_string(),
            QDEL_CMD => self.qdel_cmd = value.to_string(),
            QUEUE => self.settings.queue = optional(value),
            CLUSTER_LABEL => self.settings.cluster_label = optional(value),
            JOB_PREFIX => self.settings.job_prefix = optional(value),
            NUM_CPUS_PER_NODE => match positive(value) {
                Some(n) => self.settings.cpus_per_node = n,
                None => return false,
            },
            NUM_NODES => match positive(value) {
                Some(n) => self.settings.num_nodes = n,
                None => return false,
            },
            KEEP_QSUB_OUTPUT => match parse_bool(value) {
                Some(keep) => self.settings.keep_output = keep,
                None => return false,
            },
            SUBMIT_SLEEP => match value.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs >= 0.0 => {
                    self.submit_sleep = Duration::from_secs_f64(secs)
                }
                _ => return false,
            },
            DEBUG_OUTPUT => self.debug_file = optional(value).map(Utf8PathBuf::from),
            _ => return false,
        }
        true
    }

    fn get_option(&self, key: &str) -> Option<String> {
        match key {
            QSUB_CMD => Some(self.qsub_cmd.clone()),
            QSTAT_CMD => Some(self.qstat_cmd.clone()),
            QDEL_CMD => Some(self.qdel_cmd.clone()),
            QUEUE => self.settings.queue.clone(),
            CLUSTER_LABEL => self.settings.cluster_label.clone(),
            JOB_PREFIX => self.settings.job_prefix.clone(),
            NUM_CPUS_PER_NODE => Some(self.settings.cpus_per_node.to_string()),
            NUM_NODES => Some(self.settings.num_nodes.to_string()),
            KEEP_QSUB_OUTPUT => Some(if self.settings.keep_output { "1" } else { "0" }.to_string()),
            SUBMIT_SLEEP => Some(self.submit_sleep.as_secs_f64().to_string()),
            DEBUG_OUTPUT => self.debug_file.as_ref().map(|p| p.to_string()),
            _ => None,
        }
    }

    fn option_keys(&self) -> Vec<&'static str> {
        vec![
            QSUB_CMD,
            QSTAT_CMD,
            QDEL_CMD,
            QUEUE,
            NUM_CPUS_PER_NODE,
            NUM_NODES,
            CLUSTER_LABEL,
            JOB_PREFIX,
            KEEP_QSUB_OUTPUT,
            SUBMIT_SLEEP,
            DEBUG_OUTPUT,
        ]
    }
}
