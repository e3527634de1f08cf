//! Local process driver for runq.
//!
//! Runs each job as a child process of the coordinating process. It is the
//! reference backend for the driver contract.

use async_trait::async_trait;
use runq_core::{Driver, DriverStatus, HandleAllocator, JobHandle, JobSpec, SubmitError};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::{Child, Command};

struct LocalJob {
    child: Child,
    /// Set once the child has been reaped
    finished: Option<DriverStatus>,
}

/// Spawns jobs directly on this host.
#[derive(Default)]
pub struct LocalDriver {
    handles: HandleAllocator,
    jobs: Mutex<HashMap<u64, LocalJob>>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs the driver still holds state for.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError> {
        spec.validate()?;

        tokio::fs::create_dir_all(&spec.run_path)
            .await
            .map_err(|e| SubmitError::Transient(format!("{}: {}", spec.run_path, e)))?;

        let child = Command::new(&spec.executable)
            .args(&spec.args)
            .current_dir(&spec.run_path)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    SubmitError::InvalidSpec(format!("{}: {}", spec.executable, e))
                }
                _ => SubmitError::Transient(format!("{}: {}", spec.executable, e)),
            })?;

        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        let handle = self.handles.allocate(pid);
        tracing::debug!(job = %spec.job_name, handle = %handle, "started local job");

        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SubmitError::Fatal("local job table poisoned".to_string()))?;
        jobs.insert(
            handle.key(),
            LocalJob {
                child,
                finished: None,
            },
        );
        Ok(handle)
    }

    async fn status(&self, handle: Option<&JobHandle>) -> DriverStatus {
        let Some(handle) = handle else {
            return DriverStatus::NotActive;
        };
        let Ok(mut jobs) = self.jobs.lock() else {
            return DriverStatus::Unknown;
        };
        let Some(job) = jobs.get_mut(&handle.key()) else {
            return DriverStatus::NotActive;
        };
        if let Some(status) = job.finished {
            return status;
        }

        match job.child.try_wait() {
            Ok(None) => DriverStatus::Running,
            Ok(Some(exit)) => {
                let status = if exit.success() {
                    DriverStatus::Done
                } else {
                    DriverStatus::Exited
                };
                job.finished = Some(status);
                status
            }
            Err(e) => {
                tracing::warn!(handle = %handle, error = %e, "failed to poll local job");
                DriverStatus::Unknown
            }
        }
    }

    async fn kill(&self, handle: &JobHandle) {
        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(job) = jobs.get_mut(&handle.key()) {
                if job.finished.is_none() {
                    if let Err(e) = job.child.start_kill() {
                        tracing::debug!(handle = %handle, error = %e, "kill failed");
                    }
                }
            }
        }
    }

    async fn release(&self, handle: &JobHandle) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&handle.key());
        }
    }

    fn set_option(&mut self, _key: &str, _value: &str) -> bool {
        false
    }

    fn get_option(&self, _key: &str) -> Option<String> {
        None
    }

    fn option_keys(&self) -> Vec<&'static str> {
        Vec::new()
    }
}
