//! The contract every scheduler backend implements.

use crate::spec::JobSpec;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Job status as reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    /// No handle, or the driver knows nothing about the job
    NotActive,
    /// Accepted by the scheduler, waiting for resources
    Pending,
    /// Executing
    Running,
    /// Finished normally
    Done,
    /// Finished abnormally
    Exited,
    /// Could not be determined this cycle
    Unknown,
}

impl DriverStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Exited)
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotActive => write!(f, "not-active"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Exited => write!(f, "exited"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Reasons a submission did not produce a handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Invalid job specification: {0}")]
    InvalidSpec(String),
    #[error("No host has free capacity")]
    NoCapacity,
    #[error("Submission failed, will retry: {0}")]
    Transient(String),
    #[error("Could not parse a job id from submission output: {output:?}")]
    JobIdParse { output: String },
    #[error("Scheduler integration is broken: {0}")]
    Fatal(String),
}

impl SubmitError {
    /// Whether the queue should leave the job waiting and try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoCapacity | Self::Transient(_) | Self::JobIdParse { .. }
        )
    }
}

/// Opaque reference to one submitted job.
///
/// `key` is unique within the driver instance that created the handle and
/// indexes any driver-side per-job state; `native_id` is what the backend
/// calls the job (scheduler id, host name, pid).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    key: u64,
    native_id: String,
}

impl JobHandle {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn native_id(&self) -> &str {
        &self.native_id
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.native_id, self.key)
    }
}

/// Per-driver source of handle keys.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, native_id: impl Into<String>) -> JobHandle {
        JobHandle {
            key: self.next.fetch_add(1, Ordering::Relaxed),
            native_id: native_id.into(),
        }
    }
}

/// Uniform interface over the scheduler backends.
///
/// Options are set while the driver is exclusively owned; once it is shared
/// behind an `Arc` only the job operations are used.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend name used in logs and job records.
    fn name(&self) -> &'static str;

    /// Launch a job. On error nothing is left allocated.
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError>;

    /// Observe a job. `None` means the job was never submitted.
    async fn status(&self, handle: Option<&JobHandle>) -> DriverStatus;

    /// Ask the backend to stop the job. Best effort.
    async fn kill(&self, handle: &JobHandle);

    /// Drop driver-side state for the job. Calling it twice is harmless.
    async fn release(&self, handle: &JobHandle);

    /// Called when the job exited without ever running, so the driver can
    /// steer future jobs away from the nodes involved.
    async fn blacklist_node(&self, _handle: &JobHandle) {}

    /// Set a backend option; `false` for unknown keys or bad values.
    fn set_option(&mut self, key: &str, value: &str) -> bool;

    fn get_option(&self, key: &str) -> Option<String>;

    /// Every key `set_option` understands.
    fn option_keys(&self) -> Vec<&'static str>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_keys_are_unique() {
        let alloc = HandleAllocator::new();
        let a = alloc.allocate("101");
        let b = alloc.allocate("101");
        assert_ne!(a, b);
        assert_eq!(a.native_id(), b.native_id());
        assert_eq!(a.to_string(), "101#0");
    }

    #[test]
    fn test_retryable() {
        assert!(SubmitError::NoCapacity.is_retryable());
        assert!(SubmitError::Transient("bsub timed out".into()).is_retryable());
        assert!(SubmitError::JobIdParse { output: String::new() }.is_retryable());
        assert!(!SubmitError::Fatal("too many errors".into()).is_retryable());
        assert!(!SubmitError::InvalidSpec("no executable".into()).is_retryable());
    }
}
