//! Per-job state machine.

use chrono::{DateTime, TimeDelta, Utc};
use runq_core::{Driver, DriverStatus, JobHandle, JobSpec, SubmitError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Where a job is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Not submitted yet, or waiting for a retry
    Waiting,
    /// Accepted by the driver, no status seen yet
    Submitted,
    /// Queued in the scheduler
    Pending,
    Running,
    /// Finished successfully
    Done,
    /// Finished abnormally; resolved to Waiting or Failed right away
    Exited,
    /// Out of attempts
    Failed,
    Killed,
}

impl JobState {
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Waiting, Submitted | Killed | Failed)
                | (Submitted, Pending | Running | Done | Exited | Killed)
                | (Pending, Running | Done | Exited | Killed)
                | (Running, Pending | Done | Exited | Killed)
                | (Exited, Waiting | Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Killed)
    }

    /// Holds a driver handle and counts against the running cap.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Submitted | Self::Pending | Self::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "waiting",
            Self::Submitted => "submitted",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Exited => "exited",
            Self::Failed => "failed",
            Self::Killed => "killed",
        };
        f.write_str(name)
    }
}

pub type JobCallback = Arc<dyn Fn(&JobNode) + Send + Sync>;

/// Hooks fired on job outcomes.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_success: Option<JobCallback>,
    pub on_retry: Option<JobCallback>,
    pub on_failure: Option<JobCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// One job in the queue.
#[derive(Debug)]
pub struct JobNode {
    index: usize,
    spec: Arc<JobSpec>,
    state: JobState,
    attempts: u32,
    handle: Option<JobHandle>,
    /// Seen running during the current attempt
    has_run: bool,
    submitted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
    callbacks: Callbacks,
}

impl JobNode {
    pub fn new(index: usize, spec: JobSpec, callbacks: Callbacks) -> Self {
        Self {
            index,
            spec: Arc::new(spec),
            state: JobState::Waiting,
            attempts: 0,
            handle: None,
            has_run: false,
            submitted_at: None,
            started_at: None,
            ended_at: None,
            error: None,
            callbacks,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &Arc<JobSpec> {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Submissions accepted by the driver so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Content of the exit marker file from the last failed attempt.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn transition(&mut self, to: JobState) {
        if !self.state.can_transition_to(to) {
            panic!(
                "illegal state transition {} -> {} for job {}",
                self.state, to, self.spec.job_name
            );
        }
        tracing::debug!(job = %self.spec.job_name, from = %self.state, to = %to, "state change");
        self.state = to;
    }

    fn fire(&self, callback: &Option<JobCallback>) {
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Record a handle returned by the driver.
    pub fn submitted(&mut self, handle: JobHandle) {
        self.transition(JobState::Submitted);
        self.attempts += 1;
        self.has_run = false;
        self.submitted_at = Some(Utc::now());
        self.started_at = None;
        self.ended_at = None;
        tracing::info!(
            job = %self.spec.job_name,
            handle = %handle,
            attempt = self.attempts,
            "job submitted"
        );
        self.handle = Some(handle);
    }

    /// Record a submission that produced no handle.
    ///
    /// A spec the driver can never run fails the job; anything else leaves
    /// it waiting for the next cycle.
    pub fn submit_failed(&mut self, error: &SubmitError) {
        match error {
            SubmitError::InvalidSpec(reason) => {
                tracing::error!(job = %self.spec.job_name, reason = %reason, "job cannot be submitted");
                self.error = Some(reason.clone());
                self.ended_at = Some(Utc::now());
                self.transition(JobState::Failed);
                self.fire(&self.callbacks.on_failure);
            }
            other => {
                tracing::debug!(job = %self.spec.job_name, error = %other, "submission deferred");
            }
        }
    }

    /// Apply one observed driver status.
    pub async fn update(&mut self, status: DriverStatus, driver: &dyn Driver, max_submit: u32) {
        if !self.state.is_active() {
            return;
        }

        match status {
            DriverStatus::NotActive | DriverStatus::Unknown => {}
            DriverStatus::Pending => {
                if self.state != JobState::Pending {
                    self.transition(JobState::Pending);
                }
            }
            DriverStatus::Running => {
                if self.state != JobState::Running {
                    self.transition(JobState::Running);
                    self.has_run = true;
                    self.started_at = Some(Utc::now());
                }
            }
            DriverStatus::Done if self.ok_marker_missing() => {
                tracing::warn!(job = %self.spec.job_name, "job finished without its OK file");
                self.exited(driver, max_submit).await;
            }
            DriverStatus::Done => {
                self.transition(JobState::Done);
                self.ended_at = Some(Utc::now());
                self.release(driver).await;
                tracing::info!(job = %self.spec.job_name, "job done");
                self.fire(&self.callbacks.on_success);
            }
            DriverStatus::Exited => self.exited(driver, max_submit).await,
        }
    }

    async fn exited(&mut self, driver: &dyn Driver, max_submit: u32) {
        self.transition(JobState::Exited);
        self.ended_at = Some(Utc::now());
        self.error = self.read_exit_file().or_else(|| {
            self.spec
                .ok_path()
                .filter(|path| !path.exists())
                .map(|path| format!("{} was not written", path))
        });

        if !self.has_run && !self.status_marker_written() {
            if let Some(handle) = &self.handle {
                driver.blacklist_node(handle).await;
            }
        }
        self.release(driver).await;

        if self.attempts < max_submit {
            tracing::warn!(
                job = %self.spec.job_name,
                attempt = self.attempts,
                max_submit,
                error = ?self.error,
                "job exited, resubmitting"
            );
            self.transition(JobState::Waiting);
            self.fire(&self.callbacks.on_retry);
        } else {
            tracing::error!(
                job = %self.spec.job_name,
                attempts = self.attempts,
                error = ?self.error,
                "job failed"
            );
            self.transition(JobState::Failed);
            self.fire(&self.callbacks.on_failure);
        }
    }

    /// The job was asked to write an OK file and did not.
    fn ok_marker_missing(&self) -> bool {
        self.spec.ok_path().is_some_and(|path| !path.exists())
    }

    /// The job wrote its status file during the current attempt, so it did
    /// start even if no poll caught it running.
    fn status_marker_written(&self) -> bool {
        let (Some(path), Some(submitted_at)) = (self.spec.status_path(), self.submitted_at) else {
            return false;
        };
        let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
            return false;
        };
        // File timestamps can be coarser than the clock
        DateTime::<Utc>::from(modified) >= submitted_at - TimeDelta::seconds(1)
    }

    fn read_exit_file(&self) -> Option<String> {
        let path = self.spec.exit_path()?;
        let content = std::fs::read_to_string(&path).ok()?;
        let content = content.trim();
        (!content.is_empty()).then(|| content.to_string())
    }

    async fn release(&mut self, driver: &dyn Driver) {
        if let Some(handle) = self.handle.take() {
            driver.release(&handle).await;
        }
    }

    /// Kill a submitted job. Returns `false` when the job has no handle.
    pub async fn kill(&mut self, driver: &dyn Driver) -> bool {
        let Some(handle) = &self.handle else {
            return false;
        };
        driver.kill(handle).await;
        self.release(driver).await;
        self.ended_at = Some(Utc::now());
        self.transition(JobState::Killed);
        tracing::info!(job = %self.spec.job_name, "job killed");
        true
    }

    /// Withdraw a job that was never submitted.
    pub fn cancel(&mut self) -> bool {
        if self.state != JobState::Waiting {
            return false;
        }
        self.transition(JobState::Killed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use camino::Utf8Path;
    use runq_core::HandleAllocator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingDriver {
        handles: HandleAllocator,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingDriver {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str, handle: &JobHandle) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", call, handle.native_id()));
        }
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError> {
            Ok(self.handles.allocate(spec.job_name.clone()))
        }

        async fn status(&self, _handle: Option<&JobHandle>) -> DriverStatus {
            DriverStatus::Unknown
        }

        async fn kill(&self, handle: &JobHandle) {
            self.record("kill", handle);
        }

        async fn release(&self, handle: &JobHandle) {
            self.record("release", handle);
        }

        async fn blacklist_node(&self, handle: &JobHandle) {
            self.record("blacklist", handle);
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

    fn counter() -> (Arc<AtomicUsize>, JobCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = {
            let count = Arc::clone(&count);
            Arc::new(move |_: &JobNode| {
                count.fetch_add(1, Ordering::SeqCst);
            }) as JobCallback
        };
        (count, hook)
    }

    async fn submitted_node(driver: &RecordingDriver, callbacks: Callbacks) -> JobNode {
        let mut node = JobNode::new(0, JobSpec::new("forward", "/tmp/run-0", "real-0"), callbacks);
        let handle = driver.submit(node.spec()).await.unwrap();
        node.submitted(handle);
        node
    }

    #[test]
    fn test_transition_table() {
        use JobState::*;
        assert!(Waiting.can_transition_to(Submitted));
        assert!(Running.can_transition_to(Pending));
        assert!(Exited.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(Running));
        assert!(!Exited.can_transition_to(Done));
        for terminal in [Done, Failed, Killed] {
            assert!(terminal.is_terminal());
            for to in [Waiting, Submitted, Pending, Running, Done, Exited, Failed, Killed] {
                assert!(!terminal.can_transition_to(to), "{} -> {}", terminal, to);
            }
        }
    }

    #[test]
    #[should_panic(expected = "illegal state transition")]
    fn test_illegal_transition_panics() {
        let mut node = JobNode::new(0, JobSpec::new("forward", "/tmp", "real-0"), Callbacks::default());
        node.transition(JobState::Running);
    }

    #[tokio::test]
    async fn test_done_fires_success_once() {
        let driver = RecordingDriver::default();
        let (successes, hook) = counter();
        let callbacks = Callbacks {
            on_success: Some(hook),
            ..Default::default()
        };
        let mut node = submitted_node(&driver, callbacks).await;

        node.update(DriverStatus::Pending, &driver, 2).await;
        node.update(DriverStatus::Running, &driver, 2).await;
        node.update(DriverStatus::Done, &driver, 2).await;
        node.update(DriverStatus::Done, &driver, 2).await;

        assert_eq!(node.state(), JobState::Done);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert!(node.handle().is_none());
        assert!(node.started_at().is_some());
        assert_eq!(driver.calls(), vec!["release real-0"]);
    }

    #[tokio::test]
    async fn test_unknown_status_changes_nothing() {
        let driver = RecordingDriver::default();
        let mut node = submitted_node(&driver, Callbacks::default()).await;
        node.update(DriverStatus::Unknown, &driver, 2).await;
        node.update(DriverStatus::NotActive, &driver, 2).await;
        assert_eq!(node.state(), JobState::Submitted);
    }

    #[tokio::test]
    async fn test_exit_without_running_blacklists_then_retries() {
        let driver = RecordingDriver::default();
        let (retries, hook) = counter();
        let callbacks = Callbacks {
            on_retry: Some(hook),
            ..Default::default()
        };
        let mut node = submitted_node(&driver, callbacks).await;

        node.update(DriverStatus::Pending, &driver, 2).await;
        node.update(DriverStatus::Exited, &driver, 2).await;

        assert_eq!(node.state(), JobState::Waiting);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert_eq!(driver.calls(), vec!["blacklist real-0", "release real-0"]);
    }

    #[tokio::test]
    async fn test_exit_after_running_fails_with_error_text() {
        let temp = TempDir::new().unwrap();
        let run_path = Utf8Path::from_path(temp.path()).unwrap();
        std::fs::write(run_path.join("ERROR"), "forward model crashed\n").unwrap();

        let driver = RecordingDriver::default();
        let (failures, hook) = counter();
        let callbacks = Callbacks {
            on_failure: Some(hook),
            ..Default::default()
        };
        let spec = JobSpec::new("forward", run_path, "real-0").with_marker_files("OK", "STATUS", "ERROR");
        let mut node = JobNode::new(0, spec, callbacks);
        let handle = driver.submit(node.spec()).await.unwrap();
        node.submitted(handle);

        node.update(DriverStatus::Running, &driver, 1).await;
        node.update(DriverStatus::Exited, &driver, 1).await;

        assert_eq!(node.state(), JobState::Failed);
        assert_eq!(node.error(), Some("forward model crashed"));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(driver.calls(), vec!["release real-0"]);
    }

    fn marker_node(run_path: &Utf8Path, callbacks: Callbacks) -> JobNode {
        let spec = JobSpec::new("forward", run_path, "real-0").with_marker_files("OK", "STATUS", "ERROR");
        JobNode::new(0, spec, callbacks)
    }

    #[tokio::test]
    async fn test_done_requires_ok_file() {
        let temp = TempDir::new().unwrap();
        let run_path = Utf8Path::from_path(temp.path()).unwrap();
        let driver = RecordingDriver::default();
        let (successes, on_success) = counter();
        let (retries, on_retry) = counter();
        let callbacks = Callbacks {
            on_success: Some(on_success),
            on_retry: Some(on_retry),
            ..Default::default()
        };
        let mut node = marker_node(run_path, callbacks);

        let handle = driver.submit(node.spec()).await.unwrap();
        node.submitted(handle);
        node.update(DriverStatus::Running, &driver, 2).await;
        node.update(DriverStatus::Done, &driver, 2).await;
        assert_eq!(node.state(), JobState::Waiting);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert!(node.error().unwrap().contains("OK was not written"));

        std::fs::write(run_path.join("OK"), "").unwrap();
        let handle = driver.submit(node.spec()).await.unwrap();
        node.submitted(handle);
        node.update(DriverStatus::Done, &driver, 2).await;
        assert_eq!(node.state(), JobState::Done);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_file_means_job_started() {
        let temp = TempDir::new().unwrap();
        let run_path = Utf8Path::from_path(temp.path()).unwrap();
        let driver = RecordingDriver::default();
        let mut node = marker_node(run_path, Callbacks::default());

        let handle = driver.submit(node.spec()).await.unwrap();
        node.submitted(handle);
        std::fs::write(run_path.join("STATUS"), "forward model step 1\n").unwrap();
        node.update(DriverStatus::Exited, &driver, 2).await;

        assert_eq!(node.state(), JobState::Waiting);
        assert_eq!(driver.calls(), vec!["release real-0"]);
    }

    #[tokio::test]
    async fn test_invalid_spec_fails_job() {
        let (failures, hook) = counter();
        let callbacks = Callbacks {
            on_failure: Some(hook),
            ..Default::default()
        };
        let mut node = JobNode::new(0, JobSpec::new("", "/tmp", "real-0"), callbacks);

        node.submit_failed(&SubmitError::NoCapacity);
        assert_eq!(node.state(), JobState::Waiting);

        node.submit_failed(&SubmitError::InvalidSpec("no executable".to_string()));
        assert_eq!(node.state(), JobState::Failed);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kill() {
        let driver = RecordingDriver::default();
        let mut waiting = JobNode::new(1, JobSpec::new("forward", "/tmp", "real-1"), Callbacks::default());
        assert!(!waiting.kill(&driver).await);
        assert_eq!(waiting.state(), JobState::Waiting);
        assert!(driver.calls().is_empty());

        let mut node = submitted_node(&driver, Callbacks::default()).await;
        node.update(DriverStatus::Running, &driver, 2).await;
        assert!(node.kill(&driver).await);
        assert_eq!(node.state(), JobState::Killed);
        assert_eq!(driver.calls(), vec!["kill real-0", "release real-0"]);
    }
}
