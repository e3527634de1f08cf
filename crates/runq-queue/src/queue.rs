//! Admission and polling loop.

use crate::node::{Callbacks, JobNode, JobState};
use runq_core::{Driver, DriverStatus, JobHandle, JobSpec, QueueDriver, SubmitError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Submissions in flight at once within one cycle.
const SUBMIT_CONCURRENCY: usize = 8;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Driver failed permanently: {0}")]
    Fatal(SubmitError),
    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Configuration for the queue loop.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Submissions per job before it counts as failed
    pub max_submit: u32,
    /// Cap on active jobs; 0 takes the driver's MAX_RUNNING, where 0 is unlimited
    pub max_running: usize,
    /// Pause between cycles
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_submit: 2,
            max_running: 0,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub total: usize,
    pub waiting: usize,
    pub submitted: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub killed: usize,
}

/// Owns the job nodes and drives them through one driver.
pub struct JobQueue {
    driver: Arc<QueueDriver>,
    nodes: Vec<JobNode>,
    config: QueueConfig,
    callbacks: Callbacks,
}

impl JobQueue {
    pub fn new(driver: QueueDriver, config: QueueConfig) -> Self {
        Self {
            driver: Arc::new(driver),
            nodes: Vec::new(),
            config,
            callbacks: Callbacks::default(),
        }
    }

    /// Callbacks attached to every job added afterwards.
    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn add_job(&mut self, spec: JobSpec) -> usize {
        let index = self.nodes.len();
        self.nodes
            .push(JobNode::new(index, spec, self.callbacks.clone()));
        index
    }

    pub fn driver(&self) -> &Arc<QueueDriver> {
        &self.driver
    }

    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&JobNode> {
        self.nodes.get(index)
    }

    pub fn max_running(&self) -> usize {
        if self.config.max_running > 0 {
            self.config.max_running
        } else {
            self.driver.max_running()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.nodes.iter().all(|node| node.state().is_terminal())
    }

    pub fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary {
            total: self.nodes.len(),
            ..Default::default()
        };
        for node in &self.nodes {
            match node.state() {
                JobState::Waiting | JobState::Exited => summary.waiting += 1,
                JobState::Submitted => summary.submitted += 1,
                JobState::Pending => summary.pending += 1,
                JobState::Running => summary.running += 1,
                JobState::Done => summary.done += 1,
                JobState::Failed => summary.failed += 1,
                JobState::Killed => summary.killed += 1,
            }
        }
        summary
    }

    /// Query every active job concurrently and apply the results.
    pub async fn poll(&mut self) -> Result<(), QueueError> {
        let mut polls: JoinSet<(usize, DriverStatus)> = JoinSet::new();
        for node in self.nodes.iter().filter(|n| n.state().is_active()) {
            let Some(handle) = node.handle().cloned() else {
                continue;
            };
            let driver = Arc::clone(&self.driver);
            let index = node.index();
            polls.spawn(async move { (index, driver.status(Some(&handle)).await) });
        }

        let mut statuses = Vec::with_capacity(polls.len());
        while let Some(result) = polls.join_next().await {
            statuses.push(result?);
        }
        statuses.sort_by_key(|(index, _)| *index);

        for (index, status) in statuses {
            self.nodes[index]
                .update(status, self.driver.as_ref(), self.config.max_submit)
                .await;
        }
        Ok(())
    }

    /// Submit waiting jobs up to the running cap.
    ///
    /// A retryable error leaves its job waiting and stops new submissions for
    /// this cycle. Returns the number of jobs submitted.
    pub async fn submit_waiting(&mut self) -> Result<usize, QueueError> {
        let active = self.nodes.iter().filter(|n| n.state().is_active()).count();
        let slots = match self.max_running() {
            0 => usize::MAX,
            max => max.saturating_sub(active),
        };
        let waiting: Vec<usize> = self
            .nodes
            .iter()
            .filter(|n| n.state() == JobState::Waiting)
            .map(JobNode::index)
            .take(slots)
            .collect();
        if waiting.is_empty() {
            return Ok(0);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let permits = Arc::new(Semaphore::new(SUBMIT_CONCURRENCY));
        let mut submits: JoinSet<(usize, Option<Result<JobHandle, SubmitError>>)> = JoinSet::new();
        for index in waiting {
            let driver = Arc::clone(&self.driver);
            let spec = Arc::clone(self.nodes[index].spec());
            let stop = Arc::clone(&stop);
            let permits = Arc::clone(&permits);
            submits.spawn(async move {
                let Ok(_permit) = permits.acquire().await else {
                    return (index, None);
                };
                if stop.load(Ordering::SeqCst) {
                    return (index, None);
                }
                let result = driver.submit(&spec).await;
                if matches!(&result, Err(e) if e.is_retryable() || matches!(e, SubmitError::Fatal(_))) {
                    stop.store(true, Ordering::SeqCst);
                }
                (index, Some(result))
            });
        }

        let mut submitted = 0;
        let mut fatal = None;
        while let Some(joined) = submits.join_next().await {
            let (index, result) = joined?;
            match result {
                None => {}
                Some(Ok(handle)) => {
                    self.nodes[index].submitted(handle);
                    submitted += 1;
                }
                Some(Err(SubmitError::Fatal(reason))) => {
                    tracing::error!(job = %self.nodes[index].spec().job_name, reason = %reason, "driver failed");
                    fatal = Some(SubmitError::Fatal(reason));
                }
                Some(Err(e)) => self.nodes[index].submit_failed(&e),
            }
        }

        match fatal {
            Some(e) => Err(QueueError::Fatal(e)),
            None => Ok(submitted),
        }
    }

    /// One poll pass followed by one submission pass.
    pub async fn run_cycle(&mut self) -> Result<(), QueueError> {
        self.poll().await?;
        let submitted = self.submit_waiting().await?;
        if submitted > 0 {
            tracing::debug!(submitted, "submission pass");
        }
        Ok(())
    }

    /// Run cycles until every job is done, failed or killed.
    pub async fn run(&mut self) -> Result<QueueSummary, QueueError> {
        tracing::info!(
            jobs = self.nodes.len(),
            driver = self.driver.name(),
            max_running = self.max_running(),
            max_submit = self.config.max_submit,
            "starting queue"
        );
        let mut last = self.summary();

        while !self.is_finished() {
            self.run_cycle().await?;

            let summary = self.summary();
            if summary != last {
                tracing::info!(
                    waiting = summary.waiting,
                    pending = summary.pending + summary.submitted,
                    running = summary.running,
                    done = summary.done,
                    failed = summary.failed,
                    "queue progress"
                );
                last = summary;
            }
            if self.is_finished() {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        Ok(self.summary())
    }

    /// Kill one job. Returns `false` for unknown indices or unsubmitted jobs.
    pub async fn kill_job(&mut self, index: usize) -> bool {
        let Some(node) = self.nodes.get_mut(index) else {
            return false;
        };
        node.kill(self.driver.as_ref()).await
    }

    /// Kill every active job and withdraw every waiting one.
    pub async fn kill_all(&mut self) {
        for node in &mut self.nodes {
            if node.state().is_active() {
                node.kill(self.driver.as_ref()).await;
            } else {
                node.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use camino::Utf8Path;
    use runq_core::{HandleAllocator, MAX_RUNNING};
    use runq_local::LocalDriver;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Driver whose jobs end the way `outcome(job_name, attempt)` says.
    struct ScriptedDriver {
        handles: HandleAllocator,
        outcome: fn(&str, u32) -> DriverStatus,
        submit_error: Mutex<Option<SubmitError>>,
        attempts: Mutex<HashMap<String, u32>>,
        jobs: Mutex<HashMap<u64, (String, u32)>>,
        blacklisted: Arc<AtomicUsize>,
    }

    impl ScriptedDriver {
        fn new(outcome: fn(&str, u32) -> DriverStatus) -> Self {
            Self {
                handles: HandleAllocator::new(),
                outcome,
                submit_error: Mutex::new(None),
                attempts: Mutex::new(HashMap::new()),
                jobs: Mutex::new(HashMap::new()),
                blacklisted: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing_with(error: SubmitError) -> Self {
            let driver = Self::new(|_, _| DriverStatus::Running);
            *driver.submit_error.lock().unwrap() = Some(error);
            driver
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError> {
            if let Some(error) = self.submit_error.lock().unwrap().clone() {
                return Err(error);
            }
            let mut attempts = self.attempts.lock().unwrap();
            let attempt = attempts.entry(spec.job_name.clone()).or_insert(0);
            *attempt += 1;
            let handle = self.handles.allocate(format!("{}:{}", spec.job_name, attempt));
            self.jobs
                .lock()
                .unwrap()
                .insert(handle.key(), (spec.job_name.clone(), *attempt));
            Ok(handle)
        }

        async fn status(&self, handle: Option<&JobHandle>) -> DriverStatus {
            let Some(handle) = handle else {
                return DriverStatus::NotActive;
            };
            match self.jobs.lock().unwrap().get(&handle.key()) {
                Some((name, attempt)) => (self.outcome)(name, *attempt),
                None => DriverStatus::NotActive,
            }
        }

        async fn kill(&self, _handle: &JobHandle) {}

        async fn release(&self, handle: &JobHandle) {
            self.jobs.lock().unwrap().remove(&handle.key());
        }

        async fn blacklist_node(&self, _handle: &JobHandle) {
            self.blacklisted.fetch_add(1, Ordering::SeqCst);
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

    fn fast_config(max_submit: u32) -> QueueConfig {
        QueueConfig {
            max_submit,
            max_running: 0,
            poll_interval: Duration::from_millis(5),
        }
    }

    fn spec(name: &str) -> JobSpec {
        JobSpec::new("forward-model", "/tmp/runq-test", name)
    }

    fn counting_hook(count: &Arc<AtomicUsize>) -> crate::node::JobCallback {
        let count = Arc::clone(count);
        Arc::new(move |_: &JobNode| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let retries = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let callbacks = Callbacks {
            on_retry: Some(counting_hook(&retries)),
            on_failure: Some(counting_hook(&failures)),
            ..Default::default()
        };

        let driver = QueueDriver::new(ScriptedDriver::new(|_, _| DriverStatus::Exited));
        let mut queue = JobQueue::new(driver, fast_config(3)).with_callbacks(callbacks);
        queue.add_job(spec("real-0"));

        let summary = queue.run().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(queue.nodes()[0].attempts(), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let successes = Arc::new(AtomicUsize::new(0));
        let callbacks = Callbacks {
            on_success: Some(counting_hook(&successes)),
            ..Default::default()
        };

        // real-1 fails its first attempt, everything else succeeds
        let driver = QueueDriver::new(ScriptedDriver::new(|name, attempt| {
            if name == "real-1" && attempt == 1 {
                DriverStatus::Exited
            } else {
                DriverStatus::Done
            }
        }));
        let mut queue = JobQueue::new(driver, fast_config(2)).with_callbacks(callbacks);
        for i in 0..4 {
            queue.add_job(spec(&format!("real-{}", i)));
        }

        let summary = queue.run().await.unwrap();
        assert_eq!(summary.done, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(successes.load(Ordering::SeqCst), 4);
        assert_eq!(queue.nodes()[1].attempts(), 2);
    }

    #[tokio::test]
    async fn test_max_running_cap() {
        let mut driver = QueueDriver::new(ScriptedDriver::new(|_, _| DriverStatus::Running));
        assert!(driver.set_option(MAX_RUNNING, "2"));
        let mut queue = JobQueue::new(driver, fast_config(2));
        for i in 0..5 {
            queue.add_job(spec(&format!("real-{}", i)));
        }
        assert_eq!(queue.max_running(), 2);

        queue.run_cycle().await.unwrap();
        queue.run_cycle().await.unwrap();
        let summary = queue.summary();
        assert_eq!(summary.running, 2);
        assert_eq!(summary.waiting, 3);

        assert!(queue.kill_job(0).await);
        assert!(!queue.kill_job(4).await);
        assert!(!queue.kill_job(99).await);
        queue.run_cycle().await.unwrap();
        assert_eq!(queue.summary().submitted, 1);

        queue.kill_all().await;
        assert!(queue.is_finished());
        assert_eq!(queue.summary().killed, 5);
    }

    #[tokio::test]
    async fn test_retryable_error_keeps_jobs_waiting() {
        let driver = QueueDriver::new(ScriptedDriver::failing_with(SubmitError::NoCapacity));
        let mut queue = JobQueue::new(driver, fast_config(2));
        queue.add_job(spec("real-0"));
        queue.add_job(spec("real-1"));

        queue.run_cycle().await.unwrap();
        assert_eq!(queue.summary().waiting, 2);
        assert!(queue.nodes().iter().all(|n| n.attempts() == 0));
    }

    #[tokio::test]
    async fn test_fatal_error_stops_run() {
        let driver = QueueDriver::new(ScriptedDriver::failing_with(SubmitError::Fatal(
            "error budget exhausted".to_string(),
        )));
        let mut queue = JobQueue::new(driver, fast_config(2));
        queue.add_job(spec("real-0"));

        assert!(matches!(queue.run().await, Err(QueueError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_exit_before_running_blacklists() {
        let scripted = ScriptedDriver::new(|_, _| DriverStatus::Exited);
        let blacklisted = Arc::clone(&scripted.blacklisted);
        let mut queue = JobQueue::new(QueueDriver::new(scripted), fast_config(1));
        queue.add_job(spec("real-0"));

        let summary = queue.run().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(blacklisted.load(Ordering::SeqCst), 1);
        assert!(queue.nodes()[0].handle().is_none());
    }

    #[tokio::test]
    async fn test_empty_queue_finishes() {
        let driver = QueueDriver::new(ScriptedDriver::new(|_, _| DriverStatus::Done));
        let mut queue = JobQueue::new(driver, fast_config(2));
        assert_eq!(queue.run().await.unwrap(), QueueSummary::default());
    }

    #[tokio::test]
    async fn test_local_driver_end_to_end() {
        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();

        let mut queue = JobQueue::new(QueueDriver::new(LocalDriver::new()), fast_config(2));
        for i in 0..3 {
            let run_path = root.join(format!("real-{}", i));
            let spec = JobSpec::new("sh", run_path, format!("real-{}", i))
                .with_args(["-c", "echo ok > OK"]);
            queue.add_job(spec);
        }
        let broken = JobSpec::new("sh", root.join("real-3"), "real-3")
            .with_args(["-c", "echo 'missing input' > ERROR; exit 1"])
            .with_marker_files("OK", "STATUS", "ERROR");
        queue.add_job(broken);

        let summary = queue.run().await.unwrap();
        assert_eq!(summary.done, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(queue.nodes()[3].attempts(), 2);
        assert_eq!(queue.nodes()[3].error(), Some("missing input"));
        assert!(root.join("real-0/OK").exists());

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"done\":3"));
    }

    #[tokio::test]
    async fn test_broken_qsub_ends_run() {
        use runq_torque::driver::QSUB_CMD;
        use runq_torque::TorqueDriver;
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();
        let qsub = root.join("qsub");
        std::fs::write(&qsub, "#!/bin/sh\necho 'qsub: Bad UID for job execution' >&2\n").unwrap();
        std::fs::set_permissions(&qsub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut torque = TorqueDriver::new()
            .with_max_error_count(3)
            .with_submit_error_sleep(Duration::ZERO);
        assert!(torque.set_option(QSUB_CMD, qsub.as_str()));

        let mut queue = JobQueue::new(QueueDriver::new(torque), fast_config(2));
        queue.add_job(JobSpec::new("forward-model", root.join("real-0"), "real-0"));

        let result = tokio::time::timeout(Duration::from_secs(10), queue.run())
            .await
            .expect("run should end once the qsub error budget is spent");
        assert!(matches!(result, Err(QueueError::Fatal(SubmitError::Fatal(_)))));
        assert_eq!(queue.summary().waiting, 1);
    }
}
