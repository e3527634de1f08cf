//! LSF driver.

use crate::bhist::{classify, parse_bhist, BhistSample};
use crate::bjobs::{parse_bjobs_table, parse_exec_hosts};
use crate::bsub::{parse_job_id, BsubRequest};
use crate::options::{LsfOptions, ALL_KEYS, LSF_DEBUG_OUTPUT, LSF_EXCLUDE_HOST, LSF_SERVER};
use crate::resource::compose_resource;
use crate::transport::{LsbApi, SubmitMethod};
use crate::types::LsfState;
use async_trait::async_trait;
use runq_core::{Driver, DriverStatus, HandleAllocator, JobHandle, JobRecord, JobSpec, SubmitError};
use runq_parsers::{
    parse_bool, run_command_allow_failure, run_command_listing, run_command_merged, split_host_list,
    CommandError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Name of the job-identity record written into the run directory.
pub const LSF_INFO_FILE: &str = "lsf_info.json";

const MAX_ERROR_COUNT: u32 = 100;
const BHIST_SAMPLE_DELAY: Duration = Duration::from_secs(4);

/// Which output of an LSF tool the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    /// stdout, whatever the exit status
    Stdout,
    /// stdout and stderr
    Merged,
    /// stdout; a failed run with empty stdout is an error
    Listing,
}

struct LsfJob {
    job_id: u64,
    /// Filled from the client library on first sight
    exec_hosts: Vec<String>,
}

/// Last bjobs snapshot, limited to jobs this driver submitted.
#[derive(Default)]
struct StatusCache {
    states: HashMap<String, LsfState>,
    owned: HashSet<String>,
    refreshed: Option<Instant>,
}

impl StatusCache {
    fn is_stale(&self, job_id: &str, max_age: Duration) -> bool {
        match self.refreshed {
            Some(at) => at.elapsed() > max_age || !self.states.contains_key(job_id),
            None => true,
        }
    }
}

pub struct LsfDriver {
    handles: HandleAllocator,
    options: LsfOptions,
    method: SubmitMethod,
    lsb: Option<Arc<dyn LsbApi>>,
    submit_lock: tokio::sync::Mutex<()>,
    cache: tokio::sync::Mutex<StatusCache>,
    exclude_hosts: Mutex<Vec<String>>,
    jobs: Mutex<HashMap<u64, LsfJob>>,
    error_count: AtomicU32,
    max_error_count: u32,
    debug_output: AtomicBool,
    bhist_delay: Duration,
}

impl Default for LsfDriver {
    fn default() -> Self {
        Self {
            handles: HandleAllocator::new(),
            options: LsfOptions::default(),
            method: SubmitMethod::select(None, false),
            lsb: None,
            submit_lock: tokio::sync::Mutex::new(()),
            cache: tokio::sync::Mutex::new(StatusCache::default()),
            exclude_hosts: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            error_count: AtomicU32::new(0),
            max_error_count: MAX_ERROR_COUNT,
            debug_output: AtomicBool::new(false),
            bhist_delay: BHIST_SAMPLE_DELAY,
        }
    }
}

impl LsfDriver {
    /// Driver using the command-line tools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver that can also talk to LSF through the client library.
    pub fn with_library(lsb: Arc<dyn LsbApi>) -> Self {
        let mut driver = Self::default();
        driver.lsb = Some(lsb);
        driver.select_method();
        driver
    }

    /// Submission failures tolerated before the integration counts as broken.
    pub fn with_max_error_count(mut self, max: u32) -> Self {
        self.max_error_count = max;
        self
    }

    /// Delay between the two bhist samples.
    pub fn with_bhist_delay(mut self, delay: Duration) -> Self {
        self.bhist_delay = delay;
        self
    }

    pub fn method(&self) -> &SubmitMethod {
        &self.method
    }

    pub fn debug_output(&self) -> bool {
        self.debug_output.load(Ordering::Relaxed)
    }

    pub fn exclude_hosts(&self) -> Vec<String> {
        self.exclude_hosts
            .lock()
            .map(|hosts| hosts.clone())
            .unwrap_or_default()
    }

    fn select_method(&mut self) {
        self.method = SubmitMethod::select(self.options.server.as_deref(), self.lsb.is_some());
        tracing::debug!(method = ?self.method, "selected LSF submit method");
    }

    fn enable_debug_output(&self) {
        self.debug_output.store(true, Ordering::Relaxed);
    }

    fn add_exclude_hosts(&self, hosts: &[String]) {
        if let Ok(mut excluded) = self.exclude_hosts.lock() {
            for host in hosts {
                if !excluded.contains(host) {
                    excluded.push(host.clone());
                }
            }
        }
    }

    fn job_id(&self, handle: &JobHandle) -> Option<u64> {
        let jobs = self.jobs.lock().ok()?;
        jobs.get(&handle.key()).map(|job| job.job_id)
    }

    /// Run one of the LSF tools through the shell transport.
    async fn run_tool(&self, tool: &str, args: &[String], capture: Capture) -> Result<String, CommandError> {
        let Some(mut cmd) = self.method.shell_command(&self.options.rsh_cmd, tool, args) else {
            return Err(CommandError::Execution {
                command: tool.to_string(),
                error: "no shell transport selected".to_string(),
            });
        };
        if self.debug_output() {
            tracing::info!(tool, ?args, "running LSF command");
        }
        match capture {
            Capture::Stdout => run_command_allow_failure(&mut cmd, tool).await,
            Capture::Merged => run_command_merged(&mut cmd, tool).await,
            Capture::Listing => run_command_listing(&mut cmd, tool).await,
        }
    }

    fn build_request(&self, spec: &JobSpec) -> Result<BsubRequest, SubmitError> {
        let exclude = self.exclude_hosts();
        let resource = if self.method == SubmitMethod::Library {
            if !exclude.is_empty() {
                tracing::warn!(
                    hosts = ?exclude,
                    "excluding hosts is not supported with the LSF library"
                );
            }
            self.options.resource.clone()
        } else {
            compose_resource(self.options.resource.as_deref(), &exclude)
                .map_err(|e| SubmitError::Fatal(e.to_string()))?
        };

        let mut request = BsubRequest::new(spec);
        request.queue = self.options.queue.clone();
        request.resource = resource;
        request.login_shell = self.options.login_shell.clone();
        request.project_code = self.options.project_code.clone();
        Ok(request)
    }

    async fn submit_request(&self, request: &BsubRequest) -> Result<u64, String> {
        match &self.method {
            SubmitMethod::Library => match &self.lsb {
                Some(lsb) => lsb.submit(request).await,
                None => Err("LSF library is not available".to_string()),
            },
            method => {
                let args = request.args(method.is_remote());
                let output = self
                    .run_tool(&self.options.bsub_cmd, &args, Capture::Merged)
                    .await
                    .map_err(|e| e.to_string())?;
                if self.debug_output() {
                    tracing::info!(output = %output.trim(), "bsub output");
                }
                parse_job_id(&output).ok_or(output)
            }
        }
    }

    async fn register(&self, spec: &JobSpec, job_id: u64) -> Result<JobHandle, SubmitError> {
        let native_id = job_id.to_string();
        self.cache.lock().await.owned.insert(native_id.clone());

        let record = JobRecord::new(native_id.as_str(), spec.job_name.as_str(), self.name());
        if let Err(e) = record.write(&spec.run_path, LSF_INFO_FILE) {
            tracing::warn!(job = %spec.job_name, error = %e, "failed to write job record");
        }

        let handle = self.handles.allocate(native_id);
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SubmitError::Fatal("LSF job table poisoned".to_string()))?;
        jobs.insert(
            handle.key(),
            LsfJob {
                job_id,
                exec_hosts: Vec::new(),
            },
        );
        tracing::info!(job = %spec.job_name, job_id, "submitted LSF job");
        Ok(handle)
    }

    async fn submit_failed(&self, spec: &JobSpec, output: String) -> SubmitError {
        let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.max_error_count {
            tracing::error!(job = %spec.job_name, count, "too many LSF submission failures");
            return SubmitError::Fatal(format!(
                "{} LSF submissions failed, last output: {}",
                count,
                output.trim()
            ));
        }

        tracing::error!(
            job = %spec.job_name,
            output = %output.trim(),
            "LSF submission failed, will retry"
        );
        self.enable_debug_output();
        tokio::time::sleep(self.options.submit_error_sleep).await;
        SubmitError::Transient(output)
    }

    async fn refresh_cache(&self, cache: &mut StatusCache) {
        let args = ["-a".to_string()];
        match self.run_tool(&self.options.bjobs_cmd, &args, Capture::Listing).await {
            Ok(output) => {
                cache.states = parse_bjobs_table(&output, &cache.owned);
                cache.refreshed = Some(Instant::now());
            }
            Err(e) => tracing::warn!(error = %e, "bjobs failed, keeping previous status"),
        }
    }

    async fn bhist_sample(&self, job_id: &str) -> Option<BhistSample> {
        let output = self
            .run_tool(&self.options.bhist_cmd, &[job_id.to_string()], Capture::Stdout)
            .await
            .ok()?;
        parse_bhist(&output)
    }

    async fn bhist_status(&self, job_id: &str) -> LsfState {
        tracing::warn!(job_id, "job missing from bjobs, trying bhist");
        let unknown = || LsfState::Unknown("bhist".to_string());

        let Some(first) = self.bhist_sample(job_id).await else {
            return unknown();
        };
        tokio::time::sleep(self.bhist_delay).await;
        let Some(second) = self.bhist_sample(job_id).await else {
            return unknown();
        };
        classify(first, second)
    }

    async fn shell_status(&self, job_id: u64) -> LsfState {
        let job_id = job_id.to_string();
        {
            let mut cache = self.cache.lock().await;
            if cache.is_stale(&job_id, self.options.bjobs_timeout) {
                self.refresh_cache(&mut cache).await;
            }
            if let Some(state) = cache.states.get(&job_id) {
                return state.clone();
            }
        }

        let state = self.bhist_status(&job_id).await;
        self.cache.lock().await.states.insert(job_id, state.clone());
        state
    }

    async fn library_status(&self, handle: &JobHandle, job_id: u64) -> DriverStatus {
        let Some(lsb) = &self.lsb else {
            return DriverStatus::Unknown;
        };
        let Some(info) = lsb.job_info(job_id).await else {
            // Aged out of the job database while the daemon was unreachable
            tracing::warn!(job_id, "no status information for job, assuming it finished");
            return DriverStatus::Done;
        };

        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(job) = jobs.get_mut(&handle.key()) {
                if job.exec_hosts.is_empty() {
                    job.exec_hosts = info.exec_hosts.clone();
                }
            }
        }
        info.state.driver_status()
    }

    async fn exec_hosts(&self, handle: &JobHandle, job_id: u64) -> Vec<String> {
        if self.method == SubmitMethod::Library {
            return self
                .jobs
                .lock()
                .ok()
                .and_then(|jobs| jobs.get(&handle.key()).map(|job| job.exec_hosts.clone()))
                .unwrap_or_default();
        }

        let field = if self.method.is_remote() {
            "'EXEC_HOST'"
        } else {
            "EXEC_HOST"
        };
        let args = [
            "-noheader".to_string(),
            "-o".to_string(),
            field.to_string(),
            job_id.to_string(),
        ];
        match self.run_tool(&self.options.bjobs_cmd, &args, Capture::Stdout).await {
            Ok(output) => parse_exec_hosts(&output),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "could not look up execution hosts");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Driver for LsfDriver {
    fn name(&self) -> &'static str {
        "lsf"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError> {
        spec.validate()?;
        if !self.options.submit_sleep.is_zero() {
            tokio::time::sleep(self.options.submit_sleep).await;
        }

        let _guard = self.submit_lock.lock().await;
        let request = self.build_request(spec)?;
        match self.submit_request(&request).await {
            Ok(job_id) => self.register(spec, job_id).await,
            Err(output) => Err(self.submit_failed(spec, output).await),
        }
    }

    async fn status(&self, handle: Option<&JobHandle>) -> DriverStatus {
        let Some(handle) = handle else {
            return DriverStatus::NotActive;
        };
        let Some(job_id) = self.job_id(handle) else {
            return DriverStatus::NotActive;
        };

        match self.method {
            SubmitMethod::Library => self.library_status(handle, job_id).await,
            _ => self.shell_status(job_id).await.driver_status(),
        }
    }

    async fn kill(&self, handle: &JobHandle) {
        let Some(job_id) = self.job_id(handle) else {
            return;
        };
        match (&self.method, &self.lsb) {
            (SubmitMethod::Library, Some(lsb)) => lsb.kill(job_id).await,
            _ => {
                if let Err(e) = self
                    .run_tool(&self.options.bkill_cmd, &[job_id.to_string()], Capture::Stdout)
                    .await
                {
                    tracing::warn!(job_id, error = %e, "bkill failed");
                }
            }
        }
    }

    async fn release(&self, handle: &JobHandle) {
        let removed = self
            .jobs
            .lock()
            .ok()
            .and_then(|mut jobs| jobs.remove(&handle.key()));
        if let Some(job) = removed {
            let job_id = job.job_id.to_string();
            let mut cache = self.cache.lock().await;
            cache.states.remove(&job_id);
            cache.owned.remove(&job_id);
        }
    }

    async fn blacklist_node(&self, handle: &JobHandle) {
        let Some(job_id) = self.job_id(handle) else {
            return;
        };
        let hosts = self.exec_hosts(handle, job_id).await;
        if hosts.is_empty() {
            return;
        }

        self.add_exclude_hosts(&hosts);
        tracing::error!(
            job_id,
            hosts = %hosts.join(","),
            excluded = %self.exclude_hosts().join(","),
            "job failed before it started running, excluding its hosts"
        );
        self.enable_debug_output();
    }

    fn set_option(&mut self, key: &str, value: &str) -> bool {
        match key {
            LSF_EXCLUDE_HOST => {
                self.add_exclude_hosts(&split_host_list(value));
                true
            }
            LSF_DEBUG_OUTPUT => match parse_bool(value) {
                Some(on) => {
                    self.debug_output.store(on, Ordering::Relaxed);
                    true
                }
                None => false,
            },
            LSF_SERVER => {
                let ok = self.options.set(key, value);
                self.select_method();
                ok
            }
            _ => self.options.set(key, value),
        }
    }

    fn get_option(&self, key: &str) -> Option<String> {
        match key {
            LSF_EXCLUDE_HOST => Some(self.exclude_hosts().join(",")),
            LSF_DEBUG_OUTPUT => Some(if self.debug_output() { "1" } else { "0" }.to_string()),
            _ => self.options.get(key),
        }
    }

    fn option_keys(&self) -> Vec<&'static str> {
        ALL_KEYS.to_vec()
    }
}
