use crate::host::{parse_host_spec, RshHost, SlotGuard};
use async_trait::async_trait;
use runq_core::{Driver, DriverStatus, HandleAllocator, JobHandle, JobSpec, SubmitError};
use runq_parsers::{run_command_allow_failure, split_host_list};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::task::AbortHandle;

pub const RSH_HOST: &str = "RSH_HOST";
pub const RSH_HOSTLIST: &str = "RSH_HOSTLIST";
pub const RSH_CLEAR_HOSTLIST: &str = "RSH_CLEAR_HOSTLIST";
pub const RSH_CMD: &str = "RSH_CMD";

const DEFAULT_RSH_CMD: &str = "/usr/bin/ssh";

struct RshJob {
    worker: AbortHandle,
    completed: Arc<AtomicBool>,
}

/// Runs jobs on a fixed pool of hosts through a remote shell.
pub struct RshDriver {
    handles: HandleAllocator,
    rsh_cmd: String,
    hosts: Vec<Arc<RshHost>>,
    /// Where the next host search starts; the lock also serializes submits.
    next_host: Mutex<usize>,
    jobs: Mutex<HashMap<u64, RshJob>>,
}

impl Default for RshDriver {
    fn default() -> Self {
        Self {
            handles: HandleAllocator::new(),
            rsh_cmd: DEFAULT_RSH_CMD.to_string(),
            hosts: Vec::new(),
            next_host: Mutex::new(0),
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl RshDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `(name, max_running, running)` per host, in pool order.
    pub fn hosts(&self) -> Vec<(String, usize, usize)> {
        self.hosts
            .iter()
            .map(|h| (h.name().to_string(), h.max_running(), h.running()))
            .collect()
    }

    fn add_host(&mut self, spec: &str) -> bool {
        match parse_host_spec(spec) {
            Ok((name, capacity)) => {
                tracing::debug!(host = %name, capacity, "adding host");
                self.hosts.push(Arc::new(RshHost::new(name, capacity)));
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "rejected host");
                false
            }
        }
    }

    fn replace_hosts(&mut self, list: &str) -> bool {
        let mut parsed = Vec::new();
        for entry in split_host_list(list) {
            match parse_host_spec(&entry) {
                Ok((name, capacity)) => parsed.push(Arc::new(RshHost::new(name, capacity))),
                Err(e) => {
                    tracing::warn!(error = %e, "rejected host list");
                    return false;
                }
            }
        }
        self.clear_hosts();
        self.hosts = parsed;
        true
    }

    fn clear_hosts(&mut self) {
        self.hosts.clear();
        if let Ok(mut next) = self.next_host.lock() {
            *next = 0;
        }
    }

    /// Reserve a slot on the first host with room, starting at the rotation index.
    fn reserve_slot(&self) -> Result<SlotGuard, SubmitError> {
        let mut next = self
            .next_host
            .lock()
            .map_err(|_| SubmitError::Fatal("host rotation lock poisoned".to_string()))?;

        let count = self.hosts.len();
        if count == 0 {
            return Err(SubmitError::NoCapacity);
        }

        let start = *next % count;
        for offset in 0..count {
            let index = (start + offset) % count;
            if let Some(slot) = self.hosts[index].try_reserve() {
                *next = (index + 1) % count;
                return Ok(slot);
            }
        }
        Err(SubmitError::NoCapacity)
    }
}

#[async_trait]
impl Driver for RshDriver {
    fn name(&self) -> &'static str {
        "rsh"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError> {
        spec.validate()?;
        let slot = self.reserve_slot()?;

        let host = slot.host().name().to_string();
        let mut cmd = Command::new(&self.rsh_cmd);
        cmd.arg(&host).arg(&spec.executable).args(&spec.args);

        let completed = Arc::new(AtomicBool::new(false));
        let worker = {
            let completed = Arc::clone(&completed);
            let rsh_cmd = self.rsh_cmd.clone();
            let job_name = spec.job_name.clone();
            tokio::spawn(async move {
                let _slot = slot;
                if let Err(e) = run_command_allow_failure(&mut cmd, &rsh_cmd).await {
                    tracing::warn!(job = %job_name, error = %e, "remote shell failed");
                }
                completed.store(true, Ordering::Release);
            })
        };

        let handle = self.handles.allocate(host);
        tracing::debug!(job = %spec.job_name, handle = %handle, "started remote job");

        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SubmitError::Fatal("rsh job table poisoned".to_string()))?;
        jobs.insert(
            handle.key(),
            RshJob {
                worker: worker.abort_handle(),
                completed,
            },
        );
        Ok(handle)
    }

    async fn status(&self, handle: Option<&JobHandle>) -> DriverStatus {
        let Some(handle) = handle else {
            return DriverStatus::NotActive;
        };
        let Ok(jobs) = self.jobs.lock() else {
            return DriverStatus::Unknown;
        };
        match jobs.get(&handle.key()) {
            None => DriverStatus::NotActive,
            Some(job) if job.completed.load(Ordering::Acquire) => DriverStatus::Done,
            // Aborted by kill before the remote command returned
            Some(job) if job.worker.is_finished() => DriverStatus::Exited,
            Some(_) => DriverStatus::Running,
        }
    }

    async fn kill(&self, handle: &JobHandle) {
        if let Ok(jobs) = self.jobs.lock() {
            if let Some(job) = jobs.get(&handle.key()) {
                tracing::debug!(handle = %handle, "aborting remote job");
                job.worker.abort();
            }
        }
    }

    async fn release(&self, handle: &JobHandle) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&handle.key());
        }
    }

    fn set_option(&mut self, key: &str, value: &str) -> bool {
        match key {
            RSH_HOST => self.add_host(value),
            RSH_HOSTLIST => self.replace_hosts(value),
            RSH_CLEAR_HOSTLIST => {
                self.clear_hosts();
                true
            }
            RSH_CMD => {
                self.rsh_cmd = value.to_string();
                true
            }
            _ => false,
        }
    }

    fn get_option(&self, key: &str) -> Option<String> {
        match key {
            RSH_HOSTLIST => Some(
                self.hosts
                    .iter()
                    .map(|h| format!("{}:{}", h.name(), h.max_running()))
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            RSH_CMD => Some(self.rsh_cmd.clone()),
            _ => None,
        }
    }

    fn option_keys(&self) -> Vec<&'static str> {
        vec![RSH_HOST, RSH_HOSTLIST, RSH_CLEAR_HOSTLIST, RSH_CMD]
    }
}
