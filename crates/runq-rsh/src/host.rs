//! Remote hosts in the fan-out pool.

use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HostError {
    #[error("Empty host name in {0:?}")]
    EmptyName(String),
    #[error("Invalid capacity in {0:?}")]
    InvalidCapacity(String),
}

/// One remote host and the number of jobs this driver runs on it.
#[derive(Debug)]
pub struct RshHost {
    name: String,
    max_running: usize,
    running: Mutex<usize>,
}

impl RshHost {
    pub fn new(name: impl Into<String>, max_running: usize) -> Self {
        Self {
            name: name.into(),
            max_running,
            running: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }

    pub fn running(&self) -> usize {
        self.running.lock().map(|r| *r).unwrap_or(self.max_running)
    }

    /// Claim a slot if the host has one free.
    ///
    /// Check and increment happen under one lock, so concurrent callers can
    /// never overbook the host. The slot is returned when the guard drops.
    pub fn try_reserve(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut running = self.running.lock().ok()?;
        if *running < self.max_running {
            *running += 1;
            Some(SlotGuard {
                host: Arc::clone(self),
            })
        } else {
            None
        }
    }

    fn free_slot(&self) {
        if let Ok(mut running) = self.running.lock() {
            *running = running.saturating_sub(1);
        }
    }
}

/// A reserved slot on a host.
#[derive(Debug)]
pub struct SlotGuard {
    host: Arc<RshHost>,
}

impl SlotGuard {
    pub fn host(&self) -> &Arc<RshHost> {
        &self.host
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.host.free_slot();
    }
}

/// Parse `host[:capacity]`; capacity defaults to 1 and must be positive.
pub fn parse_host_spec(spec: &str) -> Result<(String, usize), HostError> {
    let spec = spec.trim();
    let (name, capacity) = match spec.rsplit_once(':') {
        Some((name, capacity)) => {
            let capacity: i64 = capacity
                .trim()
                .parse()
                .map_err(|_| HostError::InvalidCapacity(spec.to_string()))?;
            if capacity <= 0 {
                return Err(HostError::InvalidCapacity(spec.to_string()));
            }
            (name.trim(), capacity as usize)
        }
        None => (spec, 1),
    };

    if name.is_empty() {
        return Err(HostError::EmptyName(spec.to_string()));
    }
    Ok((name.to_string(), capacity))
}
