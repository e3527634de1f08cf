//! Driver wrapper carrying the options shared by every backend.

use crate::driver::{Driver, DriverStatus, JobHandle, SubmitError};
use crate::spec::JobSpec;
use async_trait::async_trait;

/// Generic cap on concurrently running jobs; 0 means unlimited.
pub const MAX_RUNNING: &str = "MAX_RUNNING";

/// A backend plus the generic options the queue consults.
pub struct QueueDriver {
    inner: Box<dyn Driver>,
    max_running: usize,
}

impl QueueDriver {
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self::from_boxed(Box::new(driver))
    }

    pub fn from_boxed(inner: Box<dyn Driver>) -> Self {
        Self {
            inner,
            max_running: 0,
        }
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }
}

#[async_trait]
impl Driver for QueueDriver {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError> {
        self.inner.submit(spec).await
    }

    async fn status(&self, handle: Option<&JobHandle>) -> DriverStatus {
        self.inner.status(handle).await
    }

    async fn kill(&self, handle: &JobHandle) {
        self.inner.kill(handle).await
    }

    async fn release(&self, handle: &JobHandle) {
        self.inner.release(handle).await
    }

    async fn blacklist_node(&self, handle: &JobHandle) {
        self.inner.blacklist_node(handle).await
    }

    fn set_option(&mut self, key: &str, value: &str) -> bool {
        if key == MAX_RUNNING {
            return match value.trim().parse::<usize>() {
                Ok(max) => {
                    self.max_running = max;
                    true
                }
                Err(_) => false,
            };
        }
        self.inner.set_option(key, value)
    }

    fn get_option(&self, key: &str) -> Option<String> {
        if key == MAX_RUNNING {
            return Some(self.max_running.to_string());
        }
        self.inner.get_option(key)
    }

    fn option_keys(&self) -> Vec<&'static str> {
        let mut keys = vec![MAX_RUNNING];
        keys.extend(self.inner.option_keys());
        keys
    }
}
