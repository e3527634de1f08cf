//! LSF driver options.

use std::time::Duration;

pub const LSF_QUEUE: &str = "LSF_QUEUE";
pub const LSF_RESOURCE: &str = "LSF_RESOURCE";
pub const LSF_SERVER: &str = "LSF_SERVER";
pub const LSF_LOGIN_SHELL: &str = "LSF_LOGIN_SHELL";
pub const LSF_RSH_CMD: &str = "LSF_RSH_CMD";
pub const LSF_BSUB_CMD: &str = "LSF_BSUB_CMD";
pub const LSF_BJOBS_CMD: &str = "LSF_BJOBS_CMD";
pub const LSF_BKILL_CMD: &str = "LSF_BKILL_CMD";
pub const LSF_BHIST_CMD: &str = "LSF_BHIST_CMD";
pub const LSF_PROJECT_CODE: &str = "LSF_PROJECT_CODE";
pub const LSF_EXCLUDE_HOST: &str = "LSF_EXCLUDE_HOST";
pub const LSF_BJOBS_TIMEOUT: &str = "LSF_BJOBS_TIMEOUT";
pub const LSF_SUBMIT_SLEEP: &str = "LSF_SUBMIT_SLEEP";
pub const LSF_SUBMIT_ERROR_SLEEP: &str = "LSF_SUBMIT_ERROR_SLEEP";
pub const LSF_DEBUG_OUTPUT: &str = "LSF_DEBUG_OUTPUT";

pub const ALL_KEYS: [&str; 15] = [
    LSF_QUEUE,
    LSF_RESOURCE,
    LSF_SERVER,
    LSF_LOGIN_SHELL,
    LSF_RSH_CMD,
    LSF_BSUB_CMD,
    LSF_BJOBS_CMD,
    LSF_BKILL_CMD,
    LSF_BHIST_CMD,
    LSF_PROJECT_CODE,
    LSF_EXCLUDE_HOST,
    LSF_BJOBS_TIMEOUT,
    LSF_SUBMIT_SLEEP,
    LSF_SUBMIT_ERROR_SLEEP,
    LSF_DEBUG_OUTPUT,
];

/// Plain-valued settings. The exclude set and the debug flag change while
/// jobs run, so the driver keeps those itself.
#[derive(Debug, Clone)]
pub struct LsfOptions {
    pub queue: Option<String>,
    pub resource: Option<String>,
    pub server: Option<String>,
    pub login_shell: Option<String>,
    pub project_code: Option<String>,
    pub rsh_cmd: String,
    pub bsub_cmd: String,
    pub bjobs_cmd: String,
    pub bkill_cmd: String,
    pub bhist_cmd: String,
    /// Maximum age of the bjobs cache
    pub bjobs_timeout: Duration,
    /// Pause before every submission
    pub submit_sleep: Duration,
    /// Pause after a failed submission
    pub submit_error_sleep: Duration,
}

impl Default for LsfOptions {
    fn default() -> Self {
        Self {
            queue: None,
            resource: None,
            server: None,
            login_shell: None,
            project_code: None,
            rsh_cmd: "/usr/bin/ssh".to_string(),
            bsub_cmd: "bsub".to_string(),
            bjobs_cmd: "bjobs".to_string(),
            bkill_cmd: "bkill".to_string(),
            bhist_cmd: "bhist".to_string(),
            bjobs_timeout: Duration::from_secs(10),
            submit_sleep: Duration::ZERO,
            submit_error_sleep: Duration::from_secs(2),
        }
    }
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

impl LsfOptions {
    /// Returns `false` for keys this struct does not hold or bad values.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        match key {
            LSF_QUEUE => self.queue = optional(value),
            LSF_RESOURCE => self.resource = optional(value),
            LSF_SERVER => self.server = optional(value),
            LSF_LOGIN_SHELL => self.login_shell = optional(value),
            LSF_PROJECT_CODE => self.project_code = optional(value),
            LSF_RSH_CMD => self.rsh_cmd = value.to_string(),
            LSF_BSUB_CMD => self.bsub_cmd = value.to_string(),
            LSF_BJOBS_CMD => self.bjobs_cmd = value.to_string(),
            LSF_BKILL_CMD => self.bkill_cmd = value.to_string(),
            LSF_BHIST_CMD => self.bhist_cmd = value.to_string(),
            LSF_BJOBS_TIMEOUT => match value.trim().parse::<u64>() {
                Ok(secs) => self.bjobs_timeout = Duration::from_secs(secs),
                Err(_) => return false,
            },
            LSF_SUBMIT_SLEEP => match parse_seconds(value) {
                Some(d) => self.submit_sleep = d,
                None => return false,
            },
            LSF_SUBMIT_ERROR_SLEEP => match parse_seconds(value) {
                Some(d) => self.submit_error_sleep = d,
                None => return false,
            },
            _ => return false,
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            LSF_QUEUE => self.queue.clone(),
            LSF_RESOURCE => self.resource.clone(),
            LSF_SERVER => self.server.clone(),
            LSF_LOGIN_SHELL => self.login_shell.clone(),
            LSF_PROJECT_CODE => self.project_code.clone(),
            LSF_RSH_CMD => Some(self.rsh_cmd.clone()),
            LSF_BSUB_CMD => Some(self.bsub_cmd.clone()),
            LSF_BJOBS_CMD => Some(self.bjobs_cmd.clone()),
            LSF_BKILL_CMD => Some(self.bkill_cmd.clone()),
            LSF_BHIST_CMD => Some(self.bhist_cmd.clone()),
            LSF_BJOBS_TIMEOUT => Some(self.bjobs_timeout.as_secs().to_string()),
            LSF_SUBMIT_SLEEP => Some(self.submit_sleep.as_secs_f64().to_string()),
            LSF_SUBMIT_ERROR_SLEEP => Some(self.submit_error_sleep.as_secs_f64().to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = LsfOptions::default();
        assert_eq!(options.get(LSF_BSUB_CMD).as_deref(), Some("bsub"));
        assert_eq!(options.get(LSF_RSH_CMD).as_deref(), Some("/usr/bin/ssh"));
        assert_eq!(options.get(LSF_BJOBS_TIMEOUT).as_deref(), Some("10"));
        assert_eq!(options.get(LSF_SUBMIT_ERROR_SLEEP).as_deref(), Some("2"));
        assert_eq!(options.get(LSF_QUEUE), None);
    }

    #[test]
    fn test_set_values() {
        let mut options = LsfOptions::default();
        assert!(options.set(LSF_QUEUE, "mr"));
        assert_eq!(options.get(LSF_QUEUE).as_deref(), Some("mr"));
        assert!(options.set(LSF_QUEUE, ""));
        assert_eq!(options.get(LSF_QUEUE), None);

        assert!(options.set(LSF_SUBMIT_SLEEP, "0.5"));
        assert_eq!(options.submit_sleep, Duration::from_millis(500));
        assert!(options.set(LSF_BJOBS_TIMEOUT, "30"));
        assert_eq!(options.bjobs_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_bad_values_keep_old() {
        let mut options = LsfOptions::default();
        assert!(!options.set(LSF_BJOBS_TIMEOUT, "ten"));
        assert!(!options.set(LSF_BJOBS_TIMEOUT, "-1"));
        assert_eq!(options.bjobs_timeout, Duration::from_secs(10));
        assert!(!options.set(LSF_SUBMIT_SLEEP, "-0.5"));
        assert_eq!(options.submit_sleep, Duration::ZERO);
        assert!(!options.set("LSF_QUEUES", "mr"));
    }
}
