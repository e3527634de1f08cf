//! bsub command lines and output.

use once_cell::sync::Lazy;
use regex::Regex;
use runq_core::JobSpec;

static JOB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Job <(\d+)>").expect("job id pattern is valid"));

/// Everything one LSF submission needs, independent of transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BsubRequest {
    pub stdout_file: String,
    pub queue: Option<String>,
    pub job_name: String,
    pub num_cpu: u32,
    pub resource: Option<String>,
    pub login_shell: Option<String>,
    pub project_code: Option<String>,
    pub command: Vec<String>,
}

impl BsubRequest {
    pub fn new(spec: &JobSpec) -> Self {
        Self {
            stdout_file: spec
                .run_path
                .join(format!("{}.LSF-stdout", spec.job_name))
                .into_string(),
            queue: None,
            job_name: spec.job_name.clone(),
            num_cpu: spec.num_cpu,
            resource: None,
            login_shell: None,
            project_code: None,
            command: spec.command_line().into_iter().map(str::to_string).collect(),
        }
    }

    /// bsub arguments in submission order.
    ///
    /// The resource request contains spaces; `quote_resource` wraps it in
    /// double quotes for transports that go through a remote shell.
    pub fn args(&self, quote_resource: bool) -> Vec<String> {
        let mut args = vec!["-o".to_string(), self.stdout_file.clone()];
        if let Some(queue) = &self.queue {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        args.push("-J".to_string());
        args.push(self.job_name.clone());
        args.push("-n".to_string());
        args.push(self.num_cpu.to_string());
        if let Some(resource) = &self.resource {
            args.push("-R".to_string());
            if quote_resource {
                args.push(format!("\"{}\"", resource));
            } else {
                args.push(resource.clone());
            }
        }
        if let Some(shell) = &self.login_shell {
            args.push("-L".to_string());
            args.push(shell.clone());
        }
        if let Some(project) = &self.project_code {
            args.push("-P".to_string());
            args.push(project.clone());
        }
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Extract the job id from `Job <4242> is submitted to queue <normal>.`
pub fn parse_job_id(output: &str) -> Option<u64> {
    JOB_ID
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
