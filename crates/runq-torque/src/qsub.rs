//! qsub submit scripts, arguments and output.

use camino::{Utf8Path, Utf8PathBuf};
use runq_core::JobSpec;
use std::fs;

pub const SUBMIT_SCRIPT: &str = "qsub_script.sh";

/// Placement and naming settings shared by every submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QsubSettings {
    pub queue: Option<String>,
    pub num_nodes: u32,
    pub cpus_per_node: u32,
    pub cluster_label: Option<String>,
    pub job_prefix: Option<String>,
    pub keep_output: bool,
}

impl Default for QsubSettings {
    fn default() -> Self {
        Self {
            queue: None,
            num_nodes: 1,
            cpus_per_node: 1,
            cluster_label: None,
            job_prefix: None,
            keep_output: false,
        }
    }
}

impl QsubSettings {
    /// Processing units one job can get.
    pub fn capacity(&self) -> u64 {
        u64::from(self.num_nodes) * u64::from(self.cpus_per_node)
    }

    /// The `-l` resource list, e.g. `nodes=2:gpu:ppn=8`.
    pub fn resource_list(&self) -> String {
        match &self.cluster_label {
            Some(label) => format!(
                "nodes={}:{}:ppn={}",
                self.num_nodes, label, self.cpus_per_node
            ),
            None => format!("nodes={}:ppn={}", self.num_nodes, self.cpus_per_node),
        }
    }

    pub fn job_name(&self, name: &str) -> String {
        match &self.job_prefix {
            Some(prefix) => format!("{}{}", prefix, name),
            None => name.to_string(),
        }
    }

    pub fn args(&self, job_name: &str, script: &Utf8Path) -> Vec<String> {
        let mut args = Vec::new();
        if self.keep_output {
            args.push("-k".to_string());
            args.push("oe".to_string());
        }
        args.push("-l".to_string());
        args.push(self.resource_list());
        if let Some(queue) = &self.queue {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        args.push("-N".to_string());
        args.push(self.job_name(job_name));
        args.push(script.to_string());
        args
    }
}

/// Write the script qsub runs: a shebang and the job's command line.
pub fn write_submit_script(spec: &JobSpec) -> std::io::Result<Utf8PathBuf> {
    fs::create_dir_all(&spec.run_path)?;
    let path = spec.run_path.join(SUBMIT_SCRIPT);
    fs::write(&path, format!("#!/bin/sh\n{}\n", spec.command_line().join(" ")))?;
    Ok(path)
}

/// qsub prints `12345.server`; the job id is the integer before the first dot.
pub fn parse_job_id(output: &str) -> Option<u64> {
    runq_parsers::parse_int_upto(output, '.')
}
