//! CLI argument parsing for runq.

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use runq_core::JobSpec;

/// Scheduler backend.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Child processes of this process
    Local,
    /// LSF via bsub/bjobs/bkill
    Lsf,
    /// Torque/PBS via qsub/qstat/qdel
    Torque,
    /// A fixed host list over ssh
    Rsh,
}

#[derive(Parser, Debug)]
#[command(name = "runq")]
#[command(about = "Run a batch of forward-model jobs through an HPC scheduler")]
pub struct Args {
    /// Scheduler backend
    #[arg(long, value_enum, default_value = "local")]
    pub driver: DriverKind,

    /// Driver option as KEY=VALUE, may be repeated
    #[arg(short = 'o', long = "option", value_parser = parse_key_value)]
    pub options: Vec<(String, String)>,

    /// List the option keys of the selected driver and exit
    #[arg(long)]
    pub list_options: bool,

    /// Submissions per job before it counts as failed
    #[arg(long, default_value = "2")]
    pub max_submit: u32,

    /// Cap on active jobs, 0 for the driver's MAX_RUNNING
    #[arg(long, default_value = "0")]
    pub max_running: usize,

    /// Poll interval in seconds
    #[arg(long, default_value = "2")]
    pub poll_interval: u64,

    /// Number of realizations to run
    #[arg(long, default_value = "1")]
    pub realizations: usize,

    /// Run directory per realization; %d is replaced by its number
    #[arg(long, default_value = "runs/real-%d")]
    pub run_path: String,

    /// Job name per realization; %d is replaced by its number
    #[arg(long, default_value = "real-%d")]
    pub job_name: String,

    /// CPUs per job
    #[arg(long, default_value = "1")]
    pub num_cpu: u32,

    /// Marker file a job writes on failure, relative to its run directory
    #[arg(long)]
    pub exit_file: Option<String>,

    /// Print the final summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Program and arguments; %d in arguments is replaced by the realization
    #[arg(last = true, required_unless_present = "list_options")]
    pub command: Vec<String>,
}

/// Parse `KEY=VALUE`; the value may itself contain `=`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

/// Replace every `%d` in `template` with the realization number.
pub fn expand(template: &str, realization: usize) -> String {
    template.replace("%d", &realization.to_string())
}

impl Args {
    /// One job per realization.
    pub fn job_specs(&self) -> Vec<JobSpec> {
        let Some((executable, args)) = self.command.split_first() else {
            return Vec::new();
        };

        (0..self.realizations)
            .map(|i| {
                let mut spec = JobSpec::new(
                    executable.clone(),
                    Utf8PathBuf::from(expand(&self.run_path, i)),
                    expand(&self.job_name, i),
                )
                .with_args(args.iter().map(|a| expand(a, i)))
                .with_num_cpu(self.num_cpu);
                spec.exit_file = self.exit_file.clone();
                spec
            })
            .collect()
    }
}
