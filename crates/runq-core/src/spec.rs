//! Job specification handed to drivers.

use crate::driver::SubmitError;
use camino::{Utf8Path, Utf8PathBuf};

/// Everything a driver needs to launch one forward-model run.
///
/// Immutable once submitted; the queue hands out shared references only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Program to run
    pub executable: String,

    /// Arguments passed after the executable
    pub args: Vec<String>,

    /// Directory the job runs in
    pub run_path: Utf8PathBuf,

    /// Name shown by the scheduler
    pub job_name: String,

    /// Requested CPU count, at least 1
    pub num_cpu: u32,

    /// Marker written by the job when it completed successfully
    pub ok_file: Option<String>,

    /// Marker the job keeps updated while running
    pub status_file: Option<String>,

    /// Marker containing the error report when the job failed
    pub exit_file: Option<String>,
}

impl JobSpec {
    pub fn new(
        executable: impl Into<String>,
        run_path: impl Into<Utf8PathBuf>,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            run_path: run_path.into(),
            job_name: job_name.into(),
            num_cpu: 1,
            ok_file: None,
            status_file: None,
            exit_file: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_num_cpu(mut self, num_cpu: u32) -> Self {
        self.num_cpu = num_cpu;
        self
    }

    pub fn with_marker_files(
        mut self,
        ok_file: impl Into<String>,
        status_file: impl Into<String>,
        exit_file: impl Into<String>,
    ) -> Self {
        self.ok_file = Some(ok_file.into());
        self.status_file = Some(status_file.into());
        self.exit_file = Some(exit_file.into());
        self
    }

    /// Check the constraints every driver relies on.
    pub fn validate(&self) -> Result<(), SubmitError> {
        if self.executable.trim().is_empty() {
            return Err(SubmitError::InvalidSpec(format!(
                "job {} has no executable",
                self.job_name
            )));
        }
        if self.num_cpu == 0 {
            return Err(SubmitError::InvalidSpec(format!(
                "job {} requests zero CPUs",
                self.job_name
            )));
        }
        Ok(())
    }

    /// Full command line, executable first.
    pub fn command_line(&self) -> Vec<&str> {
        std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Resolve a marker file name against the run directory.
    pub fn marker_path(&self, name: &str) -> Utf8PathBuf {
        let path = Utf8Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.run_path.join(path)
        }
    }

    pub fn ok_path(&self) -> Option<Utf8PathBuf> {
        self.ok_file.as_deref().map(|f| self.marker_path(f))
    }

    pub fn status_path(&self) -> Option<Utf8PathBuf> {
        self.status_file.as_deref().map(|f| self.marker_path(f))
    }

    pub fn exit_path(&self) -> Option<Utf8PathBuf> {
        self.exit_file.as_deref().map(|f| self.marker_path(f))
    }
}
