//! How the driver reaches LSF.

use crate::bsub::BsubRequest;
use crate::types::LsfState;
use async_trait::async_trait;
use tokio::process::Command;

/// Submission and query transport, chosen from `LSF_SERVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitMethod {
    /// In-process client library
    Library,
    /// bsub/bjobs/bkill/bhist on this host
    LocalShell,
    /// The same tools run on `server` through the remote shell
    RemoteShell { server: String },
}

impl SubmitMethod {
    /// Unset or `NULL` picks the library when one is available, `LOCAL`
    /// (any case) the local tools, anything else is a login server.
    pub fn select(server: Option<&str>, library_available: bool) -> Self {
        match server.map(str::trim) {
            None | Some("") | Some("NULL") => {
                if library_available {
                    Self::Library
                } else {
                    Self::LocalShell
                }
            }
            Some(s) if s.eq_ignore_ascii_case("local") => Self::LocalShell,
            Some(s) => Self::RemoteShell {
                server: s.to_string(),
            },
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteShell { .. })
    }

    /// Build the command running `tool args...`, or `None` for the library.
    ///
    /// Remote invocations pass the whole tool command line as one argument to
    /// the remote shell.
    pub fn shell_command(&self, rsh_cmd: &str, tool: &str, args: &[String]) -> Option<Command> {
        match self {
            Self::Library => None,
            Self::LocalShell => {
                let mut cmd = Command::new(tool);
                cmd.args(args);
                Some(cmd)
            }
            Self::RemoteShell { server } => {
                let mut line = tool.to_string();
                for arg in args {
                    line.push(' ');
                    line.push_str(arg);
                }
                let mut cmd = Command::new(rsh_cmd);
                cmd.arg(server).arg(line);
                Some(cmd)
            }
        }
    }
}

/// What the client library reports about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsbJobInfo {
    pub state: LsfState,
    pub exec_hosts: Vec<String>,
}

/// Binding to the LSF batch library.
///
/// Sites with the library linked in supply an implementation through
/// [`crate::LsfDriver::with_library`].
#[async_trait]
pub trait LsbApi: Send + Sync {
    /// Submit and return the job id, or the library's error message.
    async fn submit(&self, request: &BsubRequest) -> Result<u64, String>;

    /// `None` when the library has no record of the job.
    async fn job_info(&self, job_id: u64) -> Option<LsbJobInfo>;

    async fn kill(&self, job_id: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_method() {
        assert_eq!(SubmitMethod::select(None, false), SubmitMethod::LocalShell);
        assert_eq!(SubmitMethod::select(None, true), SubmitMethod::Library);
        assert_eq!(SubmitMethod::select(Some("NULL"), true), SubmitMethod::Library);
        assert_eq!(SubmitMethod::select(Some("NULL"), false), SubmitMethod::LocalShell);
        assert_eq!(SubmitMethod::select(Some("local"), true), SubmitMethod::LocalShell);
        assert_eq!(SubmitMethod::select(Some("LOCAL"), false), SubmitMethod::LocalShell);
        assert_eq!(
            SubmitMethod::select(Some("be-grid01"), true),
            SubmitMethod::RemoteShell {
                server: "be-grid01".to_string()
            }
        );
    }

    #[test]
    fn test_remote_command_line() {
        let method = SubmitMethod::RemoteShell {
            server: "login1".to_string(),
        };
        let cmd = method
            .shell_command("/usr/bin/ssh", "bjobs", &["-a".to_string()])
            .unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "/usr/bin/ssh");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["login1", "bjobs -a"]);

        assert!(SubmitMethod::Library
            .shell_command("/usr/bin/ssh", "bjobs", &[])
            .is_none());
    }
}
