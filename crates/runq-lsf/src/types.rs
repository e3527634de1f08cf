//! LSF job states.

use runq_core::DriverStatus;
use std::fmt;

/// Job state as printed in the STAT column of bjobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LsfState {
    /// PEND - Job is pending
    Pending,
    /// RUN - Job is running
    Running,
    /// PSUSP - Job suspended by user while pending
    UserSuspendedPending,
    /// USUSP - Job suspended by user while running
    UserSuspended,
    /// SSUSP - Job suspended by system
    SystemSuspended,
    /// DONE - Job completed successfully
    Done,
    /// PDONE - Post-execution processing completed
    PostDone,
    /// EXIT - Job exited with non-zero status
    Exit,
    /// ZOMBI - Job is zombie (killed while the execution host was unreachable)
    Zombie,
    /// UNKWN or anything unrecognised
    Unknown(String),
}

impl LsfState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "PEND" => Self::Pending,
            "RUN" => Self::Running,
            "PSUSP" => Self::UserSuspendedPending,
            "USUSP" => Self::UserSuspended,
            "SSUSP" => Self::SystemSuspended,
            "DONE" => Self::Done,
            "PDONE" => Self::PostDone,
            "EXIT" => Self::Exit,
            "ZOMBI" => Self::Zombie,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Suspended jobs still hold their slot, so they count as running.
    pub fn driver_status(&self) -> DriverStatus {
        match self {
            Self::Pending => DriverStatus::Pending,
            Self::Running
            | Self::UserSuspendedPending
            | Self::UserSuspended
            | Self::SystemSuspended => DriverStatus::Running,
            Self::Done | Self::PostDone => DriverStatus::Done,
            Self::Exit | Self::Zombie => DriverStatus::Exited,
            Self::Unknown(_) => DriverStatus::Unknown,
        }
    }
}

impl fmt::Display for LsfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Pending => "PEND",
            Self::Running => "RUN",
            Self::UserSuspendedPending => "PSUSP",
            Self::UserSuspended => "USUSP",
            Self::SystemSuspended => "SSUSP",
            Self::Done => "DONE",
            Self::PostDone => "PDONE",
            Self::Exit => "EXIT",
            Self::Zombie => "ZOMBI",
            Self::Unknown(code) => code.as_str(),
        };
        f.write_str(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state() {
        assert_eq!(LsfState::parse("PEND"), LsfState::Pending);
        assert_eq!(LsfState::parse("run"), LsfState::Running);
        assert_eq!(LsfState::parse("PDONE"), LsfState::PostDone);
        assert_eq!(LsfState::parse("UNKWN"), LsfState::Unknown("UNKWN".to_string()));
    }

    #[test]
    fn test_driver_status_mapping() {
        let cases = [
            ("PEND", DriverStatus::Pending),
            ("RUN", DriverStatus::Running),
            ("SSUSP", DriverStatus::Running),
            ("USUSP", DriverStatus::Running),
            ("PSUSP", DriverStatus::Running),
            ("DONE", DriverStatus::Done),
            ("PDONE", DriverStatus::Done),
            ("EXIT", DriverStatus::Exited),
            ("ZOMBI", DriverStatus::Exited),
            ("UNKWN", DriverStatus::Unknown),
            ("WAIT", DriverStatus::Unknown),
        ];
        for (code, expected) in cases {
            assert_eq!(LsfState::parse(code).driver_status(), expected, "{}", code);
        }
    }
}
