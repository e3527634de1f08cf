//! Parse qstat output.

use runq_core::DriverStatus;

/// Find the status of `job_id` in `qstat <id>` output.
///
/// The matching line is the one whose first field, up to the first `.`,
/// equals the id. Column layouts differ between Torque and PBS versions, so
/// the state code is taken as the first single-letter alphabetic field after
/// the id, name and user columns; the queue name follows it and may itself be
/// a single letter. `None` when no such line exists.
pub fn parse_status(output: &str, job_id: &str) -> Option<DriverStatus> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let first = fields.first()?;
        let id = first.split('.').next()?;
        if id != job_id {
            return None;
        }

        let code = fields
            .iter()
            .skip(3)
            .find(|f| f.len() == 1 && f.chars().all(|c| c.is_ascii_alphabetic()))?;
        Some(state_code(code))
    })
}

/// R running; E exiting and C completed count as done; H held and Q queued
/// as pending.
pub fn state_code(code: &str) -> DriverStatus {
    match code {
        "R" => DriverStatus::Running,
        "E" | "C" => DriverStatus::Done,
        "H" | "Q" => DriverStatus::Pending,
        _ => DriverStatus::Unknown,
    }
}
