//! Parse bhist output.
//!
//! Finished jobs age out of bjobs; bhist keeps them much longer. It has no
//! status column, so the status is inferred from how the accumulated pending
//! and running times move between two samples.

use crate::types::LsfState;

/// Accumulated times from one bhist sample, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BhistSample {
    pub pend: u64,
    pub psusp: u64,
    pub run: u64,
}

/// Parse `bhist <id>` output.
///
/// Two header lines are skipped; the next line is
/// `JOBID USER JOB_NAME PEND PSUSP RUN ...`.
pub fn parse_bhist(output: &str) -> Option<BhistSample> {
    let line = output.lines().nth(2)?;
    let fields = runq_parsers::split_fields(line, 6).ok()?;
    Some(BhistSample {
        pend: fields[3].parse().ok()?,
        psusp: fields[4].parse().ok()?,
        run: fields[5].parse().ok()?,
    })
}

/// Infer a state from two samples taken some seconds apart.
///
/// Nothing moving means the job is finished; bhist cannot tell DONE from
/// EXIT, so it is reported as DONE.
pub fn classify(first: BhistSample, second: BhistSample) -> LsfState {
    if second.run > first.run {
        LsfState::Running
    } else if second.pend > first.pend {
        LsfState::Pending
    } else if second.run == first.run && second.pend == first.pend {
        LsfState::Done
    } else {
        LsfState::Unknown("bhist".to_string())
    }
}
