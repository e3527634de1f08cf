//! Parse bjobs output.

use crate::types::LsfState;
use std::collections::{HashMap, HashSet};

/// Parse the table printed by `bjobs -a`.
///
/// The header line is skipped and each remaining line contributes
/// `JOBID USER STAT`. Only ids in `owned` are kept, so old jobs belonging to
/// the same user never leak into the cache.
pub fn parse_bjobs_table(output: &str, owned: &HashSet<String>) -> HashMap<String, LsfState> {
    let mut states = HashMap::new();

    for line in output.lines().skip(1) {
        let Ok(fields) = runq_parsers::split_fields(line, 3) else {
            continue;
        };
        let Ok(job_id) = fields[0].parse::<u64>() else {
            continue;
        };
        let job_id = job_id.to_string();
        if owned.contains(&job_id) {
            states.insert(job_id, LsfState::parse(fields[2]));
        }
    }

    states
}

/// Parse the first line of `bjobs -noheader -o 'EXEC_HOST' <id>`.
///
/// Entries are separated by `:`; `N*host` means N slots on `host`.
pub fn parse_exec_hosts(output: &str) -> Vec<String> {
    let Some(line) = output.lines().next() else {
        return Vec::new();
    };

    line.split(':')
        .filter_map(|entry| {
            let entry = entry.trim();
            let host = match entry.split_once('*') {
                Some((_, host)) => host,
                None => entry,
            };
            runq_parsers::non_empty_string(host)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BJOBS_OUTPUT: &str = "\
JOBID   USER    STAT  QUEUE      FROM_HOST   EXEC_HOST   JOB_NAME   SUBMIT_TIME
101     alice   RUN   normal     login1      node7       real-0     Jan  9 10:21
102     alice   PEND  normal     login1                  real-1     Jan  9 10:21
103     alice   DONE  normal     login1      node8       real-2     Jan  9 10:21
99      alice   EXIT  normal     login1      node8       old-run    Jan  8 09:00
garbage
";

    fn owned(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_bjobs_table() {
        let states = parse_bjobs_table(BJOBS_OUTPUT, &owned(&["101", "102", "103"]));
        assert_eq!(states.len(), 3);
        assert_eq!(states["101"], LsfState::Running);
        assert_eq!(states["102"], LsfState::Pending);
        assert_eq!(states["103"], LsfState::Done);
        assert!(!states.contains_key("99"));
    }

    #[test]
    fn test_parse_bjobs_header_only() {
        let states = parse_bjobs_table("No job found\n", &owned(&["101"]));
        assert!(states.is_empty());
    }

    #[test]
    fn test_parse_exec_hosts() {
        assert_eq!(parse_exec_hosts("4*node7:2*node8\n"), vec!["node7", "node8"]);
        assert_eq!(parse_exec_hosts("node3\n"), vec!["node3"]);
        assert_eq!(parse_exec_hosts("-\n"), Vec::<String>::new());
        assert!(parse_exec_hosts("").is_empty());
    }
}
