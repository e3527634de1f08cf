//! Shared parsing utilities for scheduler command output.
//!
//! This crate provides the process runner and the small text helpers used
//! by runq-lsf, runq-torque and runq-rsh to reduce code duplication.

pub mod command;

pub use command::{
    run_command, run_command_allow_failure, run_command_listing, run_command_merged, CommandError,
};

/// Filter helper for optional string fields.
/// Returns None if the string is empty or a placeholder value.
pub fn non_empty_string(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed == "N/A" || trimmed == "Unknown" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split a whitespace-delimited line and validate field count.
pub fn split_fields(line: &str, min_fields: usize) -> Result<Vec<&str>, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < min_fields {
        return Err(format!(
            "Expected {} fields, got {}: {}",
            min_fields,
            fields.len(),
            line
        ));
    }
    Ok(fields)
}

/// Parse a boolean option value.
///
/// Accepts `1/0`, `true/false`, `t/f`, `yes/no`, `y/n` and `on/off`,
/// case-insensitively.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse the integer found before the first `delimiter` in `text`.
///
/// `"12345.master\n"` with `'.'` gives 12345. Text without the delimiter
/// is parsed whole.
pub fn parse_int_upto(text: &str, delimiter: char) -> Option<u64> {
    let head = match text.find(delimiter) {
        Some(pos) => &text[..pos],
        None => text,
    };
    head.trim().parse().ok()
}

/// Split a list of host names separated by commas and/or whitespace.
pub fn split_host_list(s: &str) -> Vec<String> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}
