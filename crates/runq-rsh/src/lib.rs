//! Remote-shell fan-out driver for runq.
//!
//! Spreads jobs over a fixed list of hosts, each with its own cap on
//! concurrent jobs, and runs them through `ssh` (or any command taking
//! `host program args...`).

pub mod driver;
pub mod host;

pub use driver::{RshDriver, RSH_CLEAR_HOSTLIST, RSH_CMD, RSH_HOST, RSH_HOSTLIST};
pub use host::{parse_host_spec, HostError, RshHost, SlotGuard};
