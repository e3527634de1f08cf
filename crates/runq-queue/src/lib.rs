//! Job queue for runq.
//!
//! Tracks every job through its state machine and keeps a driver busy:
//! polling submitted jobs, resubmitting failures and admitting waiting jobs
//! up to the running cap.

pub mod node;
pub mod queue;

pub use node::{Callbacks, JobCallback, JobNode, JobState};
pub use queue::{JobQueue, QueueConfig, QueueError, QueueSummary};
