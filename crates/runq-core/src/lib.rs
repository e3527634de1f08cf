//! Driver contract for runq.
//!
//! Job specifications, handles, statuses and the `Driver` trait shared by
//! every scheduler backend.

pub mod driver;
pub mod queue_driver;
pub mod record;
pub mod spec;

pub use driver::{Driver, DriverStatus, HandleAllocator, JobHandle, SubmitError};
pub use queue_driver::{QueueDriver, MAX_RUNNING};
pub use record::{JobRecord, RecordError};
pub use spec::JobSpec;
