//! LSF integration for runq.
//!
//! Submit with bsub, track with bjobs and bhist, kill with bkill, either on
//! this host, on a login server through a remote shell, or through the LSF
//! client library.

pub mod bhist;
pub mod bjobs;
pub mod bsub;
pub mod driver;
pub mod options;
pub mod resource;
pub mod transport;
pub mod types;

pub use bsub::BsubRequest;
pub use driver::{LsfDriver, LSF_INFO_FILE};
pub use options::LsfOptions;
pub use resource::{compose_resource, ResourceError};
pub use transport::{LsbApi, LsbJobInfo, SubmitMethod};
pub use types::LsfState;
