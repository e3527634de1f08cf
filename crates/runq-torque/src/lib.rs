//! Torque/PBS integration for runq.
//!
//! Submit via qsub, query via qstat, kill via qdel.

pub mod driver;
pub mod qstat;
pub mod qsub;

pub use driver::TorqueDriver;
pub use qsub::QsubSettings;
