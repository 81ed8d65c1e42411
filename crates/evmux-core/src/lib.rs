//! # evmux-core
//!
//! Leaf utilities shared by the evmux reactor crates:
//! - Leveled stderr logging with environment-variable configuration
//! - Microsecond wall-clock timestamps
//! - Cached kernel thread ids for loop-affinity checks
//!
//! Nothing in this crate depends on the reactor itself; it can be pulled in
//! by tooling and demo binaries on its own.

pub mod elog;
pub mod tid;
pub mod time;

pub use elog::LogLevel;
pub use tid::tid;
pub use time::Timestamp;
