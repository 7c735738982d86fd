//! Domain types and contracts shared by the robot fleet crates.
//!
//! Holds the job model and lease arithmetic, the queue and executor
//! contracts robots are written against, robot capability types, the
//! shared backoff helper, an in-memory queue backend, and the logging and
//! signal setup used by the binaries.

pub mod backoff;
pub mod capabilities;
pub mod env;
pub mod error;
pub mod executor;
pub mod job;
pub mod memory;
pub mod queue;
pub mod runtime;
pub mod status;
pub mod types;
