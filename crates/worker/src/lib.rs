//! Robot agent that pulls jobs straight from the shared queue.
//!
//! [`agent::RobotAgent`] owns one [`fleet_core::queue::JobQueue`] consumer
//! and one [`fleet_core::executor::WorkflowExecutor`]. It runs a poll loop
//! and a lease heartbeat loop until stopped, and relies on the queue's
//! visibility timeout to recover from crashes.

pub mod agent;
pub mod config;
pub mod events;
