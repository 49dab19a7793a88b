//! scanforge — scan job orchestration and worker dispatch.
//!
//! Tracks security scans as durable jobs, runs each one in an ephemeral
//! container supervised by a dispatcher with a global concurrency ceiling,
//! and mirrors externally-originated jobs back to their platform of record.

pub mod agent;
pub mod bridge;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod intake;
pub mod job;
pub mod scanner;
pub mod store;

pub use error::{Error, Result};
