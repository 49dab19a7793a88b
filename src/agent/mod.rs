//! In-container worker agent: configuration and the scan run loop.

pub mod config;
pub mod runner;

pub use config::AgentConfig;
pub use runner::{AgentExit, ScanAgent, summarize};
