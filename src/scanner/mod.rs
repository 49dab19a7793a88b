//! Scanner daemon control API client.

pub mod client;

pub use client::{DaemonAlert, ScannerClient};
