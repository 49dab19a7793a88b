//! Scan job model and manager.
//!
//! - `model` — job document, status state machine, progress/result shapes
//! - `manager` — the single validator of state transitions over the job store

pub mod manager;
pub mod model;

pub use manager::JobManager;
pub use model::{
    FailureKind, JobFailure, JobOrigin, JobProgress, JobStatus, ScanAlert, ScanConfig, ScanJob,
    ScanLevel, ScanResult, ScanSummary,
};
