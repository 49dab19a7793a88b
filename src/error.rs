//! Error types for scanforge.

use uuid::Uuid;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Scanner error: {0}")]
    Scanner(#[from] ScannerError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("Record {id} no longer in expected status {expected}")]
    Conflict { id: Uuid, expected: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job lifecycle errors surfaced by the manager.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid scan configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Job {id} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Store error for job {id}: {source}")]
    Store {
        id: Uuid,
        #[source]
        source: StoreError,
    },
}

/// Dispatcher admission and supervision errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Job {id} rejected, admission queue full ({queued} queued, {active} active of {max} slots)")]
    Backpressure {
        id: Uuid,
        active: usize,
        queued: usize,
        max: usize,
    },

    #[error("Job {id} is already dispatched")]
    AlreadyDispatched { id: Uuid },
}

/// Container/process runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to launch worker: {0}")]
    Launch(String),

    #[error("Failed to signal worker {handle}: {reason}")]
    Signal { handle: String, reason: String },

    #[error("Failed to wait on worker {handle}: {reason}")]
    Wait { handle: String, reason: String },

    #[error("Failed to remove worker {handle}: {reason}")]
    Remove { handle: String, reason: String },
}

/// Scanner daemon control errors (worker-agent side).
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("Scanner daemon not ready after {attempts} attempts")]
    NotReady { attempts: u32 },

    #[error("Scanner request {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Invalid scanner response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

/// Bridge sync errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Upsert failed for job {id}: {reason}")]
    UpsertFailed { id: Uuid, reason: String },

    #[error("Sync gave up for job {id} after {attempts} attempts")]
    RetriesExhausted { id: Uuid, attempts: u32 },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
