//! Scan job document and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet admitted to a worker slot.
    Pending,
    /// Worker container is starting up.
    Launching,
    /// Worker reported ready; scan in progress.
    Running,
    /// Scan finished with results.
    Completed,
    /// Scan failed; `error` carries the reason.
    Failed,
    /// Worker was stopped on request before finishing.
    Cancelled,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Launching)
                | (Launching, Running)
                // Any non-terminal state can fail or be cancelled
                | (Pending, Failed)
                | (Launching, Failed)
                | (Running, Failed)
                | (Pending, Cancelled)
                | (Launching, Cancelled)
                | (Running, Cancelled)
                // Success only out of Running
                | (Running, Completed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is still live (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Where a job originated. External-platform jobs are mirrored by the bridge
/// on terminal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Native,
    ExternalPlatform,
}

/// Scan intensity level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanLevel {
    /// Crawl + passive analysis only.
    #[default]
    Light,
    /// Adds an active vulnerability scan.
    Deep,
    /// Full active scan, no duration cap on the scanner side.
    Aggressive,
}

impl ScanLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Deep => "deep",
            Self::Aggressive => "aggressive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Some(Self::Light),
            "deep" => Some(Self::Deep),
            "aggressive" => Some(Self::Aggressive),
            _ => None,
        }
    }

    /// Scanner threads per host.
    pub fn thread_count(&self) -> u32 {
        match self {
            Self::Light => 2,
            Self::Deep => 5,
            Self::Aggressive => 10,
        }
    }

    /// Scanner-side active scan cap in minutes. 0 = unlimited.
    pub fn max_scan_duration_mins(&self) -> u32 {
        match self {
            Self::Light => 10,
            Self::Deep => 30,
            Self::Aggressive => 0,
        }
    }

    /// Crawl width: maximum child pages discovered per node.
    pub fn max_crawl_children(&self) -> u32 {
        match self {
            Self::Light => 10,
            Self::Deep => 50,
            Self::Aggressive => 100,
        }
    }
}

/// Configuration for one scan job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Target URL to scan.
    pub target: String,
    /// Scan intensity.
    #[serde(default)]
    pub level: ScanLevel,
    /// Optional scope restriction (regex understood by the scanner).
    #[serde(default)]
    pub scope: Option<String>,
    /// Hard job deadline in seconds. 0 means use the orchestrator default.
    #[serde(default)]
    pub max_duration_secs: u64,
}

impl ScanConfig {
    pub fn new(target: impl Into<String>, level: ScanLevel) -> Self {
        Self {
            target: target.into(),
            level,
            scope: None,
            max_duration_secs: 0,
        }
    }
}

/// Real-time progress of a running job. Written only by the worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Short free-form phase label ("queued", "ready", "crawling", "scanning", ...).
    pub phase: String,
    /// Overall completion, 0..=100.
    pub percent: u8,
    /// Human-readable status line.
    pub message: String,
    /// When this progress was reported.
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    pub fn new(phase: impl Into<String>, percent: u8, message: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            percent: percent.min(100),
            message: message.into(),
            updated_at: Utc::now(),
        }
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::new("queued", 0, "")
    }
}

/// Severity summary of a completed scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub informational: u32,
    /// 100 = clean, 0 = critical.
    pub score: u32,
}

/// A single finding reported by the scanner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanAlert {
    pub name: String,
    /// High, Medium, Low, or Informational.
    pub severity: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub solution: String,
    #[serde(default)]
    pub confidence: String,
    #[serde(default)]
    pub cwe_id: String,
}

/// Terminal success payload. Present only when status is Completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub summary: ScanSummary,
    pub alerts: Vec<ScanAlert>,
    /// Pointer to the full report artifact, if one was produced.
    #[serde(default)]
    pub report_ref: Option<String>,
}

/// Classified cause of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Worker never reported ready within the startup window.
    StartupTimeout,
    /// Worker process exited non-zero.
    WorkerCrashed,
    /// Worker exited zero without recording a terminal state.
    ProtocolViolation,
    /// Job exceeded its maximum duration.
    ScanTimeout,
    /// Worker could not be launched or admitted.
    DispatchFailed,
    /// Unrecoverable error reported by the scanner tool.
    ScannerError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StartupTimeout => "startup_timeout",
            Self::WorkerCrashed => "worker_crashed",
            Self::ProtocolViolation => "protocol_violation",
            Self::ScanTimeout => "scan_timeout",
            Self::DispatchFailed => "dispatch_failed",
            Self::ScannerError => "scanner_error",
        };
        write!(f, "{s}")
    }
}

/// Terminal failure payload. Present only when status is Failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Full scan job document as persisted in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    /// Unique job ID, immutable after creation.
    pub id: Uuid,
    /// Requesting principal/tenant. Opaque to the core.
    pub owner_ref: String,
    /// Origin determines whether bridge sync runs on completion.
    pub origin: JobOrigin,
    /// Scan configuration.
    pub config: ScanConfig,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Real-time progress.
    pub progress: JobProgress,
    /// Present only when Completed.
    pub result: Option<ScanResult>,
    /// Present only when Failed.
    pub error: Option<JobFailure>,
    /// Set by the control surface, observed by the dispatcher. Never cleared.
    pub cancel_requested: bool,
    /// Runtime handle id of the worker (container id), once dispatched.
    pub worker_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanJob {
    /// Create a fresh Pending job document.
    pub fn new(config: ScanConfig, owner_ref: impl Into<String>, origin: JobOrigin) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_ref: owner_ref.into(),
            origin,
            config,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            result: None,
            error: None,
            cancel_requested: false,
            worker_ref: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Launching));
        assert!(JobStatus::Launching.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Launching.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Launching.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Launching.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_display_and_serde_agree() {
        let status = JobStatus::Launching;
        assert_eq!(status.to_string(), "launching");
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"launching\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn scan_level_parse() {
        assert_eq!(ScanLevel::parse("light"), Some(ScanLevel::Light));
        assert_eq!(ScanLevel::parse("DEEP"), Some(ScanLevel::Deep));
        assert_eq!(ScanLevel::parse("nope"), None);
    }

    #[test]
    fn scan_level_tuning_widens_with_depth() {
        assert_eq!(ScanLevel::Light.thread_count(), 2);
        assert_eq!(ScanLevel::Aggressive.max_scan_duration_mins(), 0);
        assert!(ScanLevel::Deep.max_crawl_children() > ScanLevel::Light.max_crawl_children());
    }

    #[test]
    fn progress_percent_clamped() {
        let p = JobProgress::new("scanning", 150, "over");
        assert_eq!(p.percent, 100);
    }

    #[test]
    fn new_job_is_pending_with_no_terminal_fields() {
        let job = ScanJob::new(
            ScanConfig::new("https://example.com", ScanLevel::Light),
            "tenant-1",
            JobOrigin::Native,
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(!job.cancel_requested);
    }

    #[test]
    fn job_serde_roundtrip() {
        let mut job = ScanJob::new(
            ScanConfig::new("https://example.com", ScanLevel::Deep),
            "tenant-1",
            JobOrigin::ExternalPlatform,
        );
        job.result = Some(ScanResult {
            summary: ScanSummary {
                high: 1,
                medium: 2,
                low: 3,
                informational: 4,
                score: 72,
            },
            alerts: vec![ScanAlert {
                name: "X-Frame-Options missing".into(),
                severity: "Medium".into(),
                ..Default::default()
            }],
            report_ref: None,
        });

        let json = serde_json::to_string(&job).unwrap();
        let parsed: ScanJob = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.origin, JobOrigin::ExternalPlatform);
        assert_eq!(parsed.result, job.result);
    }
}
