//! Worker agent — drives the scanner daemon through one scan job.
//!
//! The agent owns the scan protocol: probe the daemon, stamp readiness in the
//! job record, wait for the orchestrator's go-ahead, then crawl, analyse, and
//! (for deeper levels) actively scan, reporting progress as it goes. Terminal
//! writes go through the job manager like everyone else's; on cancellation
//! the agent stops quietly and leaves the verdict to the dispatcher.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::agent::config::AgentConfig;
use crate::error::JobError;
use crate::job::manager::JobManager;
use crate::job::model::{
    FailureKind, JobFailure, JobProgress, JobStatus, ScanAlert, ScanLevel, ScanResult, ScanSummary,
};
use crate::scanner::ScannerClient;

/// Crawl covers the first half of the progress bar, active scan the second.
const CRAWL_DONE_PERCENT: u8 = 50;

/// Handshake budget: how long to keep trying to meet the orchestrator before
/// giving up and letting its startup window expire.
const HANDSHAKE_ATTEMPTS: u32 = 120;
const HANDSHAKE_INTERVAL: Duration = Duration::from_millis(500);

/// Scanner context name used when a job carries a scope restriction.
const SCOPE_CONTEXT: &str = "scanforge";

/// Final disposition of one agent run, mirrored into the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Scan finished and the result is recorded.
    Completed,
    /// Scan failed; the failure is recorded where possible.
    Failed,
    /// Stopped on cancellation or a vanished orchestrator; no terminal write.
    Interrupted,
}

impl AgentExit {
    pub fn code(&self) -> i32 {
        match self {
            Self::Completed | Self::Interrupted => 0,
            Self::Failed => 1,
        }
    }
}

/// Why a run stopped short of completion.
enum Abort {
    Scanner(crate::error::ScannerError),
    /// Cancel requested, job went terminal under us, or the orchestrator
    /// never promoted the job.
    Cancelled,
    /// Job store unreachable; nothing can be recorded.
    Job(JobError),
}

pub struct ScanAgent {
    config: AgentConfig,
    manager: JobManager,
    scanner: ScannerClient,
}

impl ScanAgent {
    pub fn new(config: AgentConfig, manager: JobManager, scanner: ScannerClient) -> Self {
        Self {
            config,
            manager,
            scanner,
        }
    }

    pub async fn run(&self) -> AgentExit {
        let job_id = self.config.job_id;
        let exit = match self.execute().await {
            Ok(()) => {
                info!(job_id = %job_id, "Scan complete");
                AgentExit::Completed
            }
            Err(Abort::Cancelled) => {
                info!(job_id = %job_id, "Stopping on cancellation");
                AgentExit::Interrupted
            }
            Err(Abort::Scanner(e)) => {
                error!(job_id = %job_id, error = %e, "Scanner error");
                let failure = JobFailure::new(FailureKind::ScannerError, e.to_string());
                match self.manager.fail(job_id, failure).await {
                    Ok(()) | Err(JobError::InvalidTransition { .. }) => {}
                    Err(e) => error!(job_id = %job_id, error = %e, "Could not record failure"),
                }
                AgentExit::Failed
            }
            Err(Abort::Job(e)) => {
                // With the store down there is no record to update; a non-zero
                // exit lets the dispatcher classify the job.
                error!(job_id = %job_id, error = %e, "Job store unreachable");
                AgentExit::Failed
            }
        };

        self.scanner.shutdown().await;
        exit
    }

    /// Best-effort scanner teardown for an external stop signal that aborts
    /// `run` mid-flight.
    pub async fn stop(&self) {
        self.scanner.shutdown().await;
    }

    async fn execute(&self) -> Result<(), Abort> {
        let target = &self.config.target;
        let level = self.config.level;

        self.scanner
            .wait_until_ready(self.config.ready_attempts, self.config.ready_interval)
            .await
            .map_err(Abort::Scanner)?;

        self.signal_ready().await?;
        self.await_running().await?;

        self.scanner.configure_level(level).await;
        let scoped = match &self.config.scope {
            Some(regex) => {
                self.scanner
                    .define_scope(SCOPE_CONTEXT, regex)
                    .await
                    .map_err(Abort::Scanner)?;
                true
            }
            None => false,
        };

        // Crawl.
        let spider_id = self
            .scanner
            .start_spider(target, level, scoped.then_some(SCOPE_CONTEXT))
            .await
            .map_err(Abort::Scanner)?;
        info!(job_id = %self.config.job_id, spider_id = %spider_id, "Crawl started");
        loop {
            let percent = self
                .scanner
                .spider_progress(&spider_id)
                .await
                .map_err(Abort::Scanner)?;
            self.report_progress(
                "crawling",
                crawl_percent(percent),
                format!("Crawling target ({percent}%)"),
            )
            .await?;
            if percent >= 100 {
                break;
            }
            self.pause().await?;
        }

        // Let the passive analyser drain its backlog.
        loop {
            let backlog = self.scanner.passive_backlog().await.map_err(Abort::Scanner)?;
            if backlog == 0 {
                break;
            }
            self.report_progress(
                "analyzing",
                CRAWL_DONE_PERCENT,
                format!("{backlog} records awaiting passive analysis"),
            )
            .await?;
            self.pause().await?;
        }

        // Active scan for the deeper levels.
        if level != ScanLevel::Light {
            let scan_id = self
                .scanner
                .start_active_scan(target, scoped)
                .await
                .map_err(Abort::Scanner)?;
            info!(job_id = %self.config.job_id, scan_id = %scan_id, level = %self.config.level.as_str(), "Active scan started");
            loop {
                let percent = self
                    .scanner
                    .active_scan_progress(&scan_id)
                    .await
                    .map_err(Abort::Scanner)?;
                self.report_progress(
                    "scanning",
                    scan_percent(percent),
                    format!("Active scan ({percent}%)"),
                )
                .await?;
                if percent >= 100 {
                    break;
                }
                self.pause().await?;
            }
        }

        let alerts = self.scanner.alerts(target).await.map_err(Abort::Scanner)?;
        let summary = summarize(&alerts);
        info!(
            job_id = %self.config.job_id,
            high = summary.high,
            medium = summary.medium,
            low = summary.low,
            score = summary.score,
            "Findings collected"
        );

        self.manager
            .complete(
                self.config.job_id,
                ScanResult {
                    summary,
                    alerts,
                    report_ref: None,
                },
            )
            .await
            .map_err(Abort::Job)?;
        Ok(())
    }

    /// Stamp the ready marker. The dispatcher may still be moving the job to
    /// Launching, so a rejected stamp is retried; if the orchestrator never
    /// shows up, its startup window will expire the job without us.
    async fn signal_ready(&self) -> Result<(), Abort> {
        for _ in 0..HANDSHAKE_ATTEMPTS {
            match self.manager.signal_ready(self.config.job_id).await {
                Ok(()) => return Ok(()),
                Err(JobError::InvalidTransition { .. }) => {
                    let job = self
                        .manager
                        .get(self.config.job_id)
                        .await
                        .map_err(Abort::Job)?;
                    if job.status == JobStatus::Running {
                        return Ok(());
                    }
                    if job.status.is_terminal() || job.cancel_requested {
                        return Err(Abort::Cancelled);
                    }
                    tokio::time::sleep(HANDSHAKE_INTERVAL).await;
                }
                Err(e) => return Err(Abort::Job(e)),
            }
        }
        warn!(job_id = %self.config.job_id, "Gave up waiting to signal readiness");
        Err(Abort::Cancelled)
    }

    async fn await_running(&self) -> Result<(), Abort> {
        for _ in 0..HANDSHAKE_ATTEMPTS {
            let job = self
                .manager
                .get(self.config.job_id)
                .await
                .map_err(Abort::Job)?;
            if job.status == JobStatus::Running {
                return Ok(());
            }
            if job.status.is_terminal() || job.cancel_requested {
                return Err(Abort::Cancelled);
            }
            tokio::time::sleep(HANDSHAKE_INTERVAL).await;
        }
        warn!(job_id = %self.config.job_id, "Orchestrator never promoted the job");
        Err(Abort::Cancelled)
    }

    async fn report_progress(
        &self,
        phase: &str,
        percent: u8,
        message: String,
    ) -> Result<(), Abort> {
        self.manager
            .update_progress(self.config.job_id, JobProgress::new(phase, percent, message))
            .await
            .map_err(|e| match e {
                // The job left Running under us: cancelled or expired.
                JobError::InvalidTransition { .. } => Abort::Cancelled,
                other => Abort::Job(other),
            })
    }

    async fn pause(&self) -> Result<(), Abort> {
        tokio::time::sleep(self.config.poll_interval).await;
        let job = self
            .manager
            .get(self.config.job_id)
            .await
            .map_err(Abort::Job)?;
        if job.cancel_requested || job.status.is_terminal() {
            return Err(Abort::Cancelled);
        }
        Ok(())
    }
}

fn crawl_percent(spider_percent: u8) -> u8 {
    spider_percent.min(100) / 2
}

fn scan_percent(active_percent: u8) -> u8 {
    CRAWL_DONE_PERCENT + active_percent.min(100) / 2
}

/// Count findings by severity and derive the site score: start from 100 and
/// deduct 10 per high, 5 per medium, 2 per low, and 0.5 per informational
/// finding, floored at 0.
pub fn summarize(alerts: &[ScanAlert]) -> ScanSummary {
    let mut summary = ScanSummary::default();
    for alert in alerts {
        match alert.severity.to_ascii_lowercase().as_str() {
            "high" => summary.high += 1,
            "medium" => summary.medium += 1,
            "low" => summary.low += 1,
            _ => summary.informational += 1,
        }
    }

    let penalty = f64::from(summary.high) * 10.0
        + f64::from(summary.medium) * 5.0
        + f64::from(summary.low) * 2.0
        + f64::from(summary.informational) * 0.5;
    summary.score = (100.0 - penalty).max(0.0).round() as u32;
    summary
}
