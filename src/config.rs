//! Configuration types.

use std::time::Duration;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global ceiling on simultaneously running workers.
    pub max_concurrent: usize,
    /// Admission queue capacity is `max_concurrent * queue_factor`.
    pub queue_factor: usize,
    /// How long a worker may take to report ready before it is torn down.
    pub startup_window: Duration,
    /// Poll cadence while waiting for worker readiness.
    pub ready_poll_interval: Duration,
    /// Poll cadence for cancel-flag and deadline checks during supervision.
    pub supervise_poll_interval: Duration,
    /// Grace period between a stop signal and a forced kill.
    pub grace_period: Duration,
    /// Hard job deadline applied when the scan config does not set one.
    pub default_max_duration: Duration,
    /// Sweep cadence of the store intake loop picking up Pending jobs.
    pub intake_interval: Duration,
    /// Container image for scan workers.
    pub worker_image: String,
    /// Path of the local job store database.
    pub db_path: String,
    /// External platform upsert endpoint. Bridge sync is disabled when unset.
    pub bridge_endpoint: Option<String>,
    /// Retry budget for bridge sync.
    pub bridge_max_attempts: u32,
    /// Base delay for bridge backoff (doubles per attempt, with jitter).
    pub bridge_base_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            queue_factor: 2,
            startup_window: Duration::from_secs(60),
            ready_poll_interval: Duration::from_secs(2),
            supervise_poll_interval: Duration::from_secs(3),
            grace_period: Duration::from_secs(10),
            default_max_duration: Duration::from_secs(3600), // 1 hour
            intake_interval: Duration::from_secs(2),
            worker_image: "scanforge/scan-worker:latest".to_string(),
            db_path: "./data/scanforge.db".to_string(),
            bridge_endpoint: None,
            bridge_max_attempts: 5,
            bridge_base_delay: Duration::from_millis(500),
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_concurrent: env_parse("SCANFORGE_MAX_CONCURRENT", defaults.max_concurrent),
            queue_factor: env_parse("SCANFORGE_QUEUE_FACTOR", defaults.queue_factor),
            startup_window: env_secs("SCANFORGE_STARTUP_WINDOW_SECS", defaults.startup_window),
            ready_poll_interval: defaults.ready_poll_interval,
            supervise_poll_interval: defaults.supervise_poll_interval,
            grace_period: env_secs("SCANFORGE_GRACE_PERIOD_SECS", defaults.grace_period),
            default_max_duration: env_secs(
                "SCANFORGE_MAX_DURATION_SECS",
                defaults.default_max_duration,
            ),
            intake_interval: env_secs("SCANFORGE_INTAKE_INTERVAL_SECS", defaults.intake_interval),
            worker_image: std::env::var("SCANFORGE_WORKER_IMAGE")
                .unwrap_or(defaults.worker_image),
            db_path: std::env::var("SCANFORGE_DB_PATH").unwrap_or(defaults.db_path),
            bridge_endpoint: std::env::var("SCANFORGE_BRIDGE_ENDPOINT").ok(),
            bridge_max_attempts: env_parse(
                "SCANFORGE_BRIDGE_MAX_ATTEMPTS",
                defaults.bridge_max_attempts,
            ),
            bridge_base_delay: defaults.bridge_base_delay,
        }
    }

    /// Admission queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.max_concurrent * self.queue_factor
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
