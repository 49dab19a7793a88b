//! Worker agent configuration, injected by the dispatcher through the
//! container environment.

use std::time::Duration;

use secrecy::SecretString;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::job::model::ScanLevel;

#[derive(Debug)]
pub struct AgentConfig {
    /// The job this worker was launched for.
    pub job_id: Uuid,
    pub target: String,
    pub level: ScanLevel,
    pub scope: Option<String>,
    /// Job store path, shared with the orchestrator.
    pub db_path: String,
    pub scanner_base_url: String,
    pub scanner_api_key: SecretString,
    /// Readiness probe budget for the scanner daemon.
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    /// Progress poll cadence during crawl/scan phases.
    pub poll_interval: Duration,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_id = required(&get, "SCANFORGE_JOB_ID")?;
        let job_id = raw_id.parse().map_err(|_| ConfigError::InvalidValue {
            key: "SCANFORGE_JOB_ID".to_string(),
            message: format!("not a UUID: {raw_id}"),
        })?;

        let level = match get("SCANFORGE_SCAN_LEVEL") {
            Some(raw) => ScanLevel::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "SCANFORGE_SCAN_LEVEL".to_string(),
                message: format!("unknown scan level: {raw}"),
            })?,
            None => ScanLevel::default(),
        };

        Ok(Self {
            job_id,
            target: required(&get, "SCANFORGE_TARGET_URL")?,
            level,
            scope: get("SCANFORGE_SCAN_SCOPE"),
            db_path: required(&get, "SCANFORGE_DB_PATH")?,
            scanner_base_url: get("SCANNER_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8090".to_string()),
            scanner_api_key: SecretString::from(
                get("SCANNER_API_KEY").unwrap_or_default(),
            ),
            ready_attempts: parse_or(&get, "SCANNER_READY_ATTEMPTS", 30)?,
            ready_interval: Duration::from_secs(parse_or(&get, "SCANNER_READY_INTERVAL_SECS", 2)?),
            poll_interval: Duration::from_secs(parse_or(&get, "SCANFORGE_POLL_INTERVAL_SECS", 2)?),
        })
    }
}

fn required(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    get(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse: {raw}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn build(pairs: &[(&str, &str)]) -> Result<AgentConfig, ConfigError> {
        let vars = env(pairs);
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn minimal_environment_with_defaults() {
        let config = build(&[
            ("SCANFORGE_JOB_ID", "7b07c24d-01e1-4b8a-9137-0fc50e3a2a87"),
            ("SCANFORGE_TARGET_URL", "https://example.com"),
            ("SCANFORGE_DB_PATH", "/data/scanforge.db"),
        ])
        .unwrap();

        assert_eq!(config.level, ScanLevel::Light);
        assert_eq!(config.ready_attempts, 30);
        assert_eq!(config.ready_interval, Duration::from_secs(2));
        assert_eq!(config.scanner_base_url, "http://127.0.0.1:8090");
        assert!(config.scope.is_none());
    }

    #[test]
    fn missing_job_id_is_rejected() {
        let err = build(&[
            ("SCANFORGE_TARGET_URL", "https://example.com"),
            ("SCANFORGE_DB_PATH", "/data/scanforge.db"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "SCANFORGE_JOB_ID"));
    }

    #[test]
    fn malformed_job_id_is_rejected() {
        let err = build(&[
            ("SCANFORGE_JOB_ID", "not-a-uuid"),
            ("SCANFORGE_TARGET_URL", "https://example.com"),
            ("SCANFORGE_DB_PATH", "/data/scanforge.db"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn level_and_scope_are_honoured() {
        let config = build(&[
            ("SCANFORGE_JOB_ID", "7b07c24d-01e1-4b8a-9137-0fc50e3a2a87"),
            ("SCANFORGE_TARGET_URL", "https://example.com"),
            ("SCANFORGE_DB_PATH", "/data/scanforge.db"),
            ("SCANFORGE_SCAN_LEVEL", "deep"),
            ("SCANFORGE_SCAN_SCOPE", "https://example.com/.*"),
        ])
        .unwrap();

        assert_eq!(config.level, ScanLevel::Deep);
        assert_eq!(config.scope.as_deref(), Some("https://example.com/.*"));
    }

    #[test]
    fn unknown_level_is_rejected() {
        let err = build(&[
            ("SCANFORGE_JOB_ID", "7b07c24d-01e1-4b8a-9137-0fc50e3a2a87"),
            ("SCANFORGE_TARGET_URL", "https://example.com"),
            ("SCANFORGE_DB_PATH", "/data/scanforge.db"),
            ("SCANFORGE_SCAN_LEVEL", "extreme"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
