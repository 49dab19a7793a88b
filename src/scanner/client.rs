//! HTTP client for the scanner daemon's JSON control API.
//!
//! The daemon (a ZAP-compatible proxy scanner) exposes its controls as GET
//! endpoints under `/JSON/...` and reports numeric values as strings; the
//! parse helpers here normalise that quirk once.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ScannerError;
use crate::job::model::{ScanAlert, ScanLevel};

/// Header the daemon expects the API key in.
const API_KEY_HEADER: &str = "X-ZAP-API-Key";

/// A finding as the daemon reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonAlert {
    #[serde(default)]
    pub name: String,
    /// "High", "Medium", "Low", or "Informational".
    #[serde(default)]
    pub risk: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub solution: String,
    #[serde(default)]
    pub confidence: String,
    #[serde(default)]
    pub cweid: String,
}

impl From<DaemonAlert> for ScanAlert {
    fn from(alert: DaemonAlert) -> Self {
        ScanAlert {
            name: alert.name,
            severity: alert.risk,
            url: alert.url,
            description: alert.description,
            solution: alert.solution,
            confidence: alert.confidence,
            cwe_id: alert.cweid,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlertsResponse {
    #[serde(default)]
    alerts: Vec<DaemonAlert>,
}

/// Client for one scanner daemon instance.
pub struct ScannerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl ScannerClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self, ScannerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ScannerError::RequestFailed {
                endpoint: "client".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Poll the version endpoint until the daemon answers, up to `attempts`
    /// probes spaced `interval` apart.
    pub async fn wait_until_ready(
        &self,
        attempts: u32,
        interval: Duration,
    ) -> Result<(), ScannerError> {
        for attempt in 1..=attempts {
            match self.version().await {
                Ok(version) => {
                    debug!(version = %version, attempt, "Scanner daemon is up");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Scanner daemon not ready yet");
                    tokio::time::sleep(interval).await;
                }
            }
        }
        Err(ScannerError::NotReady { attempts })
    }

    pub async fn version(&self) -> Result<String, ScannerError> {
        let body = self.get("/JSON/core/view/version/", &[]).await?;
        string_field(&body, "version", "/JSON/core/view/version/")
    }

    /// Tune the active scanner for the scan level. Best effort: a daemon
    /// that rejects an option keeps its defaults.
    pub async fn configure_level(&self, level: ScanLevel) {
        let threads = level.thread_count().to_string();
        if let Err(e) = self
            .get(
                "/JSON/ascan/action/setOptionThreadPerHost/",
                &[("Integer", &threads)],
            )
            .await
        {
            debug!(error = %e, "Could not set thread count, using defaults");
        }

        let duration = level.max_scan_duration_mins().to_string();
        if let Err(e) = self
            .get(
                "/JSON/ascan/action/setOptionMaxScanDurationInMins/",
                &[("Integer", &duration)],
            )
            .await
        {
            debug!(error = %e, "Could not set scan duration, using defaults");
        }
    }

    /// Register a named scope context restricting the scan to URLs matching
    /// the regex.
    pub async fn define_scope(&self, context: &str, regex: &str) -> Result<(), ScannerError> {
        self.get(
            "/JSON/context/action/newContext/",
            &[("contextName", context)],
        )
        .await?;
        self.get(
            "/JSON/context/action/includeInContext/",
            &[("contextName", context), ("regex", regex)],
        )
        .await?;
        Ok(())
    }

    /// Kick off the crawler. Returns the crawl id used for progress polling.
    pub async fn start_spider(
        &self,
        target: &str,
        level: ScanLevel,
        context: Option<&str>,
    ) -> Result<String, ScannerError> {
        let max_children = level.max_crawl_children().to_string();
        let mut params = vec![
            ("url", target),
            ("maxChildren", max_children.as_str()),
            ("recurse", "true"),
            ("subtreeOnly", "true"),
        ];
        if let Some(context) = context {
            params.push(("contextName", context));
        }
        let body = self.get("/JSON/spider/action/scan/", &params).await?;
        string_field(&body, "scan", "/JSON/spider/action/scan/")
    }

    /// Crawl completion, 0..=100.
    pub async fn spider_progress(&self, scan_id: &str) -> Result<u8, ScannerError> {
        let body = self
            .get("/JSON/spider/view/status/", &[("scanId", scan_id)])
            .await?;
        percent_field(&body, "status", "/JSON/spider/view/status/")
    }

    /// Requests still queued for passive analysis. Zero means the passive
    /// scanner has caught up with the crawl.
    pub async fn passive_backlog(&self) -> Result<u64, ScannerError> {
        let endpoint = "/JSON/pscan/view/recordsToScan/";
        let body = self.get(endpoint, &[]).await?;
        let raw = string_field(&body, "recordsToScan", endpoint)?;
        raw.parse().map_err(|_| ScannerError::InvalidResponse {
            endpoint: endpoint.to_string(),
            reason: format!("recordsToScan is not a number: {raw}"),
        })
    }

    /// Kick off the active scan. Returns the scan id for progress polling.
    pub async fn start_active_scan(
        &self,
        target: &str,
        in_scope_only: bool,
    ) -> Result<String, ScannerError> {
        let mut params = vec![("url", target), ("recurse", "true")];
        if in_scope_only {
            params.push(("inScopeOnly", "true"));
        }
        let body = self.get("/JSON/ascan/action/scan/", &params).await?;
        string_field(&body, "scan", "/JSON/ascan/action/scan/")
    }

    /// Active scan completion, 0..=100.
    pub async fn active_scan_progress(&self, scan_id: &str) -> Result<u8, ScannerError> {
        let body = self
            .get("/JSON/ascan/view/status/", &[("scanId", scan_id)])
            .await?;
        percent_field(&body, "status", "/JSON/ascan/view/status/")
    }

    /// All findings recorded for the target.
    pub async fn alerts(&self, target: &str) -> Result<Vec<ScanAlert>, ScannerError> {
        let endpoint = "/JSON/core/view/alerts/";
        let body = self.get(endpoint, &[("baseurl", target)]).await?;
        let parsed: AlertsResponse =
            serde_json::from_value(body).map_err(|e| ScannerError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        Ok(parsed.alerts.into_iter().map(ScanAlert::from).collect())
    }

    /// Ask the daemon to exit. Errors are expected when it dies mid-reply.
    pub async fn shutdown(&self) {
        if let Err(e) = self.get("/JSON/core/action/shutdown/", &[]).await {
            // The daemon often drops the connection before answering.
            debug!(error = %e, "Scanner shutdown request did not complete");
        }
    }

    async fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value, ScannerError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .query(params)
            .send()
            .await
            .map_err(|e| ScannerError::RequestFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(endpoint, status = %status, "Scanner request rejected");
            return Err(ScannerError::RequestFailed {
                endpoint: endpoint.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ScannerError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }
}

fn string_field(body: &Value, field: &str, endpoint: &str) -> Result<String, ScannerError> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ScannerError::InvalidResponse {
            endpoint: endpoint.to_string(),
            reason: format!("missing field {field}"),
        })
}

/// The daemon reports percentages as strings ("42").
fn percent_field(body: &Value, field: &str, endpoint: &str) -> Result<u8, ScannerError> {
    let raw = string_field(body, field, endpoint)?;
    let value: u8 = raw.parse().map_err(|_| ScannerError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason: format!("{field} is not a percentage: {raw}"),
    })?;
    Ok(value.min(100))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn percent_field_parses_string_numbers() {
        let body = json!({"status": "42"});
        assert_eq!(percent_field(&body, "status", "/x").unwrap(), 42);
    }

    #[test]
    fn percent_field_clamps_over_100() {
        let body = json!({"status": "150"});
        assert_eq!(percent_field(&body, "status", "/x").unwrap(), 100);
    }

    #[test]
    fn percent_field_rejects_garbage() {
        let body = json!({"status": "soon"});
        assert!(matches!(
            percent_field(&body, "status", "/x"),
            Err(ScannerError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn string_field_missing_is_invalid_response() {
        let body = json!({"other": "1"});
        assert!(matches!(
            string_field(&body, "scan", "/x"),
            Err(ScannerError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn daemon_alert_maps_to_scan_alert() {
        let raw = json!({
            "name": "X-Content-Type-Options Header Missing",
            "risk": "Low",
            "url": "https://example.com/",
            "description": "The header was not set.",
            "solution": "Set the header.",
            "confidence": "Medium",
            "cweid": "693"
        });
        let daemon: DaemonAlert = serde_json::from_value(raw).unwrap();
        let alert = ScanAlert::from(daemon);
        assert_eq!(alert.severity, "Low");
        assert_eq!(alert.cwe_id, "693");
    }

    #[test]
    fn alerts_response_tolerates_missing_list() {
        let parsed: AlertsResponse = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.alerts.is_empty());
    }
}
