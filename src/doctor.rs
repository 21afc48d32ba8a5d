//! Fleet-wide diagnostics: per-upstream health rolled into actionable
//! buckets, plus a docker-isolation probe when that feature is on.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::{HealthAction, HealthStatus, UpstreamView};

pub const DOCKER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamErrorEntry {
    pub server_name: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthRequiredEntry {
    pub server_name: String,
    pub summary: String,
    pub remediation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthIssueEntry {
    pub server_name: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_parameter: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissingSecretEntry {
    pub secret: String,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DockerStatus {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub timestamp: DateTime<Utc>,
    pub upstream_errors: Vec<UpstreamErrorEntry>,
    pub oauth_required: Vec<OAuthRequiredEntry>,
    pub oauth_issues: Vec<OAuthIssueEntry>,
    pub missing_secrets: Vec<MissingSecretEntry>,
    pub runtime_warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_status: Option<DockerStatus>,
    pub total_issues: usize,
}

/// Pull the parameter name out of a config-error detail like
/// `OAuth configuration for x requires 'client_id' parameter`.
pub fn extract_quoted_param(detail: &str) -> Option<String> {
    let start = detail.find('\'')?;
    let rest = &detail[start + 1..];
    let end = rest.find('\'')?;
    let param = &rest[..end];
    if param.is_empty() { None } else { Some(param.to_string()) }
}

/// Roll per-upstream health into the report buckets, keyed off each
/// server's computed action.
pub fn aggregate(entries: &[(UpstreamView, HealthStatus)]) -> DiagnosticsReport {
    let mut upstream_errors = Vec::new();
    let mut oauth_required = Vec::new();
    let mut oauth_issues = Vec::new();
    let mut secrets: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (view, health) in entries {
        match health.action {
            HealthAction::Restart => upstream_errors.push(UpstreamErrorEntry {
                server_name: view.name.clone(),
                detail: health.detail.clone(),
                error_time: view.error_time,
            }),
            HealthAction::Login => oauth_required.push(OAuthRequiredEntry {
                server_name: view.name.clone(),
                summary: health.summary.clone(),
                remediation: format!("Run: mcp-warden auth login --server={}", view.name),
            }),
            HealthAction::Configure => oauth_issues.push(OAuthIssueEntry {
                server_name: view.name.clone(),
                detail: health.detail.clone(),
                missing_parameter: extract_quoted_param(&health.detail),
            }),
            HealthAction::SetSecret => secrets
                .entry(health.detail.clone())
                .or_default()
                .push(view.name.clone()),
            _ => {
                // Compatibility path: an upstream may carry an error
                // without any computed action.
                if let Some(err) = view.last_error.as_deref().filter(|e| !e.is_empty()) {
                    upstream_errors.push(UpstreamErrorEntry {
                        server_name: view.name.clone(),
                        detail: err.to_string(),
                        error_time: view.error_time,
                    });
                }
            }
        }
    }

    let missing_secrets: Vec<MissingSecretEntry> = secrets
        .into_iter()
        .map(|(secret, servers)| MissingSecretEntry { secret, servers })
        .collect();

    let total_issues = upstream_errors.len()
        + oauth_required.len()
        + oauth_issues.len()
        + missing_secrets.len();

    DiagnosticsReport {
        timestamp: Utc::now(),
        upstream_errors,
        oauth_required,
        oauth_issues,
        missing_secrets,
        runtime_warnings: Vec::new(),
        docker_status: None,
        total_issues,
    }
}

/// `docker info --format "{{.ServerVersion}}"` with a short leash.
pub async fn docker_status() -> DockerStatus {
    let probe = tokio::process::Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .output();
    match tokio::time::timeout(DOCKER_PROBE_TIMEOUT, probe).await {
        Ok(Ok(out)) if out.status.success() => DockerStatus {
            available: true,
            version: Some(String::from_utf8_lossy(&out.stdout).trim().to_string()),
            error: None,
        },
        Ok(Ok(out)) => DockerStatus {
            available: false,
            version: None,
            error: Some(String::from_utf8_lossy(&out.stderr).trim().to_string()),
        },
        Ok(Err(e)) => DockerStatus {
            available: false,
            version: None,
            error: Some(e.to_string()),
        },
        Err(_) => DockerStatus {
            available: false,
            version: None,
            error: Some("docker probe timed out".into()),
        },
    }
}

pub async fn run_doctor(
    entries: &[(UpstreamView, HealthStatus)],
    include_docker: bool,
) -> DiagnosticsReport {
    let mut report = aggregate(entries);
    if include_docker {
        report.docker_status = Some(docker_status().await);
    }
    report
}
