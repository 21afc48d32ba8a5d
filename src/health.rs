//! Health fusion: admin state, connection state, secret resolution and
//! OAuth state collapse into one `{level, action, summary, detail}` answer
//! an operator can act on. The calculator is a pure function of its input
//! and the single `now` it is handed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ConnectionState, OAuthStatus};
use crate::util::{contains_ci, truncate_summary};

pub const SUMMARY_MAX_CHARS: usize = 50;

/// Default lead time for the "token expiring soon" warning.
pub fn default_warning_window() -> Duration {
    Duration::hours(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    Enabled,
    Disabled,
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAction {
    None,
    Enable,
    Approve,
    Login,
    Restart,
    SetSecret,
    Configure,
    ViewLogs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub level: HealthLevel,
    pub admin_state: AdminState,
    pub summary: String,
    pub detail: String,
    pub action: HealthAction,
}

/// Typed point-in-time view of one upstream, assembled from the
/// supervisor snapshot, the token store and the refresh manager.
#[derive(Debug, Clone)]
pub struct UpstreamView {
    pub name: String,
    pub enabled: bool,
    pub quarantined: bool,
    pub missing_secret: Option<String>,
    pub oauth_config_error: Option<String>,
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub error_time: Option<DateTime<Utc>>,
    pub oauth_required: bool,
    pub oauth_status: Option<OAuthStatus>,
    pub user_logged_out: bool,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub has_refresh_token: bool,
    pub tool_count: usize,
    pub warning_window: Duration,
}

impl UpstreamView {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            quarantined: false,
            missing_secret: None,
            oauth_config_error: None,
            connection_state: ConnectionState::Idle,
            last_error: None,
            error_time: None,
            oauth_required: false,
            oauth_status: None,
            user_logged_out: false,
            token_expires_at: None,
            has_refresh_token: false,
            tool_count: 0,
            warning_window: default_warning_window(),
        }
    }
}

/// Ordered substring → user-facing phrase table. Specific entries come
/// before general ones: a DNS failure reads `dial tcp ...: no such host`,
/// and must map to "Host not found", not "Cannot connect".
pub const FRIENDLY_ERRORS: &[(&str, &str)] = &[
    ("no such host", "Host not found"),
    ("connection refused", "Connection refused"),
    ("connection reset", "Connection reset"),
    ("certificate", "TLS certificate error"),
    ("authentication failed", "Authentication failed"),
    ("unauthorized", "Authentication required"),
    ("forbidden", "Access denied"),
    ("oauth", "Authentication problem"),
    ("timeout", "Timed out"),
    ("eof", "Connection closed unexpectedly"),
    ("dial tcp", "Cannot connect"),
];

pub fn friendly_error(raw: &str) -> String {
    for (needle, phrase) in FRIENDLY_ERRORS {
        if contains_ci(raw, needle) {
            return (*phrase).to_string();
        }
    }
    truncate_summary(raw, SUMMARY_MAX_CHARS)
}

const OAUTH_ERROR_MARKERS: &[&str] = &[
    "oauth",
    "authentication required",
    "unauthorized",
    "login required",
    "token expired",
    "invalid_grant",
    "access_denied",
];

pub fn is_oauth_error(raw: &str) -> bool {
    OAUTH_ERROR_MARKERS.iter().any(|m| contains_ci(raw, m))
}

fn connected_summary(tool_count: usize) -> String {
    match tool_count {
        0 => "Connected".to_string(),
        1 => "Connected (1 tool)".to_string(),
        n => format!("Connected ({n} tools)"),
    }
}

fn format_window(d: Duration) -> String {
    if d >= Duration::hours(1) {
        format!("{}h", d.num_hours())
    } else {
        format!("{}m", d.num_minutes().max(1))
    }
}

/// Priority-ordered health rules; first match wins. Always yields a
/// non-empty summary.
pub fn calculate_health(view: &UpstreamView, now: DateTime<Utc>) -> HealthStatus {
    // Disabled is intentional, not broken.
    if !view.enabled {
        return HealthStatus {
            level: HealthLevel::Healthy,
            admin_state: AdminState::Disabled,
            summary: "Disabled".into(),
            detail: "Server is disabled".into(),
            action: HealthAction::Enable,
        };
    }
    if view.quarantined {
        return HealthStatus {
            level: HealthLevel::Healthy,
            admin_state: AdminState::Quarantined,
            summary: "Quarantined for review".into(),
            detail: "Tools are withheld until the server is approved".into(),
            action: HealthAction::Approve,
        };
    }
    if let Some(secret) = view.missing_secret.as_deref().filter(|s| !s.is_empty()) {
        return HealthStatus {
            level: HealthLevel::Unhealthy,
            admin_state: AdminState::Enabled,
            summary: "Missing secret".into(),
            detail: secret.to_string(),
            action: HealthAction::SetSecret,
        };
    }
    if let Some(err) = view.oauth_config_error.as_deref().filter(|s| !s.is_empty()) {
        return HealthStatus {
            level: HealthLevel::Unhealthy,
            admin_state: AdminState::Enabled,
            summary: "OAuth configuration error".into(),
            detail: err.to_string(),
            action: HealthAction::Configure,
        };
    }

    match view.connection_state {
        ConnectionState::Error | ConnectionState::Disconnected => {
            let raw = view.last_error.as_deref().unwrap_or("");
            let summary = if raw.is_empty() {
                "Disconnected".to_string()
            } else {
                friendly_error(raw)
            };
            let action = if view.oauth_required && is_oauth_error(raw) {
                HealthAction::Login
            } else {
                HealthAction::Restart
            };
            return HealthStatus {
                level: HealthLevel::Unhealthy,
                admin_state: AdminState::Enabled,
                summary,
                detail: raw.to_string(),
                action,
            };
        }
        ConnectionState::Connecting | ConnectionState::Idle => {
            return HealthStatus {
                level: HealthLevel::Degraded,
                admin_state: AdminState::Enabled,
                summary: "Connecting...".into(),
                detail: "Connection attempt in progress".into(),
                action: HealthAction::None,
            };
        }
        ConnectionState::Connected => {}
    }

    if view.oauth_required {
        if view.user_logged_out {
            return HealthStatus {
                level: HealthLevel::Unhealthy,
                admin_state: AdminState::Enabled,
                summary: "Logged out".into(),
                detail: "Re-authenticate to restore access".into(),
                action: HealthAction::Login,
            };
        }
        let expired_now = view.token_expires_at.is_some_and(|e| now >= e);
        match view.oauth_status {
            Some(OAuthStatus::Expired) => {
                return login_needed("Token expired");
            }
            Some(OAuthStatus::Error) => {
                return login_needed("Authentication error");
            }
            Some(OAuthStatus::Authenticated) => {
                if expired_now {
                    return login_needed("Token expired");
                }
                if let Some(expires_at) = view.token_expires_at {
                    let remaining = expires_at - now;
                    if remaining <= view.warning_window {
                        if view.has_refresh_token {
                            // Auto-refresh covers it; nothing for the
                            // operator to do.
                            return HealthStatus {
                                level: HealthLevel::Healthy,
                                admin_state: AdminState::Enabled,
                                summary: connected_summary(view.tool_count),
                                detail: format!(
                                    "Token expires at {}",
                                    expires_at.to_rfc3339()
                                ),
                                action: HealthAction::None,
                            };
                        }
                        return HealthStatus {
                            level: HealthLevel::Degraded,
                            admin_state: AdminState::Enabled,
                            summary: format!("Token expiring in {}", format_window(remaining)),
                            detail: format!("Token expires at {}", expires_at.to_rfc3339()),
                            action: HealthAction::Login,
                        };
                    }
                }
            }
            Some(OAuthStatus::None) | None => {
                return login_needed("Authentication required");
            }
        }
    }

    HealthStatus {
        level: HealthLevel::Healthy,
        admin_state: AdminState::Enabled,
        summary: connected_summary(view.tool_count),
        detail: String::new(),
        action: HealthAction::None,
    }
}

fn login_needed(summary: &str) -> HealthStatus {
    HealthStatus {
        level: HealthLevel::Unhealthy,
        admin_state: AdminState::Enabled,
        summary: summary.to_string(),
        detail: "Re-authenticate to restore access".into(),
        action: HealthAction::Login,
    }
}
