use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, fs, path::PathBuf};

use crate::transport::params::validate_extra_params;

// Types shared between the supervisor, health calculator and callers.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Stdio,
    Http,
    Sse,
}

fn default_protocol() -> Protocol {
    Protocol::Stdio
}

/// Connection lifecycle of one upstream. Serialized once, at the API
/// boundary, as the snake_case strings below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthStatus {
    None,
    Authenticated,
    Expired,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Extra parameters appended to authorization and token requests,
    /// e.g. an RFC 8707 `resource` indicator.
    #[serde(default)]
    pub extra_params: HashMap<String, String>,
    /// Providers that pin the redirect_uri need a fixed callback port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
    pub enabled: bool,
    #[serde(default)]
    pub quarantined: bool,
}

impl UpstreamConfig {
    pub fn oauth_required(&self) -> bool {
        self.oauth.is_some()
    }

    /// Signature of the OAuth-relevant parts of the config. Reconcile uses
    /// this to notice changes that invalidate stored tokens and client
    /// registrations.
    pub fn oauth_fingerprint(&self) -> String {
        match &self.oauth {
            None => String::new(),
            Some(o) => {
                let mut extras: Vec<_> =
                    o.extra_params.iter().map(|(k, v)| format!("{k}={v}")).collect();
                extras.sort();
                format!(
                    "{}|{}|{}|{}|{}",
                    self.url,
                    o.client_id.as_deref().unwrap_or(""),
                    o.scopes.join(" "),
                    extras.join("&"),
                    o.callback_port.map(|p| p.to_string()).unwrap_or_default(),
                )
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerIsolation {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<UpstreamConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_isolation: Option<DockerIsolation>,
    #[serde(default)]
    pub disable_management: bool,
    #[serde(default)]
    pub read_only_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    pub fn server(&self, name: &str) -> Option<&UpstreamConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_mut(&mut self, name: &str) -> Option<&mut UpstreamConfig> {
        self.servers.iter_mut().find(|s| s.name == name)
    }

    /// Reject write operations when the configuration forbids them.
    pub fn ensure_writable(&self) -> Result<(), GateError> {
        if self.disable_management {
            return Err(GateError::ManagementDisabled);
        }
        if self.read_only_mode {
            return Err(GateError::ReadOnly);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for s in &self.servers {
            if !seen.insert(s.name.clone()) {
                return Err(ConfigError::DuplicateServer(s.name.clone()));
            }
            if let Some(oauth) = &s.oauth
                && let Err(key) = validate_extra_params(&oauth.extra_params)
            {
                return Err(ConfigError::ReservedOAuthParam {
                    server: s.name.clone(),
                    key,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    ManagementDisabled,
    ReadOnly,
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::ManagementDisabled => write!(f, "management operations are disabled"),
            GateError::ReadOnly => write!(f, "configuration is in read-only mode"),
        }
    }
}

impl std::error::Error for GateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    DuplicateServer(String),
    ReservedOAuthParam { server: String, key: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::DuplicateServer(name) => {
                write!(f, "duplicate server name `{name}`")
            }
            ConfigError::ReservedOAuthParam { server, key } => {
                write!(
                    f,
                    "server `{server}`: extra_params must not set reserved OAuth parameter `{key}`"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// Config paths abstraction to make IO testable.
pub trait ConfigProvider: Send + Sync {
    fn base_dir(&self) -> PathBuf;
}

#[derive(Default, Clone)]
pub struct OsConfigProvider;

impl ConfigProvider for OsConfigProvider {
    fn base_dir(&self) -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
        base.join("app.mcp.warden")
    }
}

pub fn default_config() -> Config {
    Config {
        servers: Vec::new(),
        docker_isolation: None,
        disable_management: false,
        read_only_mode: false,
        data_dir: None,
    }
}

pub fn config_path(cp: &dyn ConfigProvider) -> PathBuf {
    cp.base_dir().join("settings.json")
}

pub fn load_config_with(cp: &dyn ConfigProvider) -> Config {
    let path = config_path(cp);
    if let Ok(content) = fs::read_to_string(&path)
        && let Ok(cfg) = serde_json::from_str::<Config>(&content)
    {
        return cfg;
    }
    default_config()
}

pub fn save_config_with(cp: &dyn ConfigProvider, config: &Config) -> anyhow::Result<PathBuf> {
    config.validate()?;
    fs::create_dir_all(cp.base_dir())
        .map_err(|e| anyhow::anyhow!("create config dir: {e}"))?;
    let path = config_path(cp);
    let content = serde_json::to_string_pretty(config)?;
    fs::write(&path, content).map_err(|e| anyhow::anyhow!("write settings: {e}"))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Clone)]
    struct TempConfigProvider {
        base: PathBuf,
    }

    impl TempConfigProvider {
        fn new() -> Self {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            let tid = format!("{:?}", std::thread::current().id());
            let dir = std::env::temp_dir().join(format!(
                "mcp-warden-test-{}-{}-{}",
                std::process::id(),
                tid,
                stamp
            ));
            fs::create_dir_all(&dir).unwrap();
            Self { base: dir }
        }
    }

    impl ConfigProvider for TempConfigProvider {
        fn base_dir(&self) -> PathBuf {
            self.base.clone()
        }
    }

    fn upstream(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.into(),
            url: "http://127.0.0.1:9000/mcp".into(),
            protocol: Protocol::Http,
            command: String::new(),
            args: vec![],
            env: Default::default(),
            headers: Default::default(),
            oauth: None,
            enabled: true,
            quarantined: false,
        }
    }

    #[test]
    fn config_roundtrip() {
        let cp = TempConfigProvider::new();
        let mut cfg = default_config();
        cfg.servers.push(upstream("srv"));
        save_config_with(&cp, &cfg).unwrap();
        let loaded = load_config_with(&cp);
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.servers[0].name, "srv");
        assert!(matches!(loaded.servers[0].protocol, Protocol::Http));
    }

    #[test]
    fn connection_state_serialization() {
        let json = serde_json::to_string(&ConnectionState::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
        let parsed: ConnectionState = serde_json::from_str("\"disconnected\"").unwrap();
        assert!(matches!(parsed, ConnectionState::Disconnected));
        assert_eq!(
            serde_json::to_string(&OAuthStatus::None).unwrap(),
            "\"none\""
        );
    }

    #[test]
    fn reserved_extra_params_are_rejected() {
        let cp = TempConfigProvider::new();
        let mut cfg = default_config();
        let mut srv = upstream("srv");
        let mut oauth = OAuthSettings::default();
        oauth
            .extra_params
            .insert("redirect_uri".into(), "http://evil.example".into());
        srv.oauth = Some(oauth);
        cfg.servers.push(srv);
        let err = save_config_with(&cp, &cfg).unwrap_err();
        assert!(err.to_string().contains("redirect_uri"));
    }

    #[test]
    fn duplicate_server_names_are_rejected() {
        let mut cfg = default_config();
        cfg.servers.push(upstream("a"));
        cfg.servers.push(upstream("a"));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateServer(_))
        ));
    }

    #[test]
    fn gates_block_writes() {
        let mut cfg = default_config();
        cfg.read_only_mode = true;
        assert_eq!(cfg.ensure_writable(), Err(GateError::ReadOnly));
        cfg.read_only_mode = false;
        cfg.disable_management = true;
        assert_eq!(cfg.ensure_writable(), Err(GateError::ManagementDisabled));
    }

    #[test]
    fn oauth_fingerprint_tracks_relevant_fields() {
        let mut srv = upstream("srv");
        assert_eq!(srv.oauth_fingerprint(), "");
        srv.oauth = Some(OAuthSettings {
            scopes: vec!["mcp".into()],
            ..Default::default()
        });
        let a = srv.oauth_fingerprint();
        srv.oauth.as_mut().unwrap().scopes.push("offline".into());
        assert_ne!(a, srv.oauth_fingerprint());
    }
}
