//! Construction of rmcp client transports for each upstream protocol.
//! The supervisor only ever sees the narrow `ClientService` handle.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rmcp::ServiceExt;
use rmcp::service::RoleClient;
use rmcp::transport::{
    SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    sse_client::SseClientConfig,
    streamable_http_client::StreamableHttpClientTransportConfig,
};

use crate::config::{Protocol, UpstreamConfig};
use crate::tools::ToolInfo;

pub type ClientService = rmcp::service::RunningService<RoleClient, ()>;

/// Upper bound for one connect attempt, MCP handshake included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

fn header_map(
    headers: &HashMap<String, String>,
    bearer: Option<&str>,
) -> Result<reqwest::header::HeaderMap> {
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .with_context(|| format!("invalid header name {k}"))?;
        let val = reqwest::header::HeaderValue::from_str(v)
            .with_context(|| format!("invalid header value for {k}"))?;
        map.insert(name, val);
    }
    if let Some(token) = bearer {
        let val = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("invalid bearer token")?;
        map.insert(reqwest::header::AUTHORIZATION, val);
    }
    Ok(map)
}

/// Start a connection per the upstream's declared protocol. `headers` and
/// `env` arrive with secrets already resolved; `bearer` is the current
/// access token for OAuth upstreams.
pub async fn connect(
    cfg: &UpstreamConfig,
    headers: &HashMap<String, String>,
    env: &HashMap<String, String>,
    bearer: Option<&str>,
) -> Result<ClientService> {
    tracing::info!(target = "client", server = %cfg.name, protocol = ?cfg.protocol, "starting");
    let connect_fut = async {
        match cfg.protocol {
            Protocol::Http => {
                if cfg.url.is_empty() {
                    return Err(anyhow!("no endpoint configured"));
                }
                let client = reqwest::Client::builder()
                    .default_headers(header_map(headers, bearer)?)
                    .build()
                    .context("http client build")?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(cfg.url.clone()),
                );
                ().serve(transport).await.context("rmcp serve")
            }
            Protocol::Sse => {
                if cfg.url.is_empty() {
                    return Err(anyhow!("no endpoint configured"));
                }
                let client = reqwest::Client::builder()
                    .default_headers(header_map(headers, bearer)?)
                    .build()
                    .context("sse client build")?;
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig {
                        sse_endpoint: cfg.url.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .context("sse start")?;
                ().serve(transport).await.context("rmcp serve")
            }
            Protocol::Stdio => {
                if cfg.command.is_empty() {
                    return Err(anyhow!("missing command"));
                }
                let mut command = tokio::process::Command::new(&cfg.command);
                command.args(&cfg.args);
                for (k, v) in env {
                    command.env(k, v);
                }
                let transport = TokioChildProcess::new(command).context("spawn")?;
                ().serve(transport).await.context("rmcp serve")
            }
        }
    };
    match tokio::time::timeout(CONNECT_TIMEOUT, connect_fut).await {
        Ok(res) => res,
        Err(_) => Err(anyhow!(
            "timeout connecting to {} after {}s",
            cfg.name,
            CONNECT_TIMEOUT.as_secs()
        )),
    }
}

/// Stop a running connection. The rmcp service tears itself down when its
/// cancellation token fires.
pub fn disconnect(service: &ClientService) {
    service.cancellation_token().cancel();
}

pub async fn list_tools(service: &ClientService) -> Result<Vec<ToolInfo>> {
    let tools = service
        .list_all_tools()
        .await
        .map_err(|e| anyhow!("rmcp list tools").context(e))?;
    Ok(tools
        .into_iter()
        .filter_map(|t| {
            let v = serde_json::to_value(t).ok()?;
            let name = v.get("name")?.as_str()?.to_string();
            let description = v
                .get("description")
                .and_then(|d| d.as_str())
                .map(|s| s.to_string());
            let input_schema = v
                .get("inputSchema")
                .or_else(|| v.get("input_schema"))
                .cloned();
            Some(ToolInfo {
                name,
                description,
                input_schema,
            })
        })
        .collect())
}

/// Probe the given HTTP endpoint and return true if it responds with 401.
pub async fn probe_unauthorized(endpoint: &str) -> bool {
    if endpoint.is_empty() {
        return false;
    }
    if let Ok(resp) = reqwest::Client::default().get(endpoint).send().await {
        return resp.status().as_u16() == 401;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_builds_with_bearer() {
        let headers = HashMap::from([("X-Custom".to_string(), "1".to_string())]);
        let map = header_map(&headers, Some("tok")).unwrap();
        assert_eq!(map.get("x-custom").unwrap(), "1");
        assert_eq!(map.get("authorization").unwrap(), "Bearer tok");
    }

    #[test]
    fn header_map_rejects_bad_names() {
        let headers = HashMap::from([("bad header".to_string(), "1".to_string())]);
        assert!(header_map(&headers, None).is_err());
    }

    #[tokio::test]
    async fn probe_handles_unreachable_endpoints() {
        assert!(!probe_unauthorized("").await);
        assert!(!probe_unauthorized("http://127.0.0.1:1/nothing").await);
    }
}
