use serde_json::Value as JsonValue;

pub const REDACTED: &str = "***REDACTED***";

/// Keys whose values must never reach a log record or the journal,
/// compared case-insensitively against JSON object keys and form/query
/// parameter names.
pub const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "code",
    "access_token",
    "refresh_token",
    "client_secret",
    "code_verifier",
    "token",
    "password",
    "secret",
    "api_key",
];

/// Initialize the global tracing subscriber. Idempotent: later calls are
/// no-ops so tests can call it freely.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,mcp_warden=debug"))
        .unwrap_or_default();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

pub fn is_sensitive_key(key: &str) -> bool {
    let k = key.to_lowercase();
    if SENSITIVE_KEYS.contains(&k.as_str()) {
        return true;
    }
    // Header families like X-Api-Token, X-Auth-Token.
    k.starts_with("x-") && k.ends_with("-token")
}

/// Recursively mask sensitive fields in a JSON payload.
pub fn redact_json(mut v: JsonValue) -> JsonValue {
    fn rec(v: &mut JsonValue) {
        match v {
            JsonValue::Object(map) => {
                for (k, val) in map.iter_mut() {
                    if is_sensitive_key(k) {
                        *val = JsonValue::String(REDACTED.to_string());
                    } else {
                        rec(val);
                    }
                }
            }
            JsonValue::Array(arr) => {
                for item in arr.iter_mut() {
                    rec(item);
                }
            }
            _ => {}
        }
    }
    rec(&mut v);
    v
}

/// Mask sensitive query/form parameters in a free-form string of
/// `key=value` pairs joined by `&`. Used when logging request URLs.
pub fn redact_params(query: &str) -> String {
    query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, _)) if is_sensitive_key(k) => format!("{k}={REDACTED}"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_masks_keys_recursively() {
        let v = serde_json::json!({
            "Authorization": "Bearer x",
            "nested": { "refresh_token": "r", "keep": 1 },
            "arr": [ {"code": "abc"}, {"ok": true} ]
        });
        let out = redact_json(v);
        let s = out.to_string();
        assert!(s.contains(REDACTED));
        assert!(!s.contains("Bearer x"));
        assert!(!s.contains("\"r\""));
        assert!(!s.contains("abc"));
        assert!(s.contains("\"keep\":1"));
    }

    #[test]
    fn token_header_family_is_sensitive() {
        assert!(is_sensitive_key("X-Vault-Token"));
        assert!(is_sensitive_key("x-api-token"));
        assert!(!is_sensitive_key("x-request-id"));
    }

    #[test]
    fn query_params_are_masked() {
        let out = redact_params("code=s3cret&state=abc&scope=mcp");
        assert!(out.contains(&format!("code={REDACTED}")));
        assert!(out.contains("scope=mcp"));
    }
}
