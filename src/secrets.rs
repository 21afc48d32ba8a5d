use std::fmt;

use keyring::{Entry, Error as KeyringError};

/// Reference forms accepted in upstream `env` and `headers` values.
/// `${env:NAME}` resolves from the process environment; `${keyring:ID}`
/// from the OS keyring. Anything else is a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef {
    Env(String),
    Keyring(String),
}

pub fn parse_secret_ref(value: &str) -> Option<SecretRef> {
    let inner = value.strip_prefix("${")?.strip_suffix('}')?;
    if let Some(name) = inner.strip_prefix("env:") {
        return Some(SecretRef::Env(name.to_string()));
    }
    if let Some(id) = inner.strip_prefix("keyring:") {
        return Some(SecretRef::Keyring(id.to_string()));
    }
    None
}

#[derive(Debug)]
pub enum SecretError {
    /// Referenced secret does not exist. The message form is load-bearing:
    /// the health calculator routes it to a `SetSecret` action.
    Missing { name: String },
    Backend(String),
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretError::Missing { name } => {
                write!(f, "environment variable {name} not found or empty")
            }
            SecretError::Backend(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SecretError {}

impl SecretError {
    pub fn missing_name(&self) -> Option<&str> {
        match self {
            SecretError::Missing { name } => Some(name),
            SecretError::Backend(_) => None,
        }
    }
}

/// Recognize a missing-secret failure in an opaque error string (e.g.
/// one bubbled up from a child process) and recover the secret name.
pub fn detect_missing_secret(message: &str) -> Option<String> {
    if let Some(rest) = message.split("environment variable ").nth(1)
        && let Some(name) = rest.split(" not found").next()
        && !name.is_empty()
    {
        return Some(name.trim().to_string());
    }
    // An unresolved `${env:X}` that leaked through verbatim.
    if let Some(start) = message.find("${env:")
        && let Some(end) = message[start..].find('}')
    {
        return Some(message[start + "${env:".len()..start + end].to_string());
    }
    None
}

pub trait SecretStore: Send + Sync {
    fn set(&self, id: &str, value: &str) -> Result<(), SecretError>;
    fn get(&self, id: &str) -> Result<Option<String>, SecretError>;
    fn delete(&self, id: &str) -> Result<(), SecretError>;
}

/// Production secret store backed by the operating system keyring.
#[derive(Clone)]
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    const DEFAULT_SERVICE: &'static str = "app.mcp.warden";

    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, id: &str) -> Result<Entry, SecretError> {
        Entry::new(&self.service, id).map_err(|err| {
            SecretError::Backend(format!(
                "keyring entry for service `{}` and user `{id}`: {err}",
                self.service
            ))
        })
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SERVICE)
    }
}

impl SecretStore for KeyringSecretStore {
    fn set(&self, id: &str, value: &str) -> Result<(), SecretError> {
        let entry = self.entry(id)?;
        entry
            .set_password(value)
            .map_err(|err| SecretError::Backend(err.to_string()))
    }

    fn get(&self, id: &str) -> Result<Option<String>, SecretError> {
        let entry = self.entry(id)?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(err) => Err(SecretError::Backend(err.to_string())),
        }
    }

    fn delete(&self, id: &str) -> Result<(), SecretError> {
        let entry = self.entry(id)?;
        match entry.delete_credential() {
            Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
            Err(err) => Err(SecretError::Backend(err.to_string())),
        }
    }
}

/// Resolves config values that may contain secret references.
pub struct SecretResolver {
    store: Box<dyn SecretStore>,
}

impl SecretResolver {
    pub fn new(store: Box<dyn SecretStore>) -> Self {
        Self { store }
    }

    pub fn os_default() -> Self {
        Self::new(Box::new(KeyringSecretStore::default()))
    }

    /// Resolve a single value. Env refs bypass the store entirely.
    pub fn resolve(&self, value: &str) -> Result<String, SecretError> {
        match parse_secret_ref(value) {
            None => Ok(value.to_string()),
            Some(SecretRef::Env(name)) => match std::env::var(&name) {
                Ok(v) if !v.is_empty() => Ok(v),
                _ => Err(SecretError::Missing { name }),
            },
            Some(SecretRef::Keyring(id)) => match self.store.get(&id)? {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(SecretError::Missing { name: id }),
            },
        }
    }

    /// Resolve every value of a map, keeping key order irrelevant. The
    /// first missing secret aborts the whole resolution so a connection
    /// attempt never starts with a half-resolved environment.
    pub fn resolve_map(
        &self,
        values: &std::collections::HashMap<String, String>,
    ) -> Result<std::collections::HashMap<String, String>, SecretError> {
        let mut out = std::collections::HashMap::with_capacity(values.len());
        for (k, v) in values {
            out.insert(k.clone(), self.resolve(v)?);
        }
        Ok(out)
    }
}

/// Simple in-memory store for tests so we do not touch the real OS keychain.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn set(&self, id: &str, value: &str) -> Result<(), SecretError> {
        self.secrets
            .lock()
            .unwrap()
            .insert(id.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<String>, SecretError> {
        Ok(self.secrets.lock().unwrap().get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<(), SecretError> {
        self.secrets.lock().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_forms() {
        assert_eq!(
            parse_secret_ref("${env:GITHUB_TOKEN}"),
            Some(SecretRef::Env("GITHUB_TOKEN".into()))
        );
        assert_eq!(
            parse_secret_ref("${keyring:slack-api}"),
            Some(SecretRef::Keyring("slack-api".into()))
        );
        assert_eq!(parse_secret_ref("plain-value"), None);
        assert_eq!(parse_secret_ref("${vault:x}"), None);
    }

    #[test]
    #[serial_test::serial]
    fn env_refs_shortcircuit_the_store() {
        // SAFETY: test-local variable name, no other thread reads it.
        unsafe { std::env::set_var("MCP_WARDEN_TEST_SECRET", "hunter2") };
        let resolver = SecretResolver::new(Box::new(MemorySecretStore::new()));
        assert_eq!(
            resolver.resolve("${env:MCP_WARDEN_TEST_SECRET}").unwrap(),
            "hunter2"
        );
        unsafe { std::env::remove_var("MCP_WARDEN_TEST_SECRET") };
        let err = resolver
            .resolve("${env:MCP_WARDEN_TEST_SECRET}")
            .unwrap_err();
        assert_eq!(err.missing_name(), Some("MCP_WARDEN_TEST_SECRET"));
        assert!(err.to_string().contains("not found or empty"));
    }

    #[test]
    fn keyring_refs_use_the_store() {
        let store = MemorySecretStore::new();
        store.set("slack-api", "xoxb-1").unwrap();
        let resolver = SecretResolver::new(Box::new(store));
        assert_eq!(resolver.resolve("${keyring:slack-api}").unwrap(), "xoxb-1");
        assert!(resolver.resolve("${keyring:absent}").is_err());
    }

    #[test]
    fn literals_pass_through() {
        let resolver = SecretResolver::new(Box::new(MemorySecretStore::new()));
        assert_eq!(resolver.resolve("Bearer abc").unwrap(), "Bearer abc");
    }

    #[test]
    fn missing_secret_detection_from_messages() {
        assert_eq!(
            detect_missing_secret("environment variable API_KEY not found or empty"),
            Some("API_KEY".into())
        );
        assert_eq!(
            detect_missing_secret("spawn failed: value ${env:HOME_TOKEN} unresolved"),
            Some("HOME_TOKEN".into())
        );
        assert_eq!(detect_missing_secret("connection refused"), None);
    }

    #[test]
    fn resolve_map_fails_fast() {
        let resolver = SecretResolver::new(Box::new(MemorySecretStore::new()));
        let mut map = std::collections::HashMap::new();
        map.insert("A".to_string(), "ok".to_string());
        map.insert("B".to_string(), "${env:MCP_WARDEN_DEFINITELY_ABSENT}".to_string());
        assert!(resolver.resolve_map(&map).is_err());
    }
}
