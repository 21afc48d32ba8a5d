use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast;

use crate::logging::redact_json;

pub const EVENT_SERVERS_CHANGED: &str = "servers.changed";
pub const EVENT_CONFIG_SAVED: &str = "config.saved";
pub const EVENT_CONFIG_RELOADED: &str = "config.reloaded";
pub const EVENT_TOKEN_REFRESHED: &str = "oauth.token_refreshed";
pub const EVENT_REFRESH_FAILED: &str = "oauth.refresh_failed";
pub const EVENT_SERVER_CONNECTED: &str = "server.connected";
pub const EVENT_SERVER_DISCONNECTED: &str = "server.disconnected";
pub const EVENT_SERVER_STATE_CHANGED: &str = "server.state_changed";

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, payload: &serde_json::Value);
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

/// Single-producer-many-consumer fan-out. Subscribers that fall behind
/// skip messages (`servers.changed` is a coalesced hint, not a log), so a
/// slow listener never backs up the supervisor.
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventEmitter for BroadcastBus {
    fn emit(&self, event: &str, payload: &serde_json::Value) {
        let payload = redact_json(payload.clone());
        // Errors only mean "no live subscribers"; that is fine.
        let _ = self.tx.send(BusEvent {
            name: event.to_string(),
            payload,
        });
    }
}

// Helper functions to standardize payload shapes.

pub fn servers_changed<E: EventEmitter + ?Sized>(
    emitter: &E,
    reason: &str,
    extra: Option<serde_json::Value>,
) {
    let mut payload = json!({ "reason": reason });
    if let Some(extra) = extra
        && let (Some(obj), Some(add)) = (payload.as_object_mut(), extra.as_object())
    {
        for (k, v) in add {
            obj.insert(k.clone(), v.clone());
        }
    }
    emitter.emit(EVENT_SERVERS_CHANGED, &payload);
}

pub fn config_saved<E: EventEmitter + ?Sized>(emitter: &E, path: &str) {
    emitter.emit(EVENT_CONFIG_SAVED, &json!({ "path": path }));
}

pub fn config_reloaded<E: EventEmitter + ?Sized>(emitter: &E, path: &str) {
    emitter.emit(EVENT_CONFIG_RELOADED, &json!({ "path": path }));
}

pub fn token_refreshed<E: EventEmitter + ?Sized>(
    emitter: &E,
    server_name: &str,
    expires_at: Option<DateTime<Utc>>,
) {
    emitter.emit(
        EVENT_TOKEN_REFRESHED,
        &json!({
            "server_name": server_name,
            "expires_at": expires_at.map(|t| t.to_rfc3339()),
        }),
    );
}

pub fn refresh_failed<E: EventEmitter + ?Sized>(emitter: &E, server_name: &str, error: &str) {
    emitter.emit(
        EVENT_REFRESH_FAILED,
        &json!({ "server_name": server_name, "error": error }),
    );
}

pub fn server_connected<E: EventEmitter + ?Sized>(emitter: &E, server_name: &str) {
    emitter.emit(EVENT_SERVER_CONNECTED, &json!({ "server_name": server_name }));
}

pub fn server_disconnected<E: EventEmitter + ?Sized>(emitter: &E, server_name: &str) {
    emitter.emit(
        EVENT_SERVER_DISCONNECTED,
        &json!({ "server_name": server_name }),
    );
}

pub fn server_state_changed<E: EventEmitter + ?Sized>(
    emitter: &E,
    server_name: &str,
    state: &str,
) {
    emitter.emit(
        EVENT_SERVER_STATE_CHANGED,
        &json!({ "server_name": server_name, "state": state }),
    );
}

/// Test double collecting everything that was emitted.
#[derive(Default)]
pub struct BufferingEventEmitter(pub std::sync::Mutex<Vec<(String, serde_json::Value)>>);

impl BufferingEventEmitter {
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.0.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }
}

impl EventEmitter for BufferingEventEmitter {
    fn emit(&self, event: &str, payload: &serde_json::Value) {
        self.0
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_payloads_are_emitted() {
        let mock = BufferingEventEmitter::default();
        servers_changed(&mock, "add", None);
        token_refreshed(&mock, "srv", None);
        refresh_failed(&mock, "srv", "invalid_grant");
        server_connected(&mock, "srv");
        server_disconnected(&mock, "srv");
        server_state_changed(&mock, "srv", "connected");
        config_saved(&mock, "/tmp/settings.json");
        config_reloaded(&mock, "/tmp/settings.json");
        let events = mock.events();
        assert_eq!(events.len(), 8);
        assert_eq!(events[0].0, EVENT_SERVERS_CHANGED);
        assert_eq!(events[0].1["reason"], "add");
        assert_eq!(events[2].0, EVENT_REFRESH_FAILED);
        assert_eq!(events[6].0, EVENT_CONFIG_SAVED);
        assert_eq!(events[6].1["path"], "/tmp/settings.json");
    }

    #[test]
    fn servers_changed_merges_extra_fields() {
        let mock = BufferingEventEmitter::default();
        servers_changed(&mock, "quarantine", Some(json!({ "server_name": "srv" })));
        let events = mock.events();
        assert_eq!(events[0].1["reason"], "quarantine");
        assert_eq!(events[0].1["server_name"], "srv");
    }

    #[tokio::test]
    async fn broadcast_bus_fans_out_and_redacts() {
        let bus = BroadcastBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit("servers.changed", &json!({ "reason": "x", "token": "s3cret" }));
        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert_eq!(ea.name, "servers.changed");
        assert_eq!(eb.payload["reason"], "x");
        assert_eq!(ea.payload["token"], crate::logging::REDACTED);
    }
}
