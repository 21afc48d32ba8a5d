//! Tool index seam. The full-text search engine lives elsewhere; the
//! supervisor only needs batch indexing, per-server deletion (quarantine
//! containment) and lookup, plus a single-flight guard so concurrent
//! connect events coalesce into one discovery.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

pub trait ToolIndex: Send + Sync {
    fn batch_index(&self, server: &str, tools: Vec<ToolInfo>);
    fn delete_tool(&self, server: &str, tool: &str);
    fn delete_server_tools(&self, server: &str);
    fn tools_by_server(&self, server: &str) -> Vec<ToolInfo>;
}

/// In-memory index; good enough for the proxy itself and for tests.
#[derive(Default)]
pub struct MemoryToolIndex {
    tools: RwLock<HashMap<String, Vec<ToolInfo>>>,
}

impl MemoryToolIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToolIndex for MemoryToolIndex {
    fn batch_index(&self, server: &str, tools: Vec<ToolInfo>) {
        self.tools
            .write()
            .expect("tool index lock poisoned")
            .insert(server.to_string(), tools);
    }

    fn delete_tool(&self, server: &str, tool: &str) {
        if let Some(list) = self
            .tools
            .write()
            .expect("tool index lock poisoned")
            .get_mut(server)
        {
            list.retain(|t| t.name != tool);
        }
    }

    fn delete_server_tools(&self, server: &str) {
        self.tools
            .write()
            .expect("tool index lock poisoned")
            .remove(server);
    }

    fn tools_by_server(&self, server: &str) -> Vec<ToolInfo> {
        self.tools
            .read()
            .expect("tool index lock poisoned")
            .get(server)
            .cloned()
            .unwrap_or_default()
    }
}

/// Per-server single-flight guard. `begin` returns false while another
/// discovery for the same server is still running, so duplicate connect
/// notifications collapse into the in-flight pass.
#[derive(Default)]
pub struct DiscoveryGuard {
    in_flight: Mutex<HashSet<String>>,
}

impl DiscoveryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, server: &str) -> bool {
        self.in_flight
            .lock()
            .expect("discovery guard lock poisoned")
            .insert(server.to_string())
    }

    pub fn end(&self, server: &str) {
        self.in_flight
            .lock()
            .expect("discovery guard lock poisoned")
            .remove(server);
    }
}
