//! Agent configuration: bundled bootstrap document and host-supplied options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of the local display name accepted by the transport.
pub const MAX_USER_NAME_LEN: usize = 63;

/// Rendezvous node used to join the peer network.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub port: String,
    pub public_key: String,
}

/// Bundled network configuration: `{"udp_enabled": bool, "bootstraps": [...]}`.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct BootstrapConfig {
    pub udp_enabled: bool,
    pub bootstraps: Vec<BootstrapNode>,
}

impl BootstrapConfig {
    /// Parse leniently. Whatever was read before the first malformed field is kept;
    /// a document that is not JSON at all yields the default.
    pub fn from_json(json: &str) -> Self {
        let mut config = BootstrapConfig::default();
        let doc: Value = match serde_json::from_str(json) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("bootstrap config is not valid JSON, using defaults: {e}");
                return config;
            }
        };
        match doc.get("udp_enabled").and_then(Value::as_bool) {
            Some(udp) => config.udp_enabled = udp,
            None => {
                tracing::warn!("bootstrap config: missing udp_enabled");
                return config;
            }
        }
        let Some(nodes) = doc.get("bootstraps").and_then(Value::as_array) else {
            tracing::warn!("bootstrap config: missing bootstraps");
            return config;
        };
        for (i, node) in nodes.iter().enumerate() {
            match parse_node(node) {
                Some(n) => config.bootstraps.push(n),
                None => {
                    tracing::warn!("bootstrap config: entry {i} malformed, keeping {i} nodes");
                    break;
                }
            }
        }
        config
    }
}

fn parse_node(node: &Value) -> Option<BootstrapNode> {
    let text = |key: &str| node.get(key).and_then(Value::as_str).map(str::to_string);
    let port = match node.get("port")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(BootstrapNode {
        ipv4: text("ipv4").filter(|s| !s.is_empty()),
        ipv6: text("ipv6").filter(|s| !s.is_empty()),
        port,
        public_key: text("public_key")?,
    })
}

/// Host-supplied options for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOptions {
    /// Application files directory. Transport state lives in `data_dir/elaCarrier`.
    pub data_dir: PathBuf,
    /// Contents of the bundled bootstrap document.
    #[serde(default)]
    pub bootstrap_json: String,
    #[serde(default)]
    pub device_manufacturer: String,
    #[serde(default)]
    pub device_model: String,
    /// Service name announced when opening a tunnel.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_start_interval_ms")]
    pub start_interval_ms: u32,
    /// Notifications buffered per subscriber before the slowest one starts lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_service_name() -> String {
    "owncloud".to_string()
}
fn default_start_interval_ms() -> u32 {
    50
}
fn default_event_capacity() -> usize {
    64
}

impl AgentOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bootstrap_json: String::new(),
            device_manufacturer: String::new(),
            device_model: String::new(),
            service_name: default_service_name(),
            start_interval_ms: default_start_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }

    pub fn carrier_dir(&self) -> PathBuf {
        self.data_dir.join("elaCarrier")
    }

    /// Name given to the local identity when it has none.
    pub fn default_device_name(&self) -> String {
        default_device_name(&self.device_manufacturer, &self.device_model)
    }
}

/// `"<manufacturer> <model>"` unless the model already carries the manufacturer,
/// truncated to [`MAX_USER_NAME_LEN`] bytes on a char boundary.
pub fn default_device_name(manufacturer: &str, model: &str) -> String {
    let mut name = if model.starts_with(manufacturer) {
        model.to_string()
    } else {
        format!("{manufacturer} {model}")
    };
    if name.len() > MAX_USER_NAME_LEN {
        let mut cut = MAX_USER_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}
