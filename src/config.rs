use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Default paths for configuration (system-wide, then dev-relative).
const DEFAULT_CONFIG_PATH: &str = "/etc/mcphubd/mcphubd.toml";
const DEV_CONFIG_PATH: &str = "mcphubd.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HubConfig {
    pub server: ServerSection,
    pub paths: PathsSection,
    pub proxy: ProxySection,
    pub launch: LaunchSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    /// Gateway listening port; unset means probe for a free one.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub servers_config: String,
    pub keys_file: String,
    pub audit_log: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// Wrapper binary that exposes a stdio MCP server over SSE.
    pub command: String,
    /// Host the wrapper binds its SSE listener to, and the host
    /// advertised in endpoint URLs.
    pub sse_host: String,
    /// Grace period before a stop escalates to SIGKILL.
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LaunchSection {
    /// Server group to start (and issue a credential for) at boot.
    pub autostart: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: None,
        }
    }
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            servers_config: "servers_config.json".to_string(),
            keys_file: "api_keys.json".to_string(),
            audit_log: "audit.log".to_string(),
        }
    }
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            command: "mcp-proxy".to_string(),
            sse_host: "0.0.0.0".to_string(),
            stop_grace_secs: 5,
        }
    }
}

impl HubConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Load the daemon config, falling back to defaults when no file exists.
pub fn load_config() -> HubConfig {
    let path = if Path::new(DEFAULT_CONFIG_PATH).exists() {
        DEFAULT_CONFIG_PATH
    } else {
        DEV_CONFIG_PATH
    };

    match HubConfig::load_from_file(path) {
        Ok(config) => {
            tracing::info!("Loaded config from {}", path);
            config
        }
        Err(err) => {
            tracing::info!("No usable config at {} ({}). Using defaults.", path, err);
            HubConfig::default()
        }
    }
}

/// One entry from the server spec source. Immutable once loaded; the
/// dashboard owns writing the file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Explicit SSE port; overrides hash-derived allocation.
    pub sse_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, ServerSpec>,
}

/// Read the server spec source. A missing or corrupt file degrades to an
/// empty mapping — the dashboard may not have written one yet.
pub fn load_server_specs<P: AsRef<Path>>(path: P) -> HashMap<String, ServerSpec> {
    let path = path.as_ref();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::debug!("Server spec source {} unreadable: {}", path.display(), err);
            return HashMap::new();
        }
    };

    match serde_json::from_str::<ServersFile>(&content) {
        Ok(file) => file.mcp_servers,
        Err(err) => {
            tracing::warn!("Server spec source {} is corrupt: {}", path.display(), err);
            HashMap::new()
        }
    }
}
