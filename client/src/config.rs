//! Configuration for Backhaul
//!
//! Connections come from `backhaul.yml` and/or the `CONNECTION_INFO_LIST`
//! environment variable (a JSON array). Each entry is validated on its
//! own so one malformed entry does not stop the others from starting.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Root configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Process-wide defaults, overridable per connection
    #[serde(default)]
    pub defaults: Defaults,

    /// Route layout of the reverse proxy
    #[serde(default)]
    pub paths: ProxyPaths,

    /// Raw connection entries, validated individually by [`AgentConfig::resolve`]
    #[serde(default)]
    pub connections: Vec<serde_json::Value>,
}

/// Defaults applied to connections that don't set their own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Defaults {
    #[serde(default = "default_request_timeout_millis", alias = "request_timeout_millis")]
    pub request_timeout_millis: u64,

    #[serde(default = "default_max_concurrency", alias = "max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_discovery_timeout_millis", alias = "discovery_timeout_millis")]
    pub discovery_timeout_millis: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            request_timeout_millis: default_request_timeout_millis(),
            max_concurrency: default_max_concurrency(),
            discovery_timeout_millis: default_discovery_timeout_millis(),
        }
    }
}

/// Paths of the reverse proxy endpoints, relative to its base URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPaths {
    #[serde(default = "default_request_headers_path")]
    pub request_headers: String,
    #[serde(default = "default_request_body_path")]
    pub request_body: String,
    #[serde(default = "default_response_headers_path")]
    pub response_headers: String,
    #[serde(default = "default_response_body_path")]
    pub response_body: String,
    #[serde(default = "default_transfer_error_path")]
    pub transfer_error: String,
    #[serde(default = "default_web_socket_path")]
    pub web_socket: String,
}

impl Default for ProxyPaths {
    fn default() -> Self {
        Self {
            request_headers: default_request_headers_path(),
            request_body: default_request_body_path(),
            response_headers: default_response_headers_path(),
            response_body: default_response_body_path(),
            transfer_error: default_transfer_error_path(),
            web_socket: default_web_socket_path(),
        }
    }
}

impl ProxyPaths {
    fn normalize(&mut self) {
        for path in [
            &mut self.request_headers,
            &mut self.request_body,
            &mut self.response_headers,
            &mut self.response_body,
            &mut self.transfer_error,
            &mut self.web_socket,
        ] {
            let trimmed = path.trim_end_matches('/');
            *path = if trimmed.starts_with('/') {
                trimmed.to_string()
            } else {
                format!("/{}", trimmed)
            };
        }
    }
}

/// Transport used to reach the proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One persistent WebSocket carrying all transfers
    #[default]
    Duplex,
    /// Repeated long-poll discovery calls
    Polling,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Duplex => f.write_str("duplex"),
            TransportKind::Polling => f.write_str("polling"),
        }
    }
}

/// A connection entry as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEntry {
    #[serde(alias = "targetAppId", alias = "backend_id")]
    pub backend_id: String,

    #[serde(alias = "reverseProxyBaseUrl", alias = "proxy_base_url")]
    pub proxy_base_url: String,

    #[serde(alias = "targetAppBaseUrl", alias = "backend_base_url")]
    pub backend_base_url: String,

    #[serde(default, alias = "exclude")]
    pub excluded: bool,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default, alias = "request_timeout_millis")]
    pub request_timeout_millis: Option<u64>,

    #[serde(default, alias = "max_concurrency")]
    pub max_concurrency: Option<usize>,

    /// Duplex only: cap on pipelined transfers, unbounded when absent
    #[serde(default, alias = "max_in_flight")]
    pub max_in_flight: Option<usize>,

    #[serde(default, alias = "discovery_timeout_millis")]
    pub discovery_timeout_millis: Option<u64>,
}

/// A validated connection with all defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub backend_id: String,
    /// No trailing slash
    pub proxy_base_url: String,
    /// No trailing slash
    pub backend_base_url: String,
    pub excluded: bool,
    pub transport: TransportKind,
    pub request_timeout: Duration,
    pub max_concurrency: usize,
    pub max_in_flight: Option<usize>,
    pub discovery_timeout: Duration,
    pub paths: ProxyPaths,
}

/// A connection entry that cannot be started
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("connection entry #{index} is malformed: {source}")]
    Malformed {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("connection entry #{index} has an empty backend id")]
    EmptyBackendId { index: usize },

    #[error("connection '{backend_id}': invalid {field} '{value}': {reason}")]
    InvalidUrl {
        backend_id: String,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("connection '{backend_id}': maxConcurrency must be at least 1")]
    ZeroConcurrency { backend_id: String },

    #[error("connection '{backend_id}': maxInFlight must be at least 1")]
    ZeroInFlight { backend_id: String },
}

/// Settings taken from the command line or environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub request_timeout_millis: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub request_headers_path: Option<String>,
    pub request_body_path: Option<String>,
    pub response_headers_path: Option<String>,
    pub response_body_path: Option<String>,
    pub transfer_error_path: Option<String>,
    pub web_socket_path: Option<String>,
}

fn default_request_timeout_millis() -> u64 {
    10_000
}

fn default_max_concurrency() -> usize {
    5
}

fn default_discovery_timeout_millis() -> u64 {
    120_000
}

fn default_request_headers_path() -> String {
    "/req-h".to_string()
}

fn default_request_body_path() -> String {
    "/req-b".to_string()
}

fn default_response_headers_path() -> String {
    "/res-h".to_string()
}

fn default_response_body_path() -> String {
    "/res-b".to_string()
}

fn default_transfer_error_path() -> String {
    "/err".to_string()
}

fn default_web_socket_path() -> String {
    "/ws".to_string()
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: AgentConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Replace the connection list with a JSON array, as found in
    /// `CONNECTION_INFO_LIST`
    pub fn set_connections_json(&mut self, json: &str) -> Result<()> {
        let entries: Vec<serde_json::Value> = serde_json::from_str(json)
            .context("CONNECTION_INFO_LIST must be a JSON array of connection entries")?;
        self.connections = entries;
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(ms) = overrides.request_timeout_millis {
            self.defaults.request_timeout_millis = ms;
        }
        if let Some(n) = overrides.max_concurrency {
            self.defaults.max_concurrency = n;
        }
        let paths = [
            (&overrides.request_headers_path, &mut self.paths.request_headers),
            (&overrides.request_body_path, &mut self.paths.request_body),
            (&overrides.response_headers_path, &mut self.paths.response_headers),
            (&overrides.response_body_path, &mut self.paths.response_body),
            (&overrides.transfer_error_path, &mut self.paths.transfer_error),
            (&overrides.web_socket_path, &mut self.paths.web_socket),
        ];
        for (value, slot) in paths {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
    }

    /// Validate every entry and apply defaults. Order is preserved.
    pub fn resolve(&self) -> Vec<std::result::Result<ConnectionConfig, ConfigError>> {
        let mut paths = self.paths.clone();
        paths.normalize();

        self.connections
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let entry: ConnectionEntry = serde_json::from_value(raw.clone())
                    .map_err(|source| ConfigError::Malformed { index, source })?;
                entry.resolve(index, &self.defaults, &paths)
            })
            .collect()
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "backhaul.yml",
            "backhaul.yaml",
            ".backhaul.yml",
            ".backhaul.yaml",
        ];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

impl ConnectionEntry {
    fn resolve(
        self,
        index: usize,
        defaults: &Defaults,
        paths: &ProxyPaths,
    ) -> std::result::Result<ConnectionConfig, ConfigError> {
        if self.backend_id.trim().is_empty() {
            return Err(ConfigError::EmptyBackendId { index });
        }

        let max_concurrency = self.max_concurrency.unwrap_or(defaults.max_concurrency);

        // Entries that will be skipped are not validated any further.
        let (proxy_base_url, backend_base_url) = if self.excluded || self.backend_id.starts_with('#') {
            (
                self.proxy_base_url.trim_end_matches('/').to_string(),
                self.backend_base_url.trim_end_matches('/').to_string(),
            )
        } else {
            if max_concurrency == 0 {
                return Err(ConfigError::ZeroConcurrency { backend_id: self.backend_id });
            }
            if self.max_in_flight == Some(0) {
                return Err(ConfigError::ZeroInFlight { backend_id: self.backend_id });
            }
            (
                validate_base_url(&self.backend_id, "proxyBaseUrl", &self.proxy_base_url)?,
                validate_base_url(&self.backend_id, "backendBaseUrl", &self.backend_base_url)?,
            )
        };

        Ok(ConnectionConfig {
            proxy_base_url,
            backend_base_url,
            excluded: self.excluded,
            transport: self.transport,
            request_timeout: Duration::from_millis(
                self.request_timeout_millis.unwrap_or(defaults.request_timeout_millis),
            ),
            max_concurrency,
            max_in_flight: self.max_in_flight,
            discovery_timeout: Duration::from_millis(
                self.discovery_timeout_millis.unwrap_or(defaults.discovery_timeout_millis),
            ),
            paths: paths.clone(),
            backend_id: self.backend_id,
        })
    }
}

/// Parse as an absolute http(s)/ws(s) URL and strip trailing slashes
fn validate_base_url(
    backend_id: &str,
    field: &'static str,
    value: &str,
) -> std::result::Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        backend_id: backend_id.to_string(),
        field,
        value: value.to_string(),
        reason,
    };

    let url = reqwest::Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => {}
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    }

    Ok(value.trim_end_matches('/').to_string())
}

impl ConnectionConfig {
    /// Entries whose id starts with `#` are treated as commented out
    pub fn is_commented_out(&self) -> bool {
        self.backend_id.starts_with('#')
    }

    pub fn discover_url(&self) -> String {
        format!("{}{}/{}", self.proxy_base_url, self.paths.request_headers, self.backend_id)
    }

    pub fn request_body_url(&self, id: &str) -> String {
        format!("{}{}/{}/{}", self.proxy_base_url, self.paths.request_body, self.backend_id, id)
    }

    pub fn response_headers_url(&self) -> String {
        format!("{}{}/{}", self.proxy_base_url, self.paths.response_headers, self.backend_id)
    }

    pub fn response_body_url(&self, id: &str) -> String {
        format!("{}{}/{}/{}", self.proxy_base_url, self.paths.response_body, self.backend_id, id)
    }

    pub fn transfer_error_url(&self, id: &str) -> String {
        format!("{}{}/{}/{}", self.proxy_base_url, self.paths.transfer_error, self.backend_id, id)
    }

    /// WebSocket endpoint for the duplex transport
    pub fn web_socket_url(&self) -> String {
        let base = &self.proxy_base_url;
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.clone()
        };
        format!("{}{}", ws_base, self.paths.web_socket)
    }
}

#[cfg(test)]
pub(crate) fn test_connection(proxy: &str, backend: &str) -> ConnectionConfig {
    ConnectionConfig {
        backend_id: "b1".to_string(),
        proxy_base_url: proxy.trim_end_matches('/').to_string(),
        backend_base_url: backend.trim_end_matches('/').to_string(),
        excluded: false,
        transport: TransportKind::Polling,
        request_timeout: Duration::from_millis(default_request_timeout_millis()),
        max_concurrency: default_max_concurrency(),
        max_in_flight: None,
        discovery_timeout: Duration::from_millis(2_000),
        paths: ProxyPaths::default(),
    }
}
