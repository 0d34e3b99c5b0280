//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.companion/config.json`) and environment.
//! Onboarding writes the gateway token here; the client settings tune the connection.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::gateway::ReconnectPolicy;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Where the gateway listens and how to authenticate to it.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Connection behavior (timeouts, reconnection, handshake gating).
    #[serde(default)]
    pub client: ClientConfig,
}

/// Gateway address and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Gateway port (default 18789).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Gateway host (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Full WebSocket URL; overrides bind and port when set.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: shared bearer token produced by onboarding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// Sent as connect.auth.token. Overridden by COMPANION_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            url: None,
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Client-side connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Deadline for a single request (default 30000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Hold requests until the connect handshake is accepted (default true).
    #[serde(default = "default_true")]
    pub require_handshake: bool,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            require_handshake: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

/// Reconnect backoff. Set `multiplier` to 1 and `jitter` to 0 for a fixed delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay_ms() -> u64 {
    3_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Resolve the gateway token: env COMPANION_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("COMPANION_GATEWAY_TOKEN")
        .ok()
        .and_then(|s| non_empty(&s))
        .or_else(|| config.gateway.auth.token.as_deref().and_then(non_empty))
}

/// WebSocket URL of the gateway: `gateway.url` if set, else `ws://bind:port`.
pub fn resolve_gateway_url(config: &Config) -> String {
    if let Some(url) = config.gateway.url.as_deref().and_then(non_empty) {
        return url;
    }
    let bind = config.gateway.bind.trim();
    if bind.contains(':') && !bind.starts_with('[') {
        format!("ws://[{}]:{}", bind, config.gateway.port)
    } else {
        format!("ws://{}:{}", bind, config.gateway.port)
    }
}

/// True if the host is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim().trim_start_matches('[').trim_end_matches(']');
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("COMPANION_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".companion").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
