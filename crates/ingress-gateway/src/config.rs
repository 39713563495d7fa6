//! Gateway configuration.
//!
//! Values are layered: built-in defaults, then the TOML config file, then
//! `INGRESS_GATEWAY__SECTION__KEY` environment variables.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "ingress-gateway";

/// Prefix for environment overrides, e.g. `INGRESS_GATEWAY__PROXY__PORT`.
pub const ENV_PREFIX: &str = "INGRESS_GATEWAY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    /// Path-rewriting reverse proxy.
    pub proxy: ProxyConfig,
    /// SSE-over-WebSocket bridge.
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when no verbosity flag is given (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub host: String,
    /// Public port the ingress forwards to.
    pub port: u16,
    /// Host of the internal app server.
    pub upstream_host: String,
    /// Port of the internal app server.
    pub upstream_port: u16,
    /// Request header carrying the ingress path prefix.
    pub ingress_header: String,
    /// Total connection attempts for bodyless requests before giving up.
    pub connect_attempts: u32,
    /// Delay between connection attempts in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8099,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 3000,
            ingress_header: "x-ingress-path".to_string(),
            connect_attempts: 5,
            retry_delay_ms: 1000,
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.host, self.port)
    }

    /// `host:port` of the internal app server, also used as the forwarded `Host`.
    pub fn upstream_authority(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address to listen on.
    pub host: String,
    /// Port WebSocket clients connect to.
    pub port: u16,
    /// Base URL of the internal app server.
    pub upstream_url: String,
    /// Path of the streaming chat endpoint on the app server.
    pub chat_path: String,
    /// Messages buffered per connection before the upstream read waits for the client.
    pub outbound_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            upstream_url: "http://127.0.0.1:3000".to_string(),
            chat_path: "/api/chat".to_string(),
            outbound_buffer: 64,
        }
    }
}

impl BridgeConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.host, self.port)
    }

    pub fn chat_url(&self) -> String {
        format!(
            "{}/{}",
            self.upstream_url.trim_end_matches('/'),
            self.chat_path.trim_start_matches('/')
        )
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))
}

impl AppConfig {
    /// Load the config file (if present) with environment overrides applied.
    pub fn load(config_file: &Path) -> Result<Self> {
        Self::load_with_env(config_file, None)
    }

    /// Like [`AppConfig::load`], reading overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(config_file: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let built = Config::builder()
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| format!("loading config from {}", config_file.display()))?;

        built
            .try_deserialize()
            .context("deserializing configuration")
    }
}

/// Write the default configuration, with a short header, to `path`.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}
