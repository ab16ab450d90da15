//! Client configuration file (JSON).
//!
//! This is the only state the client persists. Unknown keys are rejected
//! so a typo'd option fails loudly instead of silently meaning "default".
//! The PSK is trimmed on load; everything downstream can assume a clean
//! key.

use std::{path::PathBuf, time::Duration};

use aether_core::{
    Rule,
    pump::{DEFAULT_RECORD_PAYLOAD, RecordPolicy},
    rules::{block_ads_rules, bypass_cn_rules},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ClientError, Result},
    rotation::RotationPolicy,
};

/// Default SOCKS5 bind address.
fn default_listen_addr() -> String {
    "127.0.0.1:1080".to_string()
}

/// Default data-record padding ceiling.
fn default_max_padding() -> u16 {
    64
}

fn default_record_payload() -> usize {
    DEFAULT_RECORD_PAYLOAD
}

fn default_pool_min() -> usize {
    1
}

fn default_pool_max() -> usize {
    2
}

/// Rotation policy as it appears in the config file (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotationConfig {
    /// Whether the scheduler runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower bound of the jittered rotation interval.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Upper bound of the jittered rotation interval.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// How long before promotion the successor is pre-warmed.
    #[serde(default = "default_pre_warm_ms")]
    pub pre_warm_ms: u64,
    /// Draw each interval uniformly from `[min, max]`; `false` pins to
    /// `min`.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_true() -> bool {
    true
}

fn default_min_interval_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_interval_ms() -> u64 {
    40 * 60 * 1000
}

fn default_pre_warm_ms() -> u64 {
    30 * 1000
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            pre_warm_ms: default_pre_warm_ms(),
            jitter: true,
        }
    }
}

impl RotationConfig {
    /// Convert to the scheduler's policy type.
    #[must_use]
    pub fn policy(&self) -> RotationPolicy {
        RotationPolicy {
            enabled: self.enabled,
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms.max(self.min_interval_ms)),
            pre_warm: Duration::from_millis(self.pre_warm_ms),
            jitter: self.jitter,
        }
    }
}

/// Upstream endpoint resolved from `url` or the discrete fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// Hostname used for TLS SNI and certificate validation.
    pub host: String,
    /// UDP port of the gateway.
    pub port: u16,
    /// Deployment path (WebTransport bindings; unused by the raw QUIC
    /// binding but preserved from the config).
    pub path: Option<String>,
}

/// The client configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Upstream as a single URL (`https://host:port/path`). Takes
    /// precedence over the discrete fields.
    #[serde(default)]
    pub url: Option<String>,
    /// Upstream hostname.
    #[serde(default)]
    pub server_addr: Option<String>,
    /// Upstream port (default 443).
    #[serde(default)]
    pub server_port: Option<u16>,
    /// Upstream path for WebTransport deployments.
    #[serde(default)]
    pub server_path: Option<String>,

    /// Pre-shared key (whitespace-trimmed on load).
    pub psk: String,

    /// Local SOCKS5 bind address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Local HTTP CONNECT bind address; absent disables the listener.
    #[serde(default)]
    pub http_proxy_addr: Option<String>,
    /// Dial this network address instead of the resolved host, keeping
    /// the TLS SNI from the configured hostname.
    #[serde(default)]
    pub dial_addr: Option<String>,

    /// Upper bound on data-record padding (0 disables padding).
    #[serde(default = "default_max_padding")]
    pub max_padding: u16,
    /// Plaintext cap per Data record.
    #[serde(default = "default_record_payload")]
    pub record_payload_bytes: usize,

    /// Minimum warm sessions to maintain (2 keeps a standby pre-warmed).
    #[serde(default = "default_pool_min")]
    pub session_pool_min: usize,
    /// Maximum concurrent sessions including draining ones.
    #[serde(default = "default_pool_max")]
    pub session_pool_max: usize,

    /// Rotation policy.
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Inject the built-in mainland-bypass rule set.
    #[serde(default)]
    pub bypass_cn: bool,
    /// Inject the built-in ad-block rule set.
    #[serde(default)]
    pub block_ads: bool,
    /// User rule list (evaluated above the built-ins at equal priority).
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Skip TLS certificate verification (testing only).
    #[serde(default)]
    pub allow_insecure: bool,

    /// Emit per-flush latency samples.
    #[serde(default)]
    pub perf_capture_enabled: bool,
    /// Where latency samples are appended as JSON lines.
    #[serde(default)]
    pub perf_capture_path: Option<PathBuf>,
}

impl ClientConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read '{}': {e}", path.display())))?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|e| ClientError::Config(format!("cannot parse '{}': {e}", path.display())))?;

        config.psk = config.psk.trim().to_string();
        config.validate()?;
        Ok(config)
    }

    /// Validate an in-memory configuration.
    pub fn validate(&self) -> Result<()> {
        if self.psk.trim().is_empty() {
            return Err(ClientError::Config("psk must not be empty".to_string()));
        }
        if self.url.is_none() && self.server_addr.is_none() {
            return Err(ClientError::Config(
                "either url or server_addr must be set".to_string(),
            ));
        }
        if self.session_pool_min == 0 || self.session_pool_min > self.session_pool_max {
            return Err(ClientError::Config(format!(
                "session pool bounds invalid: min {} max {}",
                self.session_pool_min, self.session_pool_max
            )));
        }
        if self.rotation.min_interval_ms == 0
            || self.rotation.max_interval_ms < self.rotation.min_interval_ms
        {
            return Err(ClientError::Config(format!(
                "rotation interval bounds invalid: min {}ms max {}ms",
                self.rotation.min_interval_ms, self.rotation.max_interval_ms
            )));
        }
        self.endpoint().map(|_| ())
    }

    /// Resolve the upstream endpoint from `url` or the discrete fields.
    pub fn endpoint(&self) -> Result<ServerEndpoint> {
        if let Some(url) = &self.url {
            return parse_endpoint_url(url);
        }

        let host = self
            .server_addr
            .clone()
            .ok_or_else(|| ClientError::Config("server_addr missing".to_string()))?;
        Ok(ServerEndpoint {
            host,
            port: self.server_port.unwrap_or(443),
            path: self.server_path.clone(),
        })
    }

    /// Effective rule list: user rules plus any built-in sets.
    #[must_use]
    pub fn effective_rules(&self) -> Vec<Rule> {
        let mut rules = self.rules.clone();
        if self.block_ads {
            rules.extend(block_ads_rules());
        }
        if self.bypass_cn {
            rules.extend(bypass_cn_rules());
        }
        rules
    }

    /// Record policy for all senders created by this client.
    #[must_use]
    pub fn record_policy(&self) -> RecordPolicy {
        RecordPolicy::new(self.max_padding, self.record_payload_bytes)
    }

    /// Whether a standby session should be kept warm between rotations.
    #[must_use]
    pub fn keep_standby_warm(&self) -> bool {
        self.session_pool_min >= 2
    }
}

/// Parse `scheme://host:port/path`, `host:port`, or bare `host`.
fn parse_endpoint_url(url: &str) -> Result<ServerEndpoint> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, Some(format!("/{path}"))),
        None => (rest, None),
    };

    if authority.is_empty() {
        return Err(ClientError::Config(format!("no host in url '{url}'")));
    }

    // Bracketed IPv6 literals keep their colons.
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| ClientError::Config(format!("unclosed '[' in url '{url}'")))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p, url)?,
            None => 443,
        };
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), parse_port(port, url)?),
            None => (authority.to_string(), 443),
        }
    };

    if host.is_empty() {
        return Err(ClientError::Config(format!("no host in url '{url}'")));
    }

    Ok(ServerEndpoint { host, port, path })
}

fn parse_port(raw: &str, url: &str) -> Result<u16> {
    raw.parse::<u16>()
        .map_err(|e| ClientError::Config(format!("bad port in url '{url}': {e}")))
}
