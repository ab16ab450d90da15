//! Gateway runtime configuration.
//!
//! The gateway keeps no configuration file; it reads environment
//! overrides and CLI flags (flags win). Recognized environment:
//!
//! | Variable | Effect |
//! |---|---|
//! | `AETHER_LISTEN` | UDP bind address |
//! | `AETHER_PSK` | Pre-shared key |
//! | `AETHER_CERT` / `AETHER_KEY` | TLS certificate/key PEM paths |
//! | `AETHER_WINDOW_PROFILE` | `conservative` / `normal` / `aggressive` |

use std::str::FromStr;

use crate::error::GatewayError;

/// QUIC receive-window sizing presets.
///
/// Larger windows keep high-BDP links busy at the cost of per-connection
/// memory; the profile picks the trade-off without exposing raw numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowProfile {
    /// Small windows for memory-constrained hosts.
    Conservative,
    /// Balanced default.
    #[default]
    Normal,
    /// Large windows for high-BDP links.
    Aggressive,
}

impl WindowProfile {
    /// (per-stream receive window, connection receive window) in bytes.
    #[must_use]
    pub fn windows(self) -> (u32, u32) {
        match self {
            Self::Conservative => (256 * 1024, 1024 * 1024),
            Self::Normal => (2 * 1024 * 1024, 8 * 1024 * 1024),
            Self::Aggressive => (8 * 1024 * 1024, 32 * 1024 * 1024),
        }
    }
}

impl FromStr for WindowProfile {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "normal" => Ok(Self::Normal),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(GatewayError::Config(format!("unknown window profile '{other}'"))),
        }
    }
}

/// Assembled gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// UDP bind address.
    pub listen: String,
    /// Pre-shared key (trimmed).
    pub psk: String,
    /// TLS certificate PEM path; absent means self-signed (testing).
    pub cert_path: Option<String>,
    /// TLS private key PEM path.
    pub key_path: Option<String>,
    /// Receive-window preset.
    pub window_profile: WindowProfile,
}

impl GatewayConfig {
    /// Read environment overrides; unset variables keep defaults.
    pub fn from_env() -> Result<Self, GatewayError> {
        let window_profile = match std::env::var("AETHER_WINDOW_PROFILE") {
            Ok(raw) => raw.parse()?,
            Err(_) => WindowProfile::default(),
        };
        Ok(Self {
            listen: std::env::var("AETHER_LISTEN").unwrap_or_else(|_| "0.0.0.0:4433".to_string()),
            psk: std::env::var("AETHER_PSK").map(|p| p.trim().to_string()).unwrap_or_default(),
            cert_path: std::env::var("AETHER_CERT").ok(),
            key_path: std::env::var("AETHER_KEY").ok(),
            window_profile,
        })
    }

    /// Reject configurations the gateway cannot serve with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.psk.is_empty() {
            return Err(GatewayError::Config(
                "PSK must be set (AETHER_PSK or --psk)".to_string(),
            ));
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(GatewayError::Config(
                "certificate and key must be provided together".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_profiles_parse() {
        assert_eq!("conservative".parse::<WindowProfile>().unwrap(), WindowProfile::Conservative);
        assert_eq!("Normal".parse::<WindowProfile>().unwrap(), WindowProfile::Normal);
        assert_eq!("AGGRESSIVE".parse::<WindowProfile>().unwrap(), WindowProfile::Aggressive);
        assert!("huge".parse::<WindowProfile>().is_err());
    }

    #[test]
    fn window_sizes_are_ordered() {
        let (cs, cc) = WindowProfile::Conservative.windows();
        let (ns, nc) = WindowProfile::Normal.windows();
        let (gs, gc) = WindowProfile::Aggressive.windows();
        assert!(cs < ns && ns < gs);
        assert!(cc < nc && nc < gc);
    }

    #[test]
    fn empty_psk_rejected() {
        let config = GatewayConfig {
            listen: "0.0.0.0:4433".to_string(),
            psk: String::new(),
            cert_path: None,
            key_path: None,
            window_profile: WindowProfile::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cert_without_key_rejected() {
        let config = GatewayConfig {
            listen: "0.0.0.0:4433".to_string(),
            psk: "k".to_string(),
            cert_path: Some("cert.pem".to_string()),
            key_path: None,
            window_profile: WindowProfile::default(),
        };
        assert!(config.validate().is_err());
    }
}
