//! Session configuration: timeouts, rate behavior, rendezvous transport.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OscarError;

/// Top-level configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscarConfig {
    /// Physical connection settings.
    pub connection: ConnectionConfig,
    /// Rate-limit behavior.
    pub rates: RateConfig,
    /// Peer-to-peer negotiation settings.
    pub rendezvous: RendezvousConfig,
}

/// Physical connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Seconds between keepalive frames.
    pub keepalive_interval_secs: u64,
    /// A connection with no inbound traffic for this many keepalive
    /// intervals is declared dead.
    pub dead_after_intervals: u32,
    /// Socket connect deadline in milliseconds.
    pub connect_timeout_ms: u64,
    /// Open-handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
    /// How long a service redirect may stay unanswered.
    pub redirect_timeout_secs: u64,
    /// Largest accepted frame body.
    pub max_frame_body: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
}

/// Rate-limit behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Delay sends that would push a rate class below its alert level.
    pub self_throttle: bool,
    /// Extra headroom kept above the alert level, in level units.
    pub alert_margin: u32,
}

/// Peer-to-peer negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Address to bind direct-connection listeners on.
    pub listen_ip: String,
    /// IPv4 address advertised to peers; empty means the listener's address.
    pub advertised_ip: String,
    /// Rendezvous proxy host.
    pub proxy_host: String,
    /// Rendezvous proxy port.
    pub proxy_port: u16,
    /// Direct and proxy socket connect deadline in milliseconds.
    pub connect_timeout_ms: u64,
    /// How long a negotiation may sit in one stage before failing.
    pub stage_timeout_secs: u64,
    /// Fall back to the proxy stages when a direct attempt fails.
    pub proxy_fallback: bool,
    /// Interval between stage-deadline sweeps in milliseconds.
    pub sweep_interval_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for OscarConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            rates: RateConfig::default(),
            rendezvous: RendezvousConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 60,
            dead_after_intervals: 3,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            redirect_timeout_secs: 30,
            max_frame_body: crate::packet::MAX_BODY_SIZE,
            outbound_queue: 256,
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            self_throttle: true,
            alert_margin: 100,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".into(),
            advertised_ip: String::new(),
            proxy_host: "ars.oscar.aol.com".into(),
            proxy_port: 5190,
            connect_timeout_ms: 5_000,
            stage_timeout_secs: 120,
            proxy_fallback: true,
            sweep_interval_ms: 1_000,
        }
    }
}

// ── Durations ────────────────────────────────────────────────────

impl ConnectionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    /// Silence longer than this marks the connection dead.
    pub fn dead_after(&self) -> Duration {
        self.keepalive_interval() * self.dead_after_intervals.max(1)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_secs(self.redirect_timeout_secs)
    }
}

impl RendezvousConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    pub fn proxy_address(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl OscarConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, OscarError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, OscarError> {
        toml::to_string_pretty(self).map_err(|e| OscarError::Config(e.to_string()))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = OscarConfig::default().to_toml().unwrap();
        assert!(text.contains("keepalive_interval_secs"));
        assert!(text.contains("proxy_host"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = OscarConfig::from_toml("[rendezvous]\nproxy_port = 443\n").unwrap();
        assert_eq!(cfg.rendezvous.proxy_port, 443);
        assert_eq!(cfg.connection.dead_after_intervals, 3);
        assert!(cfg.rates.self_throttle);
    }

    #[test]
    fn dead_after_is_multiple_of_interval() {
        let mut cfg = ConnectionConfig::default();
        cfg.keepalive_interval_secs = 10;
        cfg.dead_after_intervals = 4;
        assert_eq!(cfg.dead_after(), Duration::from_secs(40));
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = OscarConfig::load(Path::new("/nonexistent/oscar.toml"));
        assert_eq!(cfg.rendezvous.proxy_port, 5190);
    }
}
