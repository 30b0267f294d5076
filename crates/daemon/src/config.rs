//! Daemon configuration.
//!
//! Loaded from a JSON file; missing fields fall back to defaults and
//! unknown fields are preserved for forward compatibility. A corrupt file
//! logs a warning and yields defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    // ── Network ─────────────────────────────────────────────
    /// libp2p listen port (0 = random).
    pub listen_port: u16,
    /// Bootstrap peer multiaddrs dialed on startup.
    pub bootstrap_addrs: Vec<String>,
    /// Relay node multiaddr (with /p2p/ suffix) used for reservations and
    /// circuit dials. Empty disables relay maintenance.
    pub relay_addr: String,

    // ── Paths ───────────────────────────────────────────────
    /// Where received files land.
    pub download_dir: PathBuf,
    /// Proxy usage history file.
    pub history_path: PathBuf,

    // ── Timing ──────────────────────────────────────────────
    /// Relay reservation renewal period in seconds.
    pub reservation_refresh_secs: u64,
    /// Peer exchange period in seconds.
    pub pex_interval_secs: u64,

    // ── Proxy hosting ───────────────────────────────────────
    /// Local port the tunnel client listens on.
    pub tunnel_port: u16,
    /// Display name advertised in our proxy record.
    pub proxy_name: String,
    /// Location advertised in our proxy record.
    pub proxy_location: String,
    /// Price advertised in our proxy record.
    pub proxy_price: f64,
    /// Bandwidth class advertised in our proxy record.
    pub proxy_bandwidth: String,
    /// Wallet receiving address (stub wallet uses it verbatim).
    pub wallet_address: String,

    /// Unknown fields — preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap_addrs: Vec::new(),
            relay_addr: String::new(),
            download_dir: PathBuf::from("orcanetFiles"),
            history_path: PathBuf::from("orcanetData/proxyHistory.json"),
            reservation_refresh_secs: 300,
            pex_interval_secs: 60,
            tunnel_port: 19483,
            proxy_name: String::new(),
            proxy_location: String::new(),
            proxy_price: 0.0,
            proxy_bandwidth: String::new(),
            wallet_address: String::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, falling back to defaults; a missing file is
    /// normal on first run.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(config) => config,
                Err(e) => {
                    warn!("corrupt config at {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.reservation_refresh_secs, 300);
        assert_eq!(config.pex_interval_secs, 60);
        assert_eq!(config.tunnel_port, 19483);
    }

    #[test]
    fn test_load_save_roundtrip() {
        let path = std::env::temp_dir()
            .join(format!("orcanet-config-{}", std::process::id()))
            .join("config.json");

        let mut config = NodeConfig::default();
        config.listen_port = 61000;
        config.relay_addr = "/ip4/1.2.3.4/tcp/4001/p2p/12D3KooWtest".into();
        config.save_to(&path).unwrap();

        let loaded = NodeConfig::load_from(&path);
        assert_eq!(loaded.listen_port, 61000);
        assert_eq!(loaded.relay_addr, config.relay_addr);

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_missing_fields_fall_back() {
        let config: NodeConfig = serde_json::from_str(r#"{"listen_port": 7}"#).unwrap();
        assert_eq!(config.listen_port, 7);
        assert_eq!(config.pex_interval_secs, 60);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"future_knob": true}"#).unwrap();
        assert!(config.extra.contains_key("future_knob"));
        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["future_knob"], true);
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("orcanet-bad-config-{}", std::process::id()));
        std::fs::write(&path, b"{{{{").unwrap();
        let config = NodeConfig::load_from(&path);
        assert_eq!(config.listen_port, 0);
        std::fs::remove_file(&path).ok();
    }
}
