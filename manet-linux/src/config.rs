//! Load config from file and environment.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use manet_core::CoreConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/manet/config.toml or /etc/manet/config.toml.
/// Env overrides: MANET_LISTEN_PORT, MANET_DISCOVERY_PORT, MANET_ADVERTISE_IP,
/// MANET_SERIAL_DEVICE, MANET_SERIAL_BAUD, MANET_STATE_DIR, MANET_CALLSIGN, MANET_PASSPHRASE.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    /// Mesh tunables passed straight to the core.
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Overrides the generated callsign.
    pub callsign: Option<String>,
    /// Where identity and teammates live (default ~/.local/state/manet).
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Data path TCP port (default 45679).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_true")]
    pub discovery: bool,
    /// LAN address peers can dial; lets teammates reconnect without discovery.
    pub advertise_ip: Option<Ipv4Addr>,
    /// Dialled at startup.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Serial port of the radio peripheral. Opened raw at 8N1.
    pub device: Option<PathBuf>,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoConfig {
    /// Shared passphrase; unset means payloads go out as-is.
    pub passphrase: Option<String>,
}

fn default_listen_port() -> u16 {
    45679
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_true() -> bool {
    true
}
fn default_baud() -> u32 {
    115_200
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            discovery_port: default_discovery_port(),
            discovery: true,
            advertise_ip: None,
            peers: Vec::new(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud: default_baud(),
        }
    }
}

impl Config {
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.node.state_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(h) => PathBuf::from(h).join(".local/state/manet"),
            None => PathBuf::from("/var/lib/manet"),
        }
    }
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

/// Apply `MANET_*` overrides read through `var`. Unparseable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("MANET_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.net.listen_port = p;
    }
    if let Some(p) = var("MANET_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.net.discovery_port = p;
    }
    if let Some(ip) = var("MANET_ADVERTISE_IP").and_then(|s| s.parse().ok()) {
        c.net.advertise_ip = Some(ip);
    }
    if let Some(dev) = var("MANET_SERIAL_DEVICE") {
        c.serial.device = Some(PathBuf::from(dev));
    }
    if let Some(b) = var("MANET_SERIAL_BAUD").and_then(|s| s.parse().ok()) {
        c.serial.baud = b;
    }
    if let Some(dir) = var("MANET_STATE_DIR") {
        c.node.state_dir = Some(PathBuf::from(dir));
    }
    if let Some(cs) = var("MANET_CALLSIGN") {
        c.node.callsign = Some(cs);
    }
    if let Some(p) = var("MANET_PASSPHRASE") {
        c.crypto.passphrase = Some(p);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/manet/config.toml"));
    }
    out.push(PathBuf::from("/etc/manet/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| parse(&s)) {
                Ok(Ok(c)) => {
                    tracing::info!(path = %p.display(), "loaded config");
                    return Some(c);
                }
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "bad config, using defaults"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use manet_core::TransportKind;
    use std::collections::HashMap;

    #[test]
    fn full_file_parses() {
        let c = parse(
            r#"
            [node]
            callsign = "ECHO-1"

            [net]
            listen_port = 5000
            advertise_ip = "192.168.1.20"
            peers = ["10.0.0.2:5000"]

            [serial]
            device = "/dev/ttyUSB0"
            baud = 57600

            [core]
            max_connections = 6
            preferred_transport = "wifi_aware"
            fallback = ["sdr"]

            [core.sdr]
            invert_output = true

            [crypto]
            passphrase = "squad"
            "#,
        )
        .unwrap();
        assert_eq!(c.node.callsign.as_deref(), Some("ECHO-1"));
        assert_eq!(c.net.listen_port, 5000);
        assert_eq!(c.net.discovery_port, 45678);
        assert_eq!(c.net.peers.len(), 1);
        assert_eq!(c.serial.baud, 57_600);
        assert_eq!(c.core.max_connections, 6);
        assert_eq!(c.core.preferred_transport, TransportKind::WifiAware);
        assert_eq!(c.core.fallback, vec![TransportKind::Sdr]);
        assert!(c.core.sdr.invert_output);
        assert_eq!(c.core.heartbeat_interval_ms, 15_000);
        assert_eq!(c.crypto.passphrase.as_deref(), Some("squad"));
    }

    #[test]
    fn empty_file_is_default_and_unknown_keys_fail() {
        let c = parse("").unwrap();
        assert_eq!(c.net.listen_port, 45679);
        assert!(c.net.discovery);
        assert_eq!(c.serial.baud, 115_200);
        assert!(parse("[serial]\nbaud = 9600\n").unwrap().serial.device.is_none());
        assert!(parse("[net]\nproxy_port = 1\n").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MANET_LISTEN_PORT", "7000"),
            ("MANET_DISCOVERY_PORT", "not a port"),
            ("MANET_STATE_DIR", "/tmp/manet-x"),
            ("MANET_ADVERTISE_IP", "10.1.2.3"),
            ("MANET_SERIAL_BAUD", "9600"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.net.listen_port, 7000);
        assert_eq!(c.net.discovery_port, 45678);
        assert_eq!(c.state_dir(), PathBuf::from("/tmp/manet-x"));
        assert_eq!(c.net.advertise_ip, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(c.serial.baud, 9600);
    }
}
