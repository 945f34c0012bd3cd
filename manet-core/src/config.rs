//! Core tunables. Every field has a default so partial config files deserialize.

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionLimits;
use crate::packet::MAX_HOP_COUNT;
use crate::segment::MAX_SEGMENT_PAYLOAD;
use crate::transport::{BluetoothLink, SdrLink, Transport, TransportKind, WifiAwareLink};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub heartbeat_interval_ms: u64,
    /// Decoder sweeps, connection and registry cleanup.
    pub housekeeping_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_hop_count: u8,
    /// Per transport.
    pub max_connections: usize,
    pub congestion_cooldown_ms: u64,
    pub stale_connection_ms: u64,
    pub min_connection_age_ms: u64,
    pub stale_device_ms: u64,
    pub preferred_transport: TransportKind,
    /// Tried in order after the preferred transport.
    pub fallback: Vec<TransportKind>,
    /// Packets arriving from a spoke are re-broadcast to our own spokes only.
    pub hub_relay_clients_only: bool,
    pub sdr: SdrConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            housekeeping_interval_ms: 500,
            reconnect_interval_ms: 30_000,
            max_hop_count: MAX_HOP_COUNT,
            max_connections: 4,
            congestion_cooldown_ms: 5_000,
            stale_connection_ms: 300_000,
            min_connection_age_ms: 10_000,
            stale_device_ms: 60_000,
            preferred_transport: TransportKind::Bluetooth,
            fallback: vec![
                TransportKind::WifiAware,
                TransportKind::Bluetooth,
                TransportKind::Sdr,
            ],
            hub_relay_clients_only: false,
            sdr: SdrConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdrConfig {
    pub max_segment: usize,
    /// Send segments bit-inverted for peripherals that mangle the normal magic.
    pub invert_output: bool,
}

impl Default for SdrConfig {
    fn default() -> Self {
        Self {
            max_segment: MAX_SEGMENT_PAYLOAD,
            invert_output: false,
        }
    }
}

impl CoreConfig {
    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_per_transport: self.max_connections,
            congestion_cooldown_ms: self.congestion_cooldown_ms,
            stale_after_ms: self.stale_connection_ms,
            min_age_ms: self.min_connection_age_ms,
        }
    }

    /// Preferred transport first, then the fallback chain, without repeats.
    pub fn route_order(&self, preferred: Option<TransportKind>) -> Vec<TransportKind> {
        let mut order = vec![preferred.unwrap_or(self.preferred_transport)];
        for t in &self.fallback {
            if !order.contains(t) {
                order.push(*t);
            }
        }
        order
    }

    /// Link for `kind` configured from this config.
    pub fn link(&self, kind: TransportKind) -> Box<dyn Transport> {
        match kind {
            TransportKind::Bluetooth => Box::new(BluetoothLink),
            TransportKind::WifiAware => Box::new(WifiAwareLink),
            TransportKind::Sdr => Box::new(SdrLink::new(
                self.sdr.max_segment,
                self.sdr.invert_output,
            )),
        }
    }
}
