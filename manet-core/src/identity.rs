//! Peer identity: radio MACs, live device records and persisted teammates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::packet::Address;
use crate::protocol::{HeartbeatBody, RelayEntry};
use crate::transport::TransportKind;

/// A device counts as online within this window of its last contact.
pub const ONLINE_WINDOW_MS: u64 = 15_000;

/// 48-bit radio MAC. Valid iff not all zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(String);

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);
        for slot in out.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(MacAddress(out))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A node's role on one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Accepts connections from spokes.
    Hub,
    /// Connected out to a hub.
    Spoke,
    Both,
    Off,
    #[default]
    Unknown,
}

impl NodeRole {
    pub fn from_sides(accepting: bool, dialled: bool) -> Self {
        match (accepting, dialled) {
            (true, true) => NodeRole::Both,
            (true, false) => NodeRole::Hub,
            (false, true) => NodeRole::Spoke,
            (false, false) => NodeRole::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Directly connected and recently heard.
    Connected,
    /// Heard recently through relays.
    Online,
    /// Not heard within the online window.
    Stale,
    Offline,
}

/// What is known about a device on one transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkState {
    /// Shortest path heard within the online window.
    pub hops_away: Option<u8>,
    /// When `hops_away` was last heard at its current value.
    pub hops_seen_ms: u64,
    pub last_contact_ms: u64,
    pub role: NodeRole,
}

/// Fields shared by live and persisted records, used for fuzzy matching and merge order.
pub trait IdentityRecord {
    fn address(&self) -> Option<Address>;
    fn macs(&self) -> &BTreeMap<TransportKind, MacAddress>;
    fn transient_id(&self) -> Option<&str>;
    fn last_contact_ms(&self) -> u64;
    /// Count of identifying fields present.
    fn useful_fields(&self) -> usize;

    fn valid_address(&self) -> Option<Address> {
        self.address().filter(|a| a.is_node())
    }

    fn has_valid_mac(&self) -> bool {
        self.macs().values().any(MacAddress::is_valid)
    }

    /// Worth keeping: a valid address or a valid MAC on some transport.
    fn is_useful(&self) -> bool {
        self.valid_address().is_some() || self.has_valid_mac()
    }
}

/// Shared valid address, a shared valid MAC on any transport, or a case-insensitive transient
/// id match (both longer than one character).
pub fn is_likely_same(a: &impl IdentityRecord, b: &impl IdentityRecord) -> bool {
    if let (Some(x), Some(y)) = (a.valid_address(), b.valid_address()) {
        if x == y {
            return true;
        }
    }
    let mac_match = a.macs().iter().any(|(transport, mac)| {
        mac.is_valid() && b.macs().get(transport).is_some_and(|other| other == mac)
    });
    if mac_match {
        return true;
    }
    match (a.transient_id(), b.transient_id()) {
        (Some(x), Some(y)) => x.len() > 1 && y.len() > 1 && x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

/// Merge precedence: a valid address beats none, then more useful fields, then the more
/// recent contact. Ties favour `a`.
pub fn outranks(a: &impl IdentityRecord, b: &impl IdentityRecord) -> bool {
    let a_addr = a.valid_address().is_some();
    let b_addr = b.valid_address().is_some();
    if a_addr != b_addr {
        return a_addr;
    }
    let (fa, fb) = (a.useful_fields(), b.useful_fields());
    if fa != fb {
        return fa > fb;
    }
    a.last_contact_ms() >= b.last_contact_ms()
}

fn fill_macs(
    into: &mut BTreeMap<TransportKind, MacAddress>,
    from: &BTreeMap<TransportKind, MacAddress>,
) {
    for (transport, mac) in from {
        if mac.is_valid() {
            let slot = into.entry(*transport).or_default();
            if !slot.is_valid() {
                *slot = *mac;
            }
        }
    }
}

/// Live peer record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Device {
    pub address: Option<Address>,
    pub extended_id: Option<Uuid>,
    pub callsign: Option<String>,
    pub macs: BTreeMap<TransportKind, MacAddress>,
    /// Ephemeral network id; never persisted.
    pub transient_id: Option<String>,
    pub links: BTreeMap<TransportKind, LinkState>,
    pub preferred_transport: Option<TransportKind>,
    pub rx_bytes: u64,
    /// Relay table from the device's last detailed heartbeat.
    pub relays: Vec<RelayEntry>,
}

impl IdentityRecord for Device {
    fn address(&self) -> Option<Address> {
        self.address
    }

    fn macs(&self) -> &BTreeMap<TransportKind, MacAddress> {
        &self.macs
    }

    fn transient_id(&self) -> Option<&str> {
        self.transient_id.as_deref()
    }

    fn last_contact_ms(&self) -> u64 {
        self.links
            .values()
            .map(|l| l.last_contact_ms)
            .max()
            .unwrap_or(0)
    }

    fn useful_fields(&self) -> usize {
        usize::from(self.valid_address().is_some())
            + self.macs.values().filter(|m| m.is_valid()).count()
            + usize::from(self.callsign.is_some())
            + usize::from(self.transient_id.is_some())
            + usize::from(self.extended_id.is_some())
    }
}

impl Device {
    /// Fewest hops over all transports.
    pub fn hops_away(&self) -> Option<u8> {
        self.links.values().filter_map(|l| l.hops_away).min()
    }

    /// Hops to `address` according to this device's advertised relay table.
    pub fn hops_to(&self, address: Address) -> Option<u8> {
        self.relays
            .iter()
            .filter(|r| r.address == address)
            .map(|r| r.hops)
            .min()
    }

    pub fn status(&self, now_ms: u64) -> DeviceStatus {
        let last = self.last_contact_ms();
        if last == 0 {
            return DeviceStatus::Offline;
        }
        let age = now_ms.saturating_sub(last);
        if age > ONLINE_WINDOW_MS * 4 {
            DeviceStatus::Offline
        } else if age > ONLINE_WINDOW_MS {
            DeviceStatus::Stale
        } else if self.hops_away() == Some(0) {
            DeviceStatus::Connected
        } else {
            DeviceStatus::Online
        }
    }

    /// Record contact on `transport` at `hops` relays away. Relayed copies of a packet arrive
    /// at higher counts; they only replace a shorter path once it went unheard for the online
    /// window.
    pub fn touch(&mut self, transport: TransportKind, hops: u8, now_ms: u64) {
        let link = self.links.entry(transport).or_default();
        if now_ms < link.last_contact_ms {
            return;
        }
        link.last_contact_ms = now_ms;
        let best_expired = now_ms.saturating_sub(link.hops_seen_ms) > ONLINE_WINDOW_MS;
        if link.hops_away.map_or(true, |h| hops <= h) || best_expired {
            link.hops_away = Some(hops);
            link.hops_seen_ms = now_ms;
        }
    }

    /// Take over detail from a heartbeat body.
    pub fn apply_heartbeat(&mut self, transport: TransportKind, body: &HeartbeatBody) {
        if body.callsign.is_some() {
            self.callsign = body.callsign.clone();
        }
        if body.extended_id.is_some() {
            self.extended_id = body.extended_id;
        }
        for (t, mac) in &body.macs {
            if mac.is_valid() {
                self.macs.insert(*t, *mac);
            }
        }
        for (t, role) in &body.roles {
            self.links.entry(*t).or_default().role = *role;
        }
        self.relays = body.relays.clone();
        if self.preferred_transport.is_none() {
            self.preferred_transport = Some(transport);
        }
    }

    /// Absorb `other`: fill fields absent here, keep the newer per-transport link state and
    /// sum byte tallies.
    pub fn consume(&mut self, other: Device) {
        if self.valid_address().is_none() && other.valid_address().is_some() {
            self.address = other.address;
        }
        if self.extended_id.is_none() {
            self.extended_id = other.extended_id;
        }
        if self.callsign.is_none() {
            self.callsign = other.callsign;
        }
        if self.transient_id.is_none() {
            self.transient_id = other.transient_id;
        }
        if self.preferred_transport.is_none() {
            self.preferred_transport = other.preferred_transport;
        }
        fill_macs(&mut self.macs, &other.macs);
        for (transport, link) in other.links {
            match self.links.get_mut(&transport) {
                Some(mine) if mine.last_contact_ms >= link.last_contact_ms => {
                    if mine.role == NodeRole::Unknown {
                        mine.role = link.role;
                    }
                }
                _ => {
                    self.links.insert(transport, link);
                }
            }
        }
        if self.relays.is_empty() {
            self.relays = other.relays;
        }
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
    }
}

fn enabled_default() -> bool {
    true
}

/// Persisted peer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTeammate {
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default)]
    pub macs: BTreeMap<TransportKind, MacAddress>,
    #[serde(skip)]
    pub transient_id: Option<String>,
    #[serde(default)]
    pub last_contact_ms: u64,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl Default for SavedTeammate {
    fn default() -> Self {
        Self {
            address: None,
            callsign: None,
            macs: BTreeMap::new(),
            transient_id: None,
            last_contact_ms: 0,
            enabled: true,
        }
    }
}

impl IdentityRecord for SavedTeammate {
    fn address(&self) -> Option<Address> {
        self.address
    }

    fn macs(&self) -> &BTreeMap<TransportKind, MacAddress> {
        &self.macs
    }

    fn transient_id(&self) -> Option<&str> {
        self.transient_id.as_deref()
    }

    fn last_contact_ms(&self) -> u64 {
        self.last_contact_ms
    }

    fn useful_fields(&self) -> usize {
        usize::from(self.valid_address().is_some())
            + self.macs.values().filter(|m| m.is_valid()).count()
            + usize::from(self.callsign.is_some())
            + usize::from(self.transient_id.is_some())
    }
}

impl SavedTeammate {
    pub fn from_device(device: &Device) -> Self {
        let mut t = SavedTeammate::default();
        t.update_from(device);
        t
    }

    /// Refresh from a live device: newer contact, filled-in address, MACs, callsign.
    pub fn update_from(&mut self, device: &Device) {
        if let Some(addr) = device.valid_address() {
            self.address = Some(addr);
        }
        if device.callsign.is_some() {
            self.callsign = device.callsign.clone();
        }
        if device.transient_id.is_some() {
            self.transient_id = device.transient_id.clone();
        }
        for (transport, mac) in &device.macs {
            if mac.is_valid() {
                self.macs.insert(*transport, *mac);
            }
        }
        self.last_contact_ms = self.last_contact_ms.max(device.last_contact_ms());
    }

    /// Absorb `other`, filling fields absent here.
    pub fn consume(&mut self, other: SavedTeammate) {
        if self.valid_address().is_none() && other.valid_address().is_some() {
            self.address = other.address;
        }
        if self.callsign.is_none() {
            self.callsign = other.callsign;
        }
        if self.transient_id.is_none() {
            self.transient_id = other.transient_id;
        }
        fill_macs(&mut self.macs, &other.macs);
        self.last_contact_ms = self.last_contact_ms.max(other.last_contact_ms);
        // an explicit disable on either copy wins
        self.enabled = self.enabled && other.enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x02, 0, 0, 0, 0, last])
    }

    fn teammate(address: Option<u32>, bt: Option<MacAddress>, tid: Option<&str>) -> SavedTeammate {
        let mut t = SavedTeammate {
            address: address.map(Address),
            transient_id: tid.map(String::from),
            ..Default::default()
        };
        if let Some(m) = bt {
            t.macs.insert(TransportKind::Bluetooth, m);
        }
        t
    }

    #[test]
    fn mac_text_form() {
        let m: MacAddress = "aa:BB:01:02:03:0f".parse().unwrap();
        assert_eq!(m.to_string(), "AA:BB:01:02:03:0F");
        assert!(m.is_valid());
        assert!(!MacAddress::default().is_valid());
        assert!("aa:bb".parse::<MacAddress>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddress>().is_err());
    }

    #[test]
    fn likely_same_on_any_shared_identifier() {
        assert!(is_likely_same(
            &teammate(Some(5), None, None),
            &teammate(Some(5), Some(mac(9)), None)
        ));
        assert!(is_likely_same(
            &teammate(None, Some(mac(1)), None),
            &teammate(Some(8), Some(mac(1)), None)
        ));
        assert!(is_likely_same(
            &teammate(None, None, Some("Net-Alpha")),
            &teammate(None, None, Some("net-alpha"))
        ));
    }

    #[test]
    fn distinct_records_are_not_same() {
        assert!(!is_likely_same(
            &teammate(Some(5), Some(mac(1)), Some("a1")),
            &teammate(Some(6), Some(mac(2)), Some("b2"))
        ));
        // invalid identifiers never match
        assert!(!is_likely_same(
            &teammate(Some(0), Some(MacAddress::default()), Some("x")),
            &teammate(Some(0), Some(MacAddress::default()), Some("x"))
        ));
    }

    #[test]
    fn mac_on_different_transports_does_not_match() {
        let mut a = teammate(None, None, None);
        a.macs.insert(TransportKind::WifiAware, mac(1));
        let b = teammate(None, Some(mac(1)), None);
        assert!(!is_likely_same(&a, &b));
    }

    #[test]
    fn precedence_order() {
        let addressed = teammate(Some(3), None, None);
        let rich = teammate(None, Some(mac(1)), Some("id"));
        assert!(outranks(&addressed, &rich));
        assert!(!outranks(&rich, &addressed));

        let mut older = teammate(Some(3), Some(mac(1)), None);
        older.last_contact_ms = 10;
        let mut newer = older.clone();
        newer.last_contact_ms = 20;
        assert!(outranks(&newer, &older));
        assert!(!outranks(&older, &newer));
    }

    #[test]
    fn usefulness() {
        assert!(teammate(Some(3), None, None).is_useful());
        assert!(teammate(None, Some(mac(3)), None).is_useful());
        assert!(!teammate(None, Some(MacAddress::default()), Some("tid")).is_useful());
    }

    #[test]
    fn device_consume_fills_gaps() {
        let mut base = Device {
            address: Some(Address(10)),
            ..Default::default()
        };
        base.touch(TransportKind::Bluetooth, 0, 100);
        let mut other = Device {
            callsign: Some("BRAVO".into()),
            rx_bytes: 40,
            ..Default::default()
        };
        other.macs.insert(TransportKind::Bluetooth, mac(4));
        other.touch(TransportKind::Bluetooth, 2, 50);
        other.touch(TransportKind::Sdr, 1, 70);
        base.consume(other);
        assert_eq!(base.callsign.as_deref(), Some("BRAVO"));
        assert_eq!(base.macs.get(&TransportKind::Bluetooth), Some(&mac(4)));
        assert_eq!(base.links[&TransportKind::Bluetooth].hops_away, Some(0));
        assert_eq!(base.links[&TransportKind::Sdr].hops_away, Some(1));
        assert_eq!(base.rx_bytes, 40);
    }

    #[test]
    fn status_follows_contact_age() {
        let mut d = Device::default();
        assert_eq!(d.status(1_000), DeviceStatus::Offline);
        d.touch(TransportKind::Bluetooth, 0, 1_000);
        assert_eq!(d.status(2_000), DeviceStatus::Connected);
        let relayed = 1_000 + ONLINE_WINDOW_MS + 1;
        d.touch(TransportKind::Bluetooth, 2, relayed);
        assert_eq!(d.status(relayed), DeviceStatus::Online);
        assert_eq!(d.status(relayed + ONLINE_WINDOW_MS + 1), DeviceStatus::Stale);
        assert_eq!(
            d.status(relayed + ONLINE_WINDOW_MS * 4 + 1),
            DeviceStatus::Offline
        );
    }

    #[test]
    fn relayed_copies_keep_the_shortest_path() {
        const BT: TransportKind = TransportKind::Bluetooth;
        let mut d = Device::default();
        d.touch(BT, 0, 1_000);
        d.touch(BT, 3, 1_050);
        d.touch(BT, 1, 9_000);
        assert_eq!(d.hops_away(), Some(0));
        assert_eq!(d.links[&BT].last_contact_ms, 9_000);
        assert_eq!(d.status(9_000), DeviceStatus::Connected);

        // the direct path went quiet
        let later = 1_000 + ONLINE_WINDOW_MS + 1;
        d.touch(BT, 2, later);
        assert_eq!(d.hops_away(), Some(2));
        d.touch(BT, 1, later + 10);
        assert_eq!(d.hops_away(), Some(1));
        // out-of-order observations are ignored
        d.touch(BT, 0, later - 5);
        assert_eq!(d.hops_away(), Some(1));
    }

    #[test]
    fn teammate_json_skips_transient_id() {
        let t = teammate(Some(7), Some(mac(1)), Some("tid"));
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("02:00:00:00:00:01"));
        assert!(!json.contains("tid"));
        let back: SavedTeammate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.address, Some(Address(7)));
        assert!(back.enabled);
        assert_eq!(back.transient_id, None);
    }
}
