//! Live connection table: one entry per open channel on any transport.

use std::collections::BTreeMap;
use std::fmt;

use crate::identity::{MacAddress, NodeRole};
use crate::registry::DeviceKey;
use crate::transport::{InboundDecoder, TransportKind};

/// Host-visible handle for one live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the transport names the far end before its identity is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RemoteId {
    Mac(MacAddress),
    /// Transport-specific handle such as a socket address or device path.
    Handle(String),
}

impl RemoteId {
    pub fn mac(&self) -> Option<MacAddress> {
        match self {
            RemoteId::Mac(m) if m.is_valid() => Some(*m),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Mac(m) => write!(f, "{m}"),
            RemoteId::Handle(h) => f.write_str(h),
        }
    }
}

/// Which side set the channel up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We accepted; the remote is our client.
    Server,
    /// We dialled out.
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection congested until {until_ms}")]
    Congested { until_ms: u64 },
    #[error("connection stale")]
    Stale,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("{0} is at its connection limit")]
    Limit(TransportKind),
    #[error("unknown connection {0}")]
    Unknown(ConnectionId),
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub remote: RemoteId,
    pub role: LinkRole,
    /// Resolved peer, once an identifying packet has arrived.
    pub device: Option<DeviceKey>,
    pub opened_ms: u64,
    pub last_rx_ms: u64,
    pub last_tx_ms: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    congested_until_ms: u64,
    write_failures: u32,
    active: bool,
    pub(crate) decoder: InboundDecoder,
}

impl Connection {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_congested(&self, now_ms: u64) -> bool {
        now_ms < self.congested_until_ms
    }

    pub fn write_failures(&self) -> u32 {
        self.write_failures
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.opened_ms.max(self.last_rx_ms).max(self.last_tx_ms)
    }
}

/// Lifecycle limits, copied out of the core configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_per_transport: usize,
    pub congestion_cooldown_ms: u64,
    pub stale_after_ms: u64,
    pub min_age_ms: u64,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_per_transport: 4,
            congestion_cooldown_ms: 5_000,
            stale_after_ms: 300_000,
            min_age_ms: 10_000,
        }
    }
}

pub struct ConnectionTable {
    limits: ConnectionLimits,
    conns: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl ConnectionTable {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            limits,
            conns: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Register a new channel. An existing connection to the same remote on the same
    /// transport is evicted first; its id is returned for the host to close.
    pub fn open(
        &mut self,
        transport: TransportKind,
        remote: RemoteId,
        role: LinkRole,
        decoder: InboundDecoder,
        now_ms: u64,
    ) -> Result<(ConnectionId, Vec<ConnectionId>), ConnectionError> {
        let evicted: Vec<ConnectionId> = self
            .conns
            .values()
            .filter(|c| c.transport == transport && c.remote == remote)
            .map(|c| c.id)
            .collect();
        for id in &evicted {
            self.conns.remove(id);
        }
        if self.count(transport) >= self.limits.max_per_transport {
            return Err(ConnectionError::Limit(transport));
        }
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.conns.insert(
            id,
            Connection {
                id,
                transport,
                remote,
                role,
                device: None,
                opened_ms: now_ms,
                last_rx_ms: 0,
                last_tx_ms: 0,
                rx_bytes: 0,
                tx_bytes: 0,
                congested_until_ms: 0,
                write_failures: 0,
                active: true,
                decoder,
            },
        );
        Ok((id, evicted))
    }

    pub fn close(&mut self, id: ConnectionId) -> Option<Connection> {
        self.conns.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.conns.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn count(&self, transport: TransportKind) -> usize {
        self.conns
            .values()
            .filter(|c| c.transport == transport)
            .count()
    }

    pub fn free_slots(&self, transport: TransportKind) -> usize {
        self.limits
            .max_per_transport
            .saturating_sub(self.count(transport))
    }

    pub fn is_connected(&self, transport: TransportKind, remote: &RemoteId) -> bool {
        self.conns
            .values()
            .any(|c| c.active && c.transport == transport && &c.remote == remote)
    }

    pub fn device_connected(&self, transport: TransportKind, device: DeviceKey) -> bool {
        self.conns
            .values()
            .any(|c| c.active && c.transport == transport && c.device == Some(device))
    }

    /// Whether any connection is bound to `device`.
    pub fn is_live(&self, device: DeviceKey) -> bool {
        self.conns.values().any(|c| c.device == Some(device))
    }

    pub fn record_rx(&mut self, id: ConnectionId, bytes: usize, now_ms: u64) {
        if let Some(c) = self.conns.get_mut(&id) {
            c.rx_bytes = c.rx_bytes.saturating_add(bytes as u64);
            c.last_rx_ms = now_ms;
        }
    }

    /// The host finished writing `bytes` to `id`. Queued sends do not count; only a
    /// completed write ends a failure streak.
    pub fn record_tx(&mut self, id: ConnectionId, bytes: usize, now_ms: u64) {
        if let Some(c) = self.conns.get_mut(&id) {
            c.tx_bytes = c.tx_bytes.saturating_add(bytes as u64);
            c.last_tx_ms = now_ms;
            c.write_failures = 0;
        }
    }

    /// A write failed: congest the connection for the cool-down window. Returns
    /// [`ConnectionError::Stale`] once failures have persisted past the staleness bound,
    /// in which case the connection should be closed.
    pub fn mark_write_failed(&mut self, id: ConnectionId, now_ms: u64) -> ConnectionError {
        let limits = self.limits;
        let Some(c) = self.conns.get_mut(&id) else {
            return ConnectionError::Unknown(id);
        };
        c.write_failures = c.write_failures.saturating_add(1);
        c.congested_until_ms = now_ms.saturating_add(limits.congestion_cooldown_ms);
        let last_ok = c.opened_ms.max(c.last_tx_ms);
        if c.write_failures > 1 && now_ms.saturating_sub(last_ok) > limits.stale_after_ms {
            c.active = false;
            return ConnectionError::Stale;
        }
        ConnectionError::Congested {
            until_ms: c.congested_until_ms,
        }
    }

    pub fn mark_inactive(&mut self, id: ConnectionId) {
        if let Some(c) = self.conns.get_mut(&id) {
            c.active = false;
        }
    }

    pub fn bind(&mut self, id: ConnectionId, device: DeviceKey) {
        if let Some(c) = self.conns.get_mut(&id) {
            c.device = Some(device);
        }
    }

    /// Forget which device the connections bound to `device` belong to.
    pub fn unbind(&mut self, device: DeviceKey) {
        for c in self.conns.values_mut() {
            if c.device == Some(device) {
                c.device = None;
            }
        }
    }

    /// Point every connection bound to `from` at `to` (after a registry merge).
    pub fn rebind(&mut self, from: DeviceKey, to: DeviceKey) {
        for c in self.conns.values_mut() {
            if c.device == Some(from) {
                c.device = Some(to);
            }
        }
    }

    /// This node's role on `transport`, from the sides of its active connections.
    pub fn local_role(&self, transport: TransportKind) -> NodeRole {
        let mut accepting = false;
        let mut dialled = false;
        for c in self
            .conns
            .values()
            .filter(|c| c.active && c.transport == transport)
        {
            match c.role {
                LinkRole::Server => accepting = true,
                LinkRole::Client => dialled = true,
            }
        }
        NodeRole::from_sides(accepting, dialled)
    }

    /// Connections to close: duplicates of one remote or device (keeping the active, newest),
    /// inactive ones, and ones idle past the staleness bound once past the minimum age.
    pub fn sweep(&self, now_ms: u64) -> Vec<(ConnectionId, ConnectionError)> {
        let mut doomed: BTreeMap<ConnectionId, ConnectionError> = BTreeMap::new();

        let mut keep_by_remote: BTreeMap<(TransportKind, &RemoteId), &Connection> =
            BTreeMap::new();
        let mut keep_by_device: BTreeMap<(TransportKind, DeviceKey), &Connection> =
            BTreeMap::new();
        for c in self.conns.values() {
            if let Some(loser) = keep_better(&mut keep_by_remote, (c.transport, &c.remote), c) {
                doomed.insert(loser, ConnectionError::Stale);
            }
            if let Some(device) = c.device {
                if let Some(loser) = keep_better(&mut keep_by_device, (c.transport, device), c) {
                    doomed.insert(loser, ConnectionError::Stale);
                }
            }
        }

        for c in self.conns.values() {
            if !c.active {
                doomed.entry(c.id).or_insert(ConnectionError::Stale);
                continue;
            }
            let age = now_ms.saturating_sub(c.opened_ms);
            let idle = now_ms.saturating_sub(c.last_activity_ms());
            if age > self.limits.min_age_ms && idle > self.limits.stale_after_ms {
                doomed.entry(c.id).or_insert(ConnectionError::Stale);
            }
        }
        doomed.into_iter().collect()
    }
}

/// Keep the better of the stored and the new connection under `key`; returns the loser.
fn keep_better<'a, K: Ord>(
    kept: &mut BTreeMap<K, &'a Connection>,
    key: K,
    candidate: &'a Connection,
) -> Option<ConnectionId> {
    match kept.get(&key) {
        None => {
            kept.insert(key, candidate);
            None
        }
        Some(&current) => {
            let better = (candidate.active, candidate.opened_ms, candidate.id)
                > (current.active, current.opened_ms, current.id);
            if better {
                let loser = current.id;
                kept.insert(key, candidate);
                Some(loser)
            } else {
                Some(candidate.id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ConnectionTable {
        ConnectionTable::new(ConnectionLimits::default())
    }

    fn handle(s: &str) -> RemoteId {
        RemoteId::Handle(s.to_string())
    }

    fn open(t: &mut ConnectionTable, remote: &str, role: LinkRole, now: u64) -> ConnectionId {
        t.open(
            TransportKind::WifiAware,
            handle(remote),
            role,
            InboundDecoder::size_prefixed(),
            now,
        )
        .unwrap()
        .0
    }

    #[test]
    fn reopen_evicts_same_remote() {
        let mut t = table();
        let first = open(&mut t, "a", LinkRole::Server, 0);
        let (second, evicted) = t
            .open(
                TransportKind::WifiAware,
                handle("a"),
                LinkRole::Server,
                InboundDecoder::size_prefixed(),
                10,
            )
            .unwrap();
        assert_eq!(evicted, vec![first]);
        assert_ne!(first, second);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn limit_per_transport() {
        let mut t = table();
        for i in 0..4 {
            open(&mut t, &format!("peer{i}"), LinkRole::Client, 0);
        }
        assert_eq!(t.free_slots(TransportKind::WifiAware), 0);
        assert_eq!(t.free_slots(TransportKind::Bluetooth), 4);
        let err = t
            .open(
                TransportKind::WifiAware,
                handle("peer9"),
                LinkRole::Client,
                InboundDecoder::size_prefixed(),
                0,
            )
            .unwrap_err();
        assert_eq!(err, ConnectionError::Limit(TransportKind::WifiAware));
    }

    #[test]
    fn write_failure_congests_then_goes_stale() {
        let mut t = table();
        let id = open(&mut t, "a", LinkRole::Client, 0);
        t.record_tx(id, 10, 1_000);
        assert_eq!(
            t.mark_write_failed(id, 2_000),
            ConnectionError::Congested { until_ms: 7_000 }
        );
        let c = t.get(id).unwrap();
        assert!(c.is_congested(6_999));
        assert!(!c.is_congested(7_000));
        assert_eq!(t.mark_write_failed(id, 400_000), ConnectionError::Stale);
        assert!(!t.get(id).unwrap().is_active());
        assert_eq!(
            t.mark_write_failed(ConnectionId(99), 0),
            ConnectionError::Unknown(ConnectionId(99))
        );
    }

    #[test]
    fn completed_write_ends_failure_streak() {
        let mut t = table();
        let id = open(&mut t, "a", LinkRole::Client, 0);
        t.mark_write_failed(id, 1_000);
        t.record_tx(id, 10, 390_000);
        assert_eq!(t.get(id).unwrap().write_failures(), 0);
        assert_eq!(
            t.mark_write_failed(id, 400_000),
            ConnectionError::Congested { until_ms: 405_000 }
        );
        // a second failure long after the last completed write is stale
        assert_eq!(t.mark_write_failed(id, 700_000), ConnectionError::Stale);
    }

    #[test]
    fn roles_from_sides() {
        let mut t = table();
        assert_eq!(t.local_role(TransportKind::WifiAware), NodeRole::Off);
        open(&mut t, "a", LinkRole::Server, 0);
        assert_eq!(t.local_role(TransportKind::WifiAware), NodeRole::Hub);
        open(&mut t, "b", LinkRole::Client, 0);
        assert_eq!(t.local_role(TransportKind::WifiAware), NodeRole::Both);
    }

    #[test]
    fn sweep_drops_duplicate_device_and_idle() {
        let mut t = table();
        let old = open(&mut t, "a", LinkRole::Server, 0);
        let new = open(&mut t, "b", LinkRole::Client, 100);
        let idle = open(&mut t, "c", LinkRole::Client, 0);
        t.bind(old, DeviceKey::for_tests(1));
        t.bind(new, DeviceKey::for_tests(1));
        t.record_rx(old, 1, 400_000);
        t.record_rx(new, 1, 400_000);

        let doomed: Vec<ConnectionId> = t.sweep(400_001).into_iter().map(|(id, _)| id).collect();
        assert_eq!(doomed, vec![old, idle]);
    }

    #[test]
    fn young_connections_survive_sweep() {
        let mut t = table();
        open(&mut t, "a", LinkRole::Client, 0);
        assert!(t.sweep(5_000).is_empty());
        let inactive = open(&mut t, "b", LinkRole::Client, 0);
        t.mark_inactive(inactive);
        assert_eq!(t.sweep(5_000), vec![(inactive, ConnectionError::Stale)]);
    }

    #[test]
    fn rebind_moves_connections() {
        let mut t = table();
        let id = open(&mut t, "a", LinkRole::Client, 0);
        t.bind(id, DeviceKey::for_tests(2));
        t.rebind(DeviceKey::for_tests(2), DeviceKey::for_tests(3));
        assert!(t.is_live(DeviceKey::for_tests(3)));
        assert!(!t.is_live(DeviceKey::for_tests(2)));
        assert!(t.device_connected(TransportKind::WifiAware, DeviceKey::for_tests(3)));
        assert!(t.is_connected(TransportKind::WifiAware, &handle("a")));
    }
}
