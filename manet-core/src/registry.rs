//! Identity registry: canonical live device records plus the saved-teammate list.
//!
//! Owned by the core; nothing outside this crate mutates a [`Device`] directly.

use std::collections::BTreeMap;

use crate::identity::{
    is_likely_same, outranks, Device, IdentityRecord, MacAddress, SavedTeammate,
};
use crate::packet::Address;
use crate::protocol::HeartbeatBody;
use crate::transport::TransportKind;

/// Stable handle to a live device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(u64);

impl DeviceKey {
    #[cfg(test)]
    pub(crate) fn for_tests(raw: u64) -> Self {
        DeviceKey(raw)
    }
}

/// Partial identity seen on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub address: Option<Address>,
    pub mac: Option<(TransportKind, MacAddress)>,
    pub transient_id: Option<String>,
}

impl Observation {
    pub fn address(address: Address) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }

    pub fn mac(transport: TransportKind, mac: MacAddress) -> Self {
        Self {
            mac: Some((transport, mac)),
            ..Default::default()
        }
    }

    pub fn with_mac(mut self, transport: TransportKind, mac: MacAddress) -> Self {
        self.mac = Some((transport, mac));
        self
    }

    fn valid_address(&self) -> Option<Address> {
        self.address.filter(|a| a.is_node())
    }

    fn valid_mac(&self) -> Option<(TransportKind, MacAddress)> {
        self.mac.filter(|(_, m)| m.is_valid())
    }

    fn valid_transient_id(&self) -> Option<&str> {
        self.transient_id.as_deref().filter(|t| t.len() > 1)
    }

    /// Carries nothing that could identify a peer.
    pub fn is_empty(&self) -> bool {
        self.valid_address().is_none()
            && self.valid_mac().is_none()
            && self.valid_transient_id().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("devices {first:?} and {second:?} both match one observation")]
    Ambiguous { first: DeviceKey, second: DeviceKey },
    #[error("another node claims address {0}")]
    AddressConflict(Address),
}

/// Outcome of [`Registry::learn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Learned {
    pub key: DeviceKey,
    pub created: bool,
    /// Records merged into `key`; their handles are gone.
    pub absorbed: Vec<DeviceKey>,
}

/// Merge two records for one peer: the stronger becomes the base and absorbs the other.
pub fn merge(a: Device, b: Device) -> Device {
    if outranks(&a, &b) {
        let mut base = a;
        base.consume(b);
        base
    } else {
        let mut base = b;
        base.consume(a);
        base
    }
}

fn merge_teammates(a: SavedTeammate, b: SavedTeammate) -> SavedTeammate {
    if outranks(&a, &b) {
        let mut base = a;
        base.consume(b);
        base
    } else {
        let mut base = b;
        base.consume(a);
        base
    }
}

/// Pairwise scan merging every likely-same pair, restarting after each merge.
/// Returns the number of merges.
pub fn dedup_saved_teammates(list: &mut Vec<SavedTeammate>) -> usize {
    let mut merges = 0;
    'restart: loop {
        for i in 0..list.len() {
            for j in i + 1..list.len() {
                if is_likely_same(&list[i], &list[j]) {
                    let b = list.remove(j);
                    let a = list.remove(i);
                    list.insert(i, merge_teammates(a, b));
                    merges += 1;
                    continue 'restart;
                }
            }
        }
        return merges;
    }
}

/// Remove teammates that are not useful. Returns how many were removed.
pub fn prune_saved_teammates(list: &mut Vec<SavedTeammate>) -> usize {
    let before = list.len();
    list.retain(|t| t.is_useful());
    before - list.len()
}

pub struct Registry {
    local: Address,
    devices: BTreeMap<DeviceKey, Device>,
    next_key: u64,
    teammates: Vec<SavedTeammate>,
    teammates_dirty: bool,
}

impl Registry {
    pub fn new(local: Address) -> Self {
        Self {
            local,
            devices: BTreeMap::new(),
            next_key: 1,
            teammates: Vec::new(),
            teammates_dirty: false,
        }
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn device(&self, key: DeviceKey) -> Option<&Device> {
        self.devices.get(&key)
    }

    pub(crate) fn device_mut(&mut self, key: DeviceKey) -> Option<&mut Device> {
        self.devices.get_mut(&key)
    }

    pub fn devices(&self) -> impl Iterator<Item = (DeviceKey, &Device)> {
        self.devices.iter().map(|(k, d)| (*k, d))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn by_address(&self, address: Address) -> Option<DeviceKey> {
        if !address.is_node() {
            return None;
        }
        self.devices
            .iter()
            .find(|(_, d)| d.valid_address() == Some(address))
            .map(|(k, _)| *k)
    }

    /// Look up by address, then MAC, then transient id; first match wins.
    pub fn resolve(&self, obs: &Observation) -> Option<DeviceKey> {
        self.candidates(obs).into_iter().next()
    }

    /// Every record matching any identifier of `obs`, in lookup priority order.
    fn candidates(&self, obs: &Observation) -> Vec<DeviceKey> {
        let mut out: Vec<DeviceKey> = Vec::new();
        let mut push = |k: DeviceKey| {
            if !out.contains(&k) {
                out.push(k);
            }
        };
        if let Some(addr) = obs.valid_address() {
            if let Some(k) = self.by_address(addr) {
                push(k);
            }
        }
        if let Some((transport, mac)) = obs.valid_mac() {
            for (k, d) in &self.devices {
                if d.macs.get(&transport) == Some(&mac) {
                    push(*k);
                }
            }
        }
        if let Some(tid) = obs.valid_transient_id() {
            for (k, d) in &self.devices {
                if d.transient_id
                    .as_deref()
                    .is_some_and(|t| t.len() > 1 && t.eq_ignore_ascii_case(tid))
                {
                    push(*k);
                }
            }
        }
        out
    }

    /// Resolve `obs` to one record, creating or merging as needed, then record contact.
    /// Returns `None` for observations that identify nothing.
    pub fn learn(
        &mut self,
        obs: &Observation,
        transport: TransportKind,
        hops: u8,
        now_ms: u64,
    ) -> Option<Learned> {
        if obs.is_empty() {
            return None;
        }
        let candidates = self.candidates(obs);
        let mut absorbed = Vec::new();
        let (key, created) = match candidates.split_first() {
            None => (self.insert(Device::default()), true),
            Some((&first, rest)) => {
                let mut key = first;
                for &other in rest {
                    let err = IdentityError::Ambiguous {
                        first: key,
                        second: other,
                    };
                    tracing::debug!(error = %err, "merging");
                    let (kept, gone) = self.merge_keys(key, other);
                    key = kept;
                    absorbed.push(gone);
                }
                (key, false)
            }
        };
        if let Some(device) = self.devices.get_mut(&key) {
            if let Some(addr) = obs.valid_address() {
                device.address = Some(addr);
            }
            if let Some((t, mac)) = obs.valid_mac() {
                device.macs.insert(t, mac);
            }
            if let Some(tid) = obs.valid_transient_id() {
                device.transient_id = Some(tid.to_string());
            }
            device.touch(transport, hops, now_ms);
        }
        Some(Learned {
            key,
            created,
            absorbed,
        })
    }

    fn insert(&mut self, device: Device) -> DeviceKey {
        let key = DeviceKey(self.next_key);
        self.next_key += 1;
        self.devices.insert(key, device);
        key
    }

    /// Merge two records; returns `(kept, absorbed)`.
    pub fn merge_keys(&mut self, a: DeviceKey, b: DeviceKey) -> (DeviceKey, DeviceKey) {
        if a == b {
            return (a, b);
        }
        let (da, db) = match (self.devices.remove(&a), self.devices.remove(&b)) {
            (Some(da), Some(db)) => (da, db),
            (Some(da), None) => {
                self.devices.insert(a, da);
                return (a, b);
            }
            (None, Some(db)) => {
                self.devices.insert(b, db);
                return (b, a);
            }
            (None, None) => return (a, b),
        };
        let (kept, gone) = if outranks(&da, &db) { (a, b) } else { (b, a) };
        self.devices.insert(kept, merge(da, db));
        (kept, gone)
    }

    /// Merge live records that denote the same peer. Returns `(absorbed, kept)` pairs.
    pub fn dedup_devices(&mut self) -> Vec<(DeviceKey, DeviceKey)> {
        let mut merged = Vec::new();
        'restart: loop {
            let keys: Vec<DeviceKey> = self.devices.keys().copied().collect();
            for (i, &a) in keys.iter().enumerate() {
                for &b in &keys[i + 1..] {
                    let same = match (self.devices.get(&a), self.devices.get(&b)) {
                        (Some(da), Some(db)) => is_likely_same(da, db),
                        _ => false,
                    };
                    if same {
                        let (kept, gone) = self.merge_keys(a, b);
                        merged.push((gone, kept));
                        continue 'restart;
                    }
                }
            }
            return merged;
        }
    }

    /// Drop devices out of contact for `stale_after_ms` unless `is_live` says a connection
    /// still uses them.
    pub fn cull_stale_devices(
        &mut self,
        now_ms: u64,
        stale_after_ms: u64,
        is_live: impl Fn(DeviceKey) -> bool,
    ) -> Vec<DeviceKey> {
        let stale: Vec<DeviceKey> = self
            .devices
            .iter()
            .filter(|(k, d)| {
                now_ms.saturating_sub(d.last_contact_ms()) > stale_after_ms && !is_live(**k)
            })
            .map(|(k, _)| *k)
            .collect();
        for k in &stale {
            self.devices.remove(k);
        }
        stale
    }

    /// Drop the live record for `address`.
    pub fn forget_device(&mut self, address: Address) -> Option<DeviceKey> {
        let key = self.by_address(address)?;
        self.devices.remove(&key);
        Some(key)
    }

    pub fn apply_heartbeat(&mut self, key: DeviceKey, transport: TransportKind, body: &HeartbeatBody) {
        if let Some(d) = self.devices.get_mut(&key) {
            d.apply_heartbeat(transport, body);
        }
    }

    pub fn record_rx(&mut self, key: DeviceKey, bytes: usize) {
        if let Some(d) = self.devices.get_mut(&key) {
            d.rx_bytes = d.rx_bytes.saturating_add(bytes as u64);
        }
    }

    /// Best known relay distance to `address`, directly or through a neighbour's relay table.
    pub fn hops_to(&self, address: Address) -> Option<u8> {
        let direct = self
            .by_address(address)
            .and_then(|k| self.devices.get(&k))
            .and_then(Device::hops_away);
        let via = self
            .devices
            .values()
            .filter_map(|d| {
                let theirs = d.hops_to(address)?;
                let mine = d.hops_away()?;
                Some(mine.saturating_add(theirs).saturating_add(1))
            })
            .min();
        match (direct, via) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // saved teammates

    /// Replace the teammate list with a loaded one: own address dropped, pruned, deduplicated.
    pub fn load_teammates(&mut self, list: Vec<SavedTeammate>) {
        let before = list.len();
        let local = self.local;
        let mut list: Vec<SavedTeammate> = list
            .into_iter()
            .filter(|t| t.valid_address() != Some(local))
            .collect();
        let pruned = prune_saved_teammates(&mut list);
        let merged = dedup_saved_teammates(&mut list);
        self.teammates_dirty = list.len() != before || pruned + merged > 0;
        self.teammates = list;
    }

    pub fn teammates(&self) -> &[SavedTeammate] {
        &self.teammates
    }

    /// Create or update a teammate for every useful live device.
    pub fn sync_saved_teammates(&mut self) {
        for device in self.devices.values() {
            if !device.is_useful() || device.valid_address() == Some(self.local) {
                continue;
            }
            match self
                .teammates
                .iter_mut()
                .find(|t| is_likely_same(&**t, device))
            {
                Some(t) => {
                    let before = t.clone();
                    t.update_from(device);
                    if *t != before {
                        self.teammates_dirty = true;
                    }
                }
                None => {
                    tracing::info!(address = ?device.address, callsign = ?device.callsign, "new teammate");
                    self.teammates.push(SavedTeammate::from_device(device));
                    self.teammates_dirty = true;
                }
            }
        }
    }

    /// Dedup and prune the teammate list. Returns merges + removals.
    pub fn tidy_teammates(&mut self) -> usize {
        let changed =
            dedup_saved_teammates(&mut self.teammates) + prune_saved_teammates(&mut self.teammates);
        if changed > 0 {
            self.teammates_dirty = true;
        }
        changed
    }

    pub fn remove_teammate(&mut self, address: Address) -> bool {
        let before = self.teammates.len();
        self.teammates.retain(|t| t.valid_address() != Some(address));
        let removed = self.teammates.len() != before;
        self.teammates_dirty |= removed;
        removed
    }

    pub fn set_teammate_enabled(&mut self, address: Address, enabled: bool) -> bool {
        match self
            .teammates
            .iter_mut()
            .find(|t| t.valid_address() == Some(address))
        {
            Some(t) => {
                if t.enabled != enabled {
                    t.enabled = enabled;
                    self.teammates_dirty = true;
                }
                true
            }
            None => false,
        }
    }

    /// True once since the last call if the teammate list changed materially.
    pub fn take_teammates_dirty(&mut self) -> bool {
        std::mem::take(&mut self.teammates_dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x0a, 0, 0, 0, 0, last])
    }

    fn teammate(address: Option<u32>, bt: Option<u8>) -> SavedTeammate {
        let mut t = SavedTeammate {
            address: address.map(Address),
            ..Default::default()
        };
        if let Some(m) = bt {
            t.macs.insert(TransportKind::Bluetooth, mac(m));
        }
        t
    }

    #[test]
    fn resolve_prefers_address_then_mac() {
        let mut reg = Registry::new(Address(1));
        let a = reg
            .learn(&Observation::address(Address(20)), TransportKind::Bluetooth, 1, 10)
            .unwrap();
        let b = reg
            .learn(
                &Observation::mac(TransportKind::Bluetooth, mac(3)),
                TransportKind::Bluetooth,
                0,
                10,
            )
            .unwrap();
        assert!(a.created && b.created);
        assert_ne!(a.key, b.key);
        assert_eq!(reg.resolve(&Observation::address(Address(20))), Some(a.key));
        assert_eq!(
            reg.resolve(&Observation::mac(TransportKind::Bluetooth, mac(3))),
            Some(b.key)
        );
        assert_eq!(reg.resolve(&Observation::address(Address(99))), None);
    }

    #[test]
    fn observation_linking_two_records_merges_them() {
        let mut reg = Registry::new(Address(1));
        let by_addr = reg
            .learn(&Observation::address(Address(20)), TransportKind::Sdr, 2, 10)
            .unwrap()
            .key;
        let by_mac = reg
            .learn(
                &Observation::mac(TransportKind::Bluetooth, mac(3)),
                TransportKind::Bluetooth,
                0,
                20,
            )
            .unwrap()
            .key;
        let learned = reg
            .learn(
                &Observation::address(Address(20)).with_mac(TransportKind::Bluetooth, mac(3)),
                TransportKind::Bluetooth,
                0,
                30,
            )
            .unwrap();
        assert_eq!(reg.len(), 1);
        // the addressed record is the base
        assert_eq!(learned.key, by_addr);
        assert_eq!(learned.absorbed, vec![by_mac]);
        let d = reg.device(learned.key).unwrap();
        assert_eq!(d.address, Some(Address(20)));
        assert_eq!(d.macs.get(&TransportKind::Bluetooth), Some(&mac(3)));
        assert_eq!(d.hops_away(), Some(0));
    }

    #[test]
    fn empty_observation_learns_nothing() {
        let mut reg = Registry::new(Address(1));
        let obs = Observation {
            address: Some(Address::BROADCAST),
            mac: Some((TransportKind::Bluetooth, MacAddress::default())),
            transient_id: Some("x".into()),
        };
        assert!(reg.learn(&obs, TransportKind::Bluetooth, 0, 0).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn merge_precedence_address_wins() {
        let addressed = Device {
            address: Some(Address(5)),
            ..Default::default()
        };
        let mut rich = Device {
            callsign: Some("C".into()),
            transient_id: Some("net".into()),
            ..Default::default()
        };
        rich.macs.insert(TransportKind::Bluetooth, mac(1));
        let merged = merge(rich, addressed);
        assert_eq!(merged.address, Some(Address(5)));
        assert_eq!(merged.callsign.as_deref(), Some("C"));
        assert_eq!(merged.macs.len(), 1);
    }

    #[test]
    fn dedup_merges_and_is_idempotent() {
        let mut list = vec![
            teammate(Some(5), None),
            teammate(None, Some(1)),
            teammate(Some(5), Some(1)),
            teammate(Some(6), Some(2)),
            teammate(None, Some(2)),
            teammate(Some(7), None),
        ];
        let merges = dedup_saved_teammates(&mut list);
        assert_eq!(merges, 3);
        assert_eq!(list.len(), 3);
        let snapshot = list.clone();
        assert_eq!(dedup_saved_teammates(&mut list), 0);
        assert_eq!(list, snapshot);
        let five = list.iter().find(|t| t.address == Some(Address(5))).unwrap();
        assert_eq!(five.macs.get(&TransportKind::Bluetooth), Some(&mac(1)));
    }

    #[test]
    fn prune_drops_useless_entries() {
        let mut list = vec![
            teammate(None, None),
            teammate(Some(0), None),
            teammate(Some(3), None),
            SavedTeammate {
                callsign: Some("ghost".into()),
                ..Default::default()
            },
        ];
        assert_eq!(prune_saved_teammates(&mut list), 3);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn load_filters_self_and_marks_dirty_when_changed() {
        let mut reg = Registry::new(Address(1));
        reg.load_teammates(vec![teammate(Some(2), None), teammate(Some(3), None)]);
        assert!(!reg.take_teammates_dirty());
        reg.load_teammates(vec![teammate(Some(1), None), teammate(Some(2), None)]);
        assert_eq!(reg.teammates().len(), 1);
        assert!(reg.take_teammates_dirty());
        assert!(!reg.take_teammates_dirty());
    }

    #[test]
    fn sync_creates_then_updates_teammates() {
        let mut reg = Registry::new(Address(1));
        let key = reg
            .learn(
                &Observation::address(Address(9)).with_mac(TransportKind::Bluetooth, mac(9)),
                TransportKind::Bluetooth,
                0,
                100,
            )
            .unwrap()
            .key;
        reg.sync_saved_teammates();
        assert!(reg.take_teammates_dirty());
        assert_eq!(reg.teammates().len(), 1);

        reg.sync_saved_teammates();
        assert!(!reg.take_teammates_dirty());

        reg.learn(&Observation::address(Address(9)), TransportKind::Bluetooth, 0, 500);
        reg.sync_saved_teammates();
        assert!(reg.take_teammates_dirty());
        assert_eq!(reg.teammates()[0].last_contact_ms, 500);
        assert!(reg.device(key).is_some());
    }

    #[test]
    fn cull_keeps_live_devices() {
        let mut reg = Registry::new(Address(1));
        let live = reg
            .learn(&Observation::address(Address(2)), TransportKind::Bluetooth, 0, 0)
            .unwrap()
            .key;
        let gone = reg
            .learn(&Observation::address(Address(3)), TransportKind::Bluetooth, 0, 0)
            .unwrap()
            .key;
        let culled = reg.cull_stale_devices(120_000, 60_000, |k| k == live);
        assert_eq!(culled, vec![gone]);
        assert!(reg.device(live).is_some());
    }

    #[test]
    fn hops_via_relay_table() {
        let mut reg = Registry::new(Address(1));
        let neighbour = reg
            .learn(&Observation::address(Address(2)), TransportKind::Bluetooth, 0, 0)
            .unwrap()
            .key;
        let body = HeartbeatBody {
            version: 1,
            callsign: None,
            extended_id: None,
            macs: vec![],
            roles: vec![],
            relays: vec![crate::protocol::RelayEntry {
                address: Address(3),
                hops: 0,
                last_contact_ms: 0,
            }],
        };
        reg.apply_heartbeat(neighbour, TransportKind::Bluetooth, &body);
        assert_eq!(reg.hops_to(Address(3)), Some(1));
        assert_eq!(reg.hops_to(Address(2)), Some(0));
        assert_eq!(reg.hops_to(Address(4)), None);
    }

    #[test]
    fn teammate_removal_and_enable() {
        let mut reg = Registry::new(Address(1));
        reg.load_teammates(vec![teammate(Some(2), None), teammate(Some(3), None)]);
        assert!(reg.set_teammate_enabled(Address(2), false));
        assert!(reg.take_teammates_dirty());
        assert!(reg.remove_teammate(Address(3)));
        assert!(!reg.remove_teammate(Address(3)));
        assert_eq!(reg.teammates().len(), 1);
        assert!(!reg.teammates()[0].enabled);
    }
}
