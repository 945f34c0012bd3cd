//! Reconnection planning for saved teammates.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::connection::{ConnectionTable, RemoteId};
use crate::identity::{IdentityRecord, SavedTeammate};
use crate::packet::Address;
use crate::registry::Registry;
use crate::transport::TransportKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconnect {
    pub transport: TransportKind,
    pub remote: RemoteId,
    pub address: Option<Address>,
}

/// Teammates worth dialling on `transport`: enabled, with a MAC there, not already
/// connected. Shuffled, then ordered by fewest known hops, capped by free slots.
pub fn plan_reconnects(
    transport: TransportKind,
    teammates: &[SavedTeammate],
    conns: &ConnectionTable,
    registry: &Registry,
    rng: &mut impl Rng,
) -> Vec<Reconnect> {
    let slots = conns.free_slots(transport);
    if slots == 0 {
        return Vec::new();
    }
    let mut candidates: Vec<(Option<u8>, Reconnect)> = teammates
        .iter()
        .filter(|t| t.enabled)
        .filter_map(|t| {
            let mac = t.macs.get(&transport).filter(|m| m.is_valid())?;
            let remote = RemoteId::Mac(*mac);
            if conns.is_connected(transport, &remote) {
                return None;
            }
            let address = t.valid_address();
            if let Some(key) = address.and_then(|a| registry.by_address(a)) {
                if conns.device_connected(transport, key) {
                    return None;
                }
            }
            let hops = address.and_then(|a| registry.hops_to(a));
            Some((
                hops,
                Reconnect {
                    transport,
                    remote,
                    address,
                },
            ))
        })
        .collect();
    candidates.shuffle(rng);
    // stable: equal hop counts keep their shuffled order; unknown distance sorts last
    candidates.sort_by_key(|(hops, _)| hops.unwrap_or(u8::MAX));
    candidates
        .into_iter()
        .take(slots)
        .map(|(_, r)| r)
        .collect()
}
