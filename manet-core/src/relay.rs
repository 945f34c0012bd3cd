//! Relay engine: picks the connections that carry a packet next and frames it per transport.
//!
//! Hop accounting happens once, here, before fan-out. Connection selection is a pure
//! function of the connection table and the registry; the engine only owns the per-transport
//! framers, the payload cipher and the byte tallies.

use std::collections::BTreeMap;

use crate::connection::{Connection, ConnectionId, ConnectionTable, LinkRole};
use crate::crypto::{CipherError, PassThrough, PayloadCipher};
use crate::identity::IdentityRecord;
use crate::packet::{Address, Packet};
use crate::registry::Registry;
use crate::transport::{FramingError, Transport, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("hop limit exceeded ({hops} hops)")]
    HopLimitExceeded { hops: u8 },
    #[error("no connection accepts the packet")]
    NoRoute,
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Where a packet came from, as far as routing cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteContext {
    /// Connection the packet arrived on; never echoed back.
    pub ingress: Option<ConnectionId>,
    /// Only send on connections where this node is the accepting side.
    pub clients_only: bool,
}

impl RouteContext {
    pub fn local() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Framed bytes per connection, in send order.
    pub sends: Vec<(ConnectionId, Vec<u8>)>,
    pub bytes_sent: u64,
    pub used_fallback: bool,
}

impl RouteOutcome {
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.sends.iter().map(|(id, _)| *id)
    }
}

pub struct RelayEngine {
    local: Address,
    max_hops: u8,
    links: BTreeMap<TransportKind, Box<dyn Transport>>,
    cipher: Box<dyn PayloadCipher>,
    tx_bytes: BTreeMap<TransportKind, u64>,
}

impl RelayEngine {
    pub fn new(local: Address, max_hops: u8) -> Self {
        Self {
            local,
            max_hops,
            links: BTreeMap::new(),
            cipher: Box::new(PassThrough),
            tx_bytes: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, link: Box<dyn Transport>) {
        self.links.insert(link.kind(), link);
    }

    pub fn set_cipher(&mut self, cipher: Box<dyn PayloadCipher>) {
        self.cipher = cipher;
    }

    pub fn cipher(&self) -> &dyn PayloadCipher {
        self.cipher.as_ref()
    }

    pub fn link(&self, kind: TransportKind) -> Option<&dyn Transport> {
        self.links.get(&kind).map(|l| l.as_ref())
    }

    pub fn tx_bytes(&self, kind: TransportKind) -> u64 {
        self.tx_bytes.get(&kind).copied().unwrap_or(0)
    }

    /// Seal and frame `packet` for a single transport, bypassing connection selection.
    pub fn frame_direct(
        &mut self,
        kind: TransportKind,
        packet: &Packet,
    ) -> Result<Vec<u8>, RouteError> {
        let bytes = self.cipher.encrypt(&packet.encode())?;
        let link = self.links.get_mut(&kind).ok_or(RouteError::NoRoute)?;
        let framed = link.frame(&bytes)?.concat();
        *self.tx_bytes.entry(kind).or_default() += framed.len() as u64;
        Ok(framed)
    }

    /// Route `packet` over `order` (preferred transport first, then fallbacks).
    ///
    /// Later transports are tried only while nothing has been sent and the packet is not
    /// high-performance-only. High-performance-only packets never ride a slow transport, even
    /// the preferred one. Unreachable destinations yield [`RouteError::NoRoute`], which
    /// callers treat as best-effort loss.
    pub fn route(
        &mut self,
        packet: &mut Packet,
        ctx: RouteContext,
        conns: &ConnectionTable,
        registry: &Registry,
        order: &[TransportKind],
        now_ms: u64,
    ) -> Result<RouteOutcome, RouteError> {
        if packet.header.origin != self.local {
            if packet.exceeds_max_hops(self.max_hops) {
                return Err(RouteError::HopLimitExceeded {
                    hops: packet.header.hop_count,
                });
            }
            packet.increment_hop();
        }
        let packet: &Packet = packet;
        let bytes = self.cipher.encrypt(&packet.encode())?;

        let mut outcome = RouteOutcome::default();
        let mut framing_error = None;
        for (i, transport) in order.iter().enumerate() {
            if i > 0 {
                if !outcome.sends.is_empty() || packet.header.high_performance {
                    break;
                }
                outcome.used_fallback = true;
            }
            let Some(link) = self.links.get_mut(transport) else {
                continue;
            };
            if packet.header.high_performance && !link.is_high_performance() {
                continue;
            }
            let caps = LinkCaps {
                unresolved_broadcast: link.allows_unresolved_broadcast(),
                shared: link.is_shared_medium(),
            };
            let targets: Vec<ConnectionId> = conns
                .iter()
                .filter(|c| c.transport == *transport)
                .filter(|c| accepts(c, packet, ctx, registry, caps, now_ms))
                .map(|c| c.id)
                .collect();
            if targets.is_empty() {
                continue;
            }
            let frames = match link.frame(&bytes) {
                Ok(f) => f.concat(),
                Err(e) => {
                    tracing::debug!(transport = %transport, error = %e, "cannot frame packet");
                    framing_error = Some(e);
                    continue;
                }
            };
            for id in targets {
                outcome.bytes_sent += frames.len() as u64;
                *self.tx_bytes.entry(*transport).or_default() += frames.len() as u64;
                outcome.sends.push((id, frames.clone()));
            }
        }

        if outcome.sends.is_empty() {
            return Err(match framing_error {
                Some(e) => RouteError::Framing(e),
                None => RouteError::NoRoute,
            });
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkCaps {
    unresolved_broadcast: bool,
    shared: bool,
}

/// Whether `c` should carry `packet` under the skip rules.
fn accepts(
    c: &Connection,
    packet: &Packet,
    ctx: RouteContext,
    registry: &Registry,
    caps: LinkCaps,
    now_ms: u64,
) -> bool {
    if !c.is_active() || ctx.ingress == Some(c.id) {
        return false;
    }
    let header = &packet.header;
    let device = c.device.and_then(|k| registry.device(k));
    match device.and_then(|d| d.valid_address()) {
        None => {
            let open_broadcast = header.destination.is_broadcast() && caps.unresolved_broadcast;
            if !open_broadcast && !(caps.shared && heard_on(c.transport, packet, registry)) {
                return false;
            }
        }
        Some(addr) => {
            if addr == header.origin {
                return false;
            }
            let reaches = header.destination.applies_to(addr)
                || (header.destination.is_node()
                    && device.is_some_and(|d| d.hops_to(header.destination).is_some()));
            if !reaches {
                return false;
            }
        }
    }
    if ctx.clients_only && c.role == LinkRole::Client {
        return false;
    }
    if header.lossy_ok && c.is_congested(now_ms) {
        return false;
    }
    true
}

/// A shared channel reaches `packet`'s destination if some device heard on it is the
/// destination or advertises a route there.
fn heard_on(transport: TransportKind, packet: &Packet, registry: &Registry) -> bool {
    let header = &packet.header;
    registry.devices().any(|(_, d)| {
        d.links.contains_key(&transport)
            && d.valid_address().is_some_and(|addr| {
                addr != header.origin
                    && (header.destination.applies_to(addr)
                        || (header.destination.is_node() && d.hops_to(header.destination).is_some()))
            })
    })
}
