//! Host-driven API: `MeshCore` receives events from the host and returns actions.
//!
//! The core owns the connection table, the identity registry and the relay engine. It never
//! performs I/O and never reads the clock; every entry point takes the current unix time.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::connection::{ConnectionError, ConnectionId, ConnectionTable, LinkRole, RemoteId};
use crate::crypto::PayloadCipher;
use crate::identity::{IdentityRecord, MacAddress, SavedTeammate};
use crate::listener::{MeshError, MeshListener, NullListener};
use crate::packet::{Address, Packet};
use crate::planner::plan_reconnects;
use crate::protocol::{HeartbeatBody, Payload, RelayEntry, PROTOCOL_VERSION};
use crate::registry::{IdentityError, Observation, Registry};
use crate::relay::{RelayEngine, RouteContext, RouteError};
use crate::transport::{InboundDecoder, InboundEvent, TransportKind};

/// This node's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub address: Address,
    /// Long random id; a heartbeat with our address but another extended id is a collision.
    pub extended_id: Uuid,
    pub callsign: String,
    #[serde(default)]
    pub macs: BTreeMap<TransportKind, MacAddress>,
}

impl LocalIdentity {
    /// Fresh random node address, extended id and callsign.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let address = Address(rng.gen_range(1..0x8000_0000));
        Self {
            address,
            extended_id: Uuid::new_v4(),
            callsign: format!("NODE-{:04X}", rng.gen::<u16>()),
            macs: BTreeMap::new(),
        }
    }
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Send {
        connection: ConnectionId,
        bytes: Vec<u8>,
    },
    Close {
        connection: ConnectionId,
    },
    Connect {
        transport: TransportKind,
        remote: RemoteId,
    },
    /// A packet addressed to this node, for the application.
    Deliver(Packet),
    /// Rewrite the persisted teammate list.
    PersistTeammates(Vec<SavedTeammate>),
}

/// Main coordinator. Host passes events; core returns actions.
pub struct MeshCore {
    identity: LocalIdentity,
    config: CoreConfig,
    registry: Registry,
    conns: ConnectionTable,
    relay: RelayEngine,
    listener: Box<dyn MeshListener>,
    rng: StdRng,
    next_heartbeat_ms: u64,
    next_housekeeping_ms: u64,
    next_reconnect_ms: u64,
    shut_down: bool,
}

impl MeshCore {
    pub fn new(identity: LocalIdentity, config: CoreConfig) -> Self {
        let mut relay = RelayEngine::new(identity.address, config.max_hop_count);
        for kind in TransportKind::ALL {
            relay.register(config.link(kind));
        }
        Self {
            registry: Registry::new(identity.address),
            conns: ConnectionTable::new(config.connection_limits()),
            relay,
            listener: Box::new(NullListener),
            rng: StdRng::from_entropy(),
            next_heartbeat_ms: 0,
            next_housekeeping_ms: 0,
            next_reconnect_ms: 0,
            shut_down: false,
            identity,
            config,
        }
    }

    pub fn with_listener(mut self, listener: Box<dyn MeshListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn set_cipher(&mut self, cipher: Box<dyn PayloadCipher>) {
        self.relay.set_cipher(cipher);
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.conns
    }

    pub fn tx_bytes(&self, transport: TransportKind) -> u64 {
        self.relay.tx_bytes(transport)
    }

    /// Seed the saved-teammate list (typically from disk at startup).
    pub fn load_teammates(&mut self, list: Vec<SavedTeammate>) {
        self.registry.load_teammates(list);
        tracing::info!(count = self.registry.teammates().len(), "loaded teammates");
    }

    /// Forget `address`: the saved record and the live one. A peer still in range is learned
    /// and saved again once heard. The list is persisted on the next housekeeping pass.
    pub fn remove_teammate(&mut self, address: Address) -> bool {
        let removed = self.registry.remove_teammate(address);
        if let Some(key) = self.registry.forget_device(address) {
            self.conns.unbind(key);
        }
        removed
    }

    pub fn set_teammate_enabled(&mut self, address: Address, enabled: bool) -> bool {
        self.registry.set_teammate_enabled(address, enabled)
    }

    /// A channel came up. Returns its id and the actions to run (evictions, a direct heartbeat).
    /// On error the host should drop the channel.
    pub fn on_connection_opened(
        &mut self,
        transport: TransportKind,
        remote: RemoteId,
        role: LinkRole,
        now_ms: u64,
    ) -> Result<(ConnectionId, Vec<OutboundAction>), ConnectionError> {
        if self.shut_down {
            return Err(ConnectionError::Stale);
        }
        let decoder = self
            .relay
            .link(transport)
            .map(|l| l.decoder())
            .unwrap_or_else(InboundDecoder::size_prefixed);
        let (id, evicted) = self
            .conns
            .open(transport, remote.clone(), role, decoder, now_ms)?;
        tracing::info!(connection = %id, %transport, %remote, ?role, "connection opened");

        let mut actions = Vec::new();
        for old in evicted {
            tracing::debug!(connection = %old, "evicted by reconnect");
            actions.push(OutboundAction::Close { connection: old });
            self.listener.on_closed(old, transport);
        }
        if let Some(mac) = remote.mac() {
            if let Some(learned) =
                self.registry
                    .learn(&Observation::mac(transport, mac), transport, 0, now_ms)
            {
                for gone in learned.absorbed {
                    self.conns.rebind(gone, learned.key);
                }
                self.conns.bind(id, learned.key);
            }
        }
        self.listener.on_connected(id, transport, &remote);

        let heartbeat = self.heartbeat(now_ms);
        match self.relay.frame_direct(transport, &heartbeat) {
            Ok(bytes) => {
                actions.push(OutboundAction::Send {
                    connection: id,
                    bytes,
                });
            }
            Err(e) => tracing::warn!(connection = %id, error = %e, "cannot send heartbeat"),
        }
        Ok((id, actions))
    }

    /// Bytes read from a connection.
    pub fn on_bytes_received(
        &mut self,
        id: ConnectionId,
        bytes: &[u8],
        now_ms: u64,
    ) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let (transport, events) = match self.conns.get_mut(id) {
            Some(c) => (c.transport, c.decoder.push(bytes, now_ms)),
            None => {
                tracing::debug!(connection = %id, "bytes for unknown connection");
                return actions;
            }
        };
        self.conns.record_rx(id, bytes.len(), now_ms);
        for event in events {
            match event {
                InboundEvent::Packet(frame) => {
                    self.handle_frame(id, transport, &frame, now_ms, &mut actions)
                }
                InboundEvent::Fatal(e) => {
                    tracing::warn!(connection = %id, error = %e, "unrecoverable framing");
                    self.listener.on_error(Some(id), &MeshError::Frame(e));
                    self.close(id, &mut actions);
                    break;
                }
                other => self.note_decoder_event(transport, other),
            }
        }
        actions
    }

    /// The host finished writing `len` bytes of a [`OutboundAction::Send`] to `id`.
    pub fn on_bytes_written(&mut self, id: ConnectionId, len: usize, now_ms: u64) {
        self.conns.record_tx(id, len, now_ms);
    }

    /// A write to `id` failed. Congests it; closes it once failures have gone stale.
    pub fn on_write_failed(&mut self, id: ConnectionId, now_ms: u64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let err = self.conns.mark_write_failed(id, now_ms);
        tracing::debug!(connection = %id, error = %err, "write failed");
        let stale = err == ConnectionError::Stale;
        self.listener
            .on_error(Some(id), &MeshError::Connection(err));
        if stale {
            self.close(id, &mut actions);
        }
        actions
    }

    /// The host hit an error on `id`; the connection is closed.
    pub fn on_connection_error(
        &mut self,
        id: ConnectionId,
        error: ConnectionError,
    ) -> Vec<OutboundAction> {
        tracing::warn!(connection = %id, %error, "connection error");
        self.listener
            .on_error(Some(id), &MeshError::Connection(error));
        let mut actions = Vec::new();
        self.close(id, &mut actions);
        actions
    }

    /// The channel closed underneath us. Unknown ids are ignored.
    pub fn on_connection_closed(&mut self, id: ConnectionId) {
        if let Some(c) = self.conns.close(id) {
            tracing::info!(connection = %id, transport = %c.transport, "connection closed");
            self.listener.on_closed(id, c.transport);
        }
    }

    /// Build a packet from this node.
    pub fn new_packet(&self, destination: Address, payload: Payload, now_ms: u64) -> Packet {
        Packet::new(self.identity.address, destination, payload, now_ms)
    }

    /// Send an application packet. Best effort: an unreachable destination yields no actions.
    pub fn send(&mut self, mut packet: Packet, now_ms: u64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if self.shut_down {
            return actions;
        }
        if packet.header.origin == Address::UNASSIGNED {
            packet.header.origin = self.identity.address;
        }
        self.route(packet, RouteContext::local(), now_ms, &mut actions);
        actions
    }

    /// Timer entry point; call at least every housekeeping interval.
    pub fn tick(&mut self, now_ms: u64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if self.shut_down {
            return actions;
        }
        if now_ms >= self.next_heartbeat_ms {
            self.next_heartbeat_ms = now_ms + self.config.heartbeat_interval_ms;
            if !self.conns.is_empty() {
                let hb = self.heartbeat(now_ms);
                self.route(hb, RouteContext::local(), now_ms, &mut actions);
            }
        }
        if now_ms >= self.next_housekeeping_ms {
            self.next_housekeeping_ms = now_ms + self.config.housekeeping_interval_ms;
            self.housekeeping(now_ms, &mut actions);
        }
        if now_ms >= self.next_reconnect_ms {
            self.next_reconnect_ms = now_ms + self.config.reconnect_interval_ms;
            self.plan_reconnects(&mut actions);
        }
        actions
    }

    /// Say goodbye, close everything and persist. Safe to call more than once.
    pub fn shutdown(&mut self, now_ms: u64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if self.shut_down {
            return actions;
        }
        let bye = self.new_packet(Address::BROADCAST, Payload::Disconnecting, now_ms);
        self.route(bye, RouteContext::local(), now_ms, &mut actions);
        self.shut_down = true;
        for id in self.conns.ids() {
            self.close(id, &mut actions);
        }
        self.registry.sync_saved_teammates();
        self.registry.tidy_teammates();
        self.registry.take_teammates_dirty();
        actions.push(OutboundAction::PersistTeammates(
            self.registry.teammates().to_vec(),
        ));
        tracing::info!("mesh core shut down");
        actions
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Detailed heartbeat describing this node.
    pub fn heartbeat(&self, now_ms: u64) -> Packet {
        let relays = self
            .registry
            .devices()
            .filter_map(|(_, d)| {
                Some(RelayEntry {
                    address: d.valid_address()?,
                    hops: d.hops_away()?,
                    last_contact_ms: d.last_contact_ms(),
                })
            })
            .collect();
        let body = HeartbeatBody {
            version: PROTOCOL_VERSION,
            callsign: Some(self.identity.callsign.clone()),
            extended_id: Some(self.identity.extended_id),
            macs: self
                .identity
                .macs
                .iter()
                .map(|(t, m)| (*t, *m))
                .collect(),
            roles: TransportKind::ALL
                .iter()
                .map(|t| (*t, self.conns.local_role(*t)))
                .collect(),
            relays,
        };
        self.new_packet(
            Address::BROADCAST,
            Payload::Heartbeat(Some(body)),
            now_ms,
        )
    }

    fn handle_frame(
        &mut self,
        id: ConnectionId,
        transport: TransportKind,
        frame: &[u8],
        now_ms: u64,
        actions: &mut Vec<OutboundAction>,
    ) {
        let plain = match self.relay.cipher().decrypt(frame) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(connection = %id, error = %e, "undecryptable packet");
                self.listener.on_error(Some(id), &MeshError::Cipher(e));
                return;
            }
        };
        match Packet::decode(&plain) {
            Ok(packet) => self.handle_packet(id, transport, packet, plain.len(), now_ms, actions),
            Err(e) => {
                tracing::debug!(connection = %id, error = %e, "dropping malformed packet");
                self.listener.on_error(Some(id), &MeshError::Decode(e));
            }
        }
    }

    fn handle_packet(
        &mut self,
        id: ConnectionId,
        transport: TransportKind,
        packet: Packet,
        size: usize,
        now_ms: u64,
        actions: &mut Vec<OutboundAction>,
    ) {
        let header = packet.header.clone();
        let local = self.identity.address;
        if header.origin == local {
            if let Payload::Heartbeat(Some(body)) = &packet.payload {
                if body
                    .extended_id
                    .is_some_and(|x| x != self.identity.extended_id)
                {
                    let err = IdentityError::AddressConflict(local);
                    tracing::warn!(error = %err, "address collision");
                    self.listener.on_error(Some(id), &MeshError::Identity(err));
                }
            }
            return;
        }

        let direct = header.hop_count == 0;
        let shared = self
            .relay
            .link(transport)
            .is_some_and(|l| l.is_shared_medium());
        let Some(conn) = self.conns.get(id) else {
            return;
        };
        let role = conn.role;
        let mut obs = Observation::address(header.origin);
        if direct {
            if let Some(mac) = conn.remote.mac() {
                obs = obs.with_mac(transport, mac);
            }
        }
        if let Some(learned) = self
            .registry
            .learn(&obs, transport, header.hop_count, now_ms)
        {
            if learned.created {
                tracing::info!(address = %header.origin, hops = header.hop_count, %transport, "new device");
            }
            for gone in learned.absorbed {
                self.conns.rebind(gone, learned.key);
            }
            if direct && !shared {
                self.conns.bind(id, learned.key);
            }
            self.registry.record_rx(learned.key, size);
            if let Payload::Heartbeat(Some(body)) = &packet.payload {
                self.registry.apply_heartbeat(learned.key, transport, body);
            }
        }

        match &packet.payload {
            Payload::Ping { midpoint_ms: None } if header.destination == local => {
                let reply = self.new_packet(
                    header.origin,
                    Payload::Ping {
                        midpoint_ms: Some(now_ms),
                    },
                    now_ms,
                );
                self.route(reply, RouteContext::local(), now_ms, actions);
            }
            Payload::Ping {
                midpoint_ms: Some(mid),
            } if header.destination == local => {
                tracing::debug!(
                    from = %header.origin,
                    rtt_ms = now_ms.saturating_sub(header.time_ms),
                    midpoint_ms = mid,
                    "ping answered"
                );
            }
            Payload::Disconnecting => {
                if direct && !shared {
                    tracing::info!(connection = %id, from = %header.origin, "peer disconnecting");
                    self.close(id, actions);
                }
                return;
            }
            _ => {}
        }

        if header.destination.applies_to(local) && !packet.is_admin() {
            self.listener.on_packet(&packet);
            actions.push(OutboundAction::Deliver(packet.clone()));
        }

        if header.destination != local {
            let ctx = RouteContext {
                ingress: Some(id),
                clients_only: self.config.hub_relay_clients_only && role == LinkRole::Server,
            };
            self.route(packet, ctx, now_ms, actions);
        }
    }

    fn route(
        &mut self,
        mut packet: Packet,
        ctx: RouteContext,
        now_ms: u64,
        actions: &mut Vec<OutboundAction>,
    ) {
        let preferred = self
            .registry
            .by_address(packet.header.destination)
            .and_then(|k| self.registry.device(k))
            .and_then(|d| d.preferred_transport);
        let order = self.config.route_order(preferred);
        match self.relay.route(
            &mut packet,
            ctx,
            &self.conns,
            &self.registry,
            &order,
            now_ms,
        ) {
            Ok(outcome) => {
                for (connection, bytes) in outcome.sends {
                    actions.push(OutboundAction::Send { connection, bytes });
                }
            }
            Err(RouteError::HopLimitExceeded { .. }) => {}
            Err(RouteError::NoRoute) => {
                tracing::trace!(dest = %packet.header.destination, kind = ?packet.kind(), "no route");
            }
            Err(e) => {
                tracing::debug!(dest = %packet.header.destination, error = %e, "route failed");
            }
        }
    }

    fn close(&mut self, id: ConnectionId, actions: &mut Vec<OutboundAction>) {
        if let Some(c) = self.conns.close(id) {
            actions.push(OutboundAction::Close { connection: id });
            self.listener.on_closed(id, c.transport);
        }
    }

    fn note_decoder_event(&mut self, transport: TransportKind, event: InboundEvent) {
        match event {
            InboundEvent::Dropped(reason) => {
                tracing::debug!(%transport, ?reason, "inbound drop");
                self.listener.on_packet_dropped(transport, reason);
            }
            InboundEvent::HighNoise { good, bad } => {
                tracing::warn!(%transport, good, bad, "link is noisy");
                self.listener.on_high_noise(transport, good, bad);
            }
            InboundEvent::Packet(_) | InboundEvent::Fatal(_) => {}
        }
    }

    fn housekeeping(&mut self, now_ms: u64, actions: &mut Vec<OutboundAction>) {
        let mut swept = Vec::new();
        for c in self.conns.iter_mut() {
            let transport = c.transport;
            swept.extend(c.decoder.sweep(now_ms).into_iter().map(|e| (transport, e)));
        }
        for (transport, event) in swept {
            self.note_decoder_event(transport, event);
        }

        for (id, reason) in self.conns.sweep(now_ms) {
            tracing::debug!(connection = %id, %reason, "sweeping connection");
            self.close(id, actions);
        }

        let conns = &self.conns;
        let culled =
            self.registry
                .cull_stale_devices(now_ms, self.config.stale_device_ms, |k| conns.is_live(k));
        if !culled.is_empty() {
            tracing::debug!(count = culled.len(), "culled stale devices");
        }
        for (gone, kept) in self.registry.dedup_devices() {
            self.conns.rebind(gone, kept);
        }
        self.registry.sync_saved_teammates();
        self.registry.tidy_teammates();
        if self.registry.take_teammates_dirty() {
            actions.push(OutboundAction::PersistTeammates(
                self.registry.teammates().to_vec(),
            ));
        }
    }

    fn plan_reconnects(&mut self, actions: &mut Vec<OutboundAction>) {
        for transport in TransportKind::ALL {
            for plan in plan_reconnects(
                transport,
                self.registry.teammates(),
                &self.conns,
                &self.registry,
                &mut self.rng,
            ) {
                tracing::debug!(%transport, remote = %plan.remote, address = ?plan.address, "reconnecting");
                actions.push(OutboundAction::Connect {
                    transport: plan.transport,
                    remote: plan.remote,
                });
            }
        }
    }
}
