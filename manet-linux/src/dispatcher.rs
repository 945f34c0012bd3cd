//! The single task that owns the mesh core. Link tasks, the timer and the control channel
//! feed it events; it runs the resulting actions against the link writers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use manet_core::{
    Address, ConnectionId, MeshCore, OutboundAction, Packet, Payload, RemoteId, TransportKind,
};
use tokio::sync::{mpsc, oneshot};

use crate::link::{self, LinkEvent};
use crate::store::Store;

/// Requests from the rest of the daemon.
#[derive(Debug)]
pub enum Control {
    Send {
        destination: Address,
        payload: Payload,
    },
    /// Log known devices and saved teammates.
    Peers,
    Forget(Address),
    SetEnabled {
        address: Address,
        enabled: bool,
    },
    /// Say goodbye to peers, persist and stop. Acknowledged once done.
    Shutdown(oneshot::Sender<()>),
}

/// Senders into a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub control: mpsc::UnboundedSender<Control>,
}

struct LinkHandle {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    close: oneshot::Sender<()>,
}

pub struct Dispatcher {
    core: MeshCore,
    store: Store,
    deliver: mpsc::UnboundedSender<Packet>,
    links: HashMap<ConnectionId, LinkHandle>,
    pending_dials: HashSet<SocketAddrV4>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

/// Unix time in milliseconds; the core takes time as an argument.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Dispatcher {
    pub fn new(
        core: MeshCore,
        store: Store,
        deliver: mpsc::UnboundedSender<Packet>,
    ) -> (Self, DispatcherHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = DispatcherHandle {
            events: events_tx.clone(),
            control: control_tx,
        };
        let dispatcher = Self {
            core,
            store,
            deliver,
            links: HashMap::new(),
            pending_dials: HashSet::new(),
            events_tx,
            events_rx,
            control_rx,
        };
        (dispatcher, handle)
    }

    pub async fn run(mut self) {
        let period = Duration::from_millis(self.core.config().housekeeping_interval_ms.max(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let actions = self.core.tick(now_ms());
                    self.apply(actions);
                }
                Some(event) = self.events_rx.recv() => self.on_event(event),
                control = self.control_rx.recv() => match control {
                    Some(Control::Send { destination, payload }) => {
                        let now = now_ms();
                        let packet = self.core.new_packet(destination, payload, now);
                        let actions = self.core.send(packet, now);
                        self.apply(actions);
                    }
                    Some(Control::Peers) => self.log_peers(),
                    Some(Control::Forget(address)) => {
                        if self.core.remove_teammate(address) {
                            tracing::info!(%address, "teammate forgotten");
                        } else {
                            tracing::warn!(%address, "no such teammate");
                        }
                    }
                    Some(Control::SetEnabled { address, enabled }) => {
                        if self.core.set_teammate_enabled(address, enabled) {
                            tracing::info!(%address, enabled, "teammate updated");
                        } else {
                            tracing::warn!(%address, "no such teammate");
                        }
                    }
                    Some(Control::Shutdown(done)) => {
                        self.stop();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },
            }
        }
        tracing::info!("dispatcher stopped");
    }

    fn log_peers(&self) {
        let now = now_ms();
        let registry = self.core.registry();
        for (_, d) in registry.devices() {
            tracing::info!(
                address = ?d.address,
                callsign = d.callsign.as_deref().unwrap_or("-"),
                status = ?d.status(now),
                hops = ?d.hops_away(),
                "device"
            );
        }
        for t in registry.teammates() {
            tracing::info!(
                address = ?t.address,
                callsign = t.callsign.as_deref().unwrap_or("-"),
                enabled = t.enabled,
                "teammate"
            );
        }
    }

    fn stop(&mut self) {
        let actions = self.core.shutdown(now_ms());
        self.apply(actions);
    }

    fn on_event(&mut self, event: LinkEvent) {
        let now = now_ms();
        match event {
            LinkEvent::Opened {
                transport,
                remote,
                role,
                writer,
                close,
                reply,
            } => {
                if let RemoteId::Mac(mac) = &remote {
                    self.pending_dials.remove(&link::mac_socket(*mac));
                }
                match self.core.on_connection_opened(transport, remote, role, now) {
                    Ok((id, actions)) => {
                        self.links.insert(id, LinkHandle { writer, close });
                        let _ = reply.send(Some(id));
                        self.apply(actions);
                    }
                    Err(e) => {
                        tracing::warn!(%transport, error = %e, "connection refused");
                        let _ = reply.send(None);
                    }
                }
            }
            LinkEvent::Bytes { id, bytes } => {
                let actions = self.core.on_bytes_received(id, &bytes, now);
                self.apply(actions);
            }
            LinkEvent::Written { id, len } => self.core.on_bytes_written(id, len, now),
            LinkEvent::WriteFailed { id } => {
                let actions = self.core.on_write_failed(id, now);
                self.apply(actions);
            }
            LinkEvent::Closed { id } => {
                self.links.remove(&id);
                self.core.on_connection_closed(id);
            }
            LinkEvent::DialFailed { remote } => {
                if let Some(mac) = remote.mac() {
                    self.pending_dials.remove(&link::mac_socket(mac));
                }
            }
            LinkEvent::Discovered { address, addr } => {
                let connected = self
                    .core
                    .registry()
                    .by_address(address)
                    .is_some_and(|key| {
                        self.core
                            .connections()
                            .device_connected(TransportKind::WifiAware, key)
                    });
                if !connected {
                    tracing::info!(%address, %addr, "discovered peer");
                    self.dial(addr);
                }
            }
        }
    }

    /// Dial unless a dial to `addr` is already in flight or connected.
    pub fn dial(&mut self, addr: SocketAddrV4) {
        if self.core.is_shut_down() {
            return;
        }
        let remote = RemoteId::Mac(link::socket_mac(addr));
        if self
            .core
            .connections()
            .is_connected(TransportKind::WifiAware, &remote)
        {
            return;
        }
        if self.pending_dials.insert(addr) {
            tokio::spawn(link::dial(addr, self.events_tx.clone()));
        }
    }

    fn apply(&mut self, actions: Vec<OutboundAction>) {
        let mut queue: VecDeque<OutboundAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                OutboundAction::Send { connection, bytes } => {
                    let sent = self
                        .links
                        .get(&connection)
                        .is_some_and(|l| l.writer.send(bytes).is_ok());
                    if !sent {
                        queue.extend(self.core.on_write_failed(connection, now_ms()));
                    }
                }
                OutboundAction::Close { connection } => {
                    if let Some(l) = self.links.remove(&connection) {
                        let _ = l.close.send(());
                    }
                }
                OutboundAction::Connect { transport, remote } => match (transport, &remote) {
                    (TransportKind::WifiAware, RemoteId::Mac(mac)) => {
                        tracing::debug!(%remote, "reconnecting teammate");
                        self.dial(link::mac_socket(*mac));
                    }
                    _ => tracing::debug!(%transport, %remote, "no dialler for transport"),
                },
                OutboundAction::Deliver(packet) => {
                    tracing::debug!(
                        origin = %packet.header.origin,
                        kind = ?packet.kind(),
                        "delivering packet"
                    );
                    let _ = self.deliver.send(packet);
                }
                OutboundAction::PersistTeammates(list) => {
                    if let Err(e) = self.store.save_teammates(&list) {
                        tracing::warn!(error = %e, "cannot persist teammates");
                    }
                }
            }
        }
    }
}
