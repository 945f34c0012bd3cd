//! LAN discovery: UDP multicast beacon carrying our mesh address and data-path port.
//!
//! Both sides see each other's beacons; only the node with the lower address dials, so a
//! pair of peers ends up with one connection rather than two.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use manet_core::{Address, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::link::LinkEvent;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub version: u8,
    pub address: Address,
    pub port: u16,
}

impl Beacon {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Beacon> {
        let b: Beacon = bincode::deserialize(bytes).ok()?;
        (b.version == PROTOCOL_VERSION).then_some(b)
    }
}

/// Whether we should dial the sender of `beacon`.
fn should_dial(local: Address, beacon: &Beacon) -> bool {
    beacon.address != local && local.0 < beacon.address.0
}

/// Tracks when each peer was last announced so a steady beacon stream yields one event.
#[derive(Default)]
struct Seen(HashMap<Address, Instant>);

impl Seen {
    /// True if `address` is new or was silent for longer than the peer timeout.
    fn note(&mut self, address: Address, now: Instant) -> bool {
        let fresh = self
            .0
            .get(&address)
            .map_or(true, |t| now.duration_since(*t) >= PEER_TIMEOUT);
        self.0.insert(address, now);
        self.0.retain(|_, t| now.duration_since(*t) < PEER_TIMEOUT);
        fresh
    }
}

pub async fn run_discovery(
    local: Address,
    discovery_port: u16,
    listen_port: u16,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let beacon = Beacon {
        version: PROTOCOL_VERSION,
        address: local,
        port: listen_port,
    };
    let send_socket = socket.clone();
    let beacon_task = tokio::spawn(beacon_loop(send_socket, beacon, discovery_port));
    let recv_task = tokio::spawn(recv_loop(socket, local, events));
    let _ = tokio::try_join!(beacon_task, recv_task);
    Ok(())
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    beacon: Beacon,
    discovery_port: u16,
) -> std::io::Result<()> {
    let frame = beacon.encode();
    let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, discovery_port));
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    local: Address,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 1500];
    let mut seen = Seen::default();
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(beacon) = Beacon::decode(&buf[..n]) else {
            continue;
        };
        let SocketAddr::V4(from) = from else {
            continue;
        };
        if beacon.address == local || !seen.note(beacon.address, Instant::now()) {
            continue;
        }
        tracing::debug!(address = %beacon.address, %from, "peer beacon");
        if should_dial(local, &beacon) {
            let addr = SocketAddrV4::new(*from.ip(), beacon.port);
            if events
                .send(LinkEvent::Discovered {
                    address: beacon.address,
                    addr,
                })
                .is_err()
            {
                return Ok(());
            }
        }
    }
}
