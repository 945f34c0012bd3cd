// MANET relay daemon: TCP data path, serial radio link, LAN discovery.

mod command;
mod config;
mod discovery;
mod dispatcher;
mod link;
mod store;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use manet_core::stream::DropReason;
use manet_core::{
    ConnectionId, MeshCore, MeshError, MeshListener, Packet, PassphraseCipher, Payload, RemoteId,
    TransportKind,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};

use crate::command::Command;
use crate::dispatcher::{Control, Dispatcher};
use crate::store::Store;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Core events to the log.
struct LogListener;

impl MeshListener for LogListener {
    fn on_connected(&mut self, id: ConnectionId, transport: TransportKind, remote: &RemoteId) {
        tracing::info!(connection = %id, %transport, %remote, "peer connected");
    }

    fn on_closed(&mut self, id: ConnectionId, transport: TransportKind) {
        tracing::info!(connection = %id, %transport, "peer disconnected");
    }

    fn on_error(&mut self, id: Option<ConnectionId>, error: &MeshError) {
        match error {
            MeshError::Identity(e) => tracing::error!(error = %e, "identity problem"),
            _ => tracing::debug!(connection = ?id, %error, "mesh error"),
        }
    }

    fn on_packet_dropped(&mut self, transport: TransportKind, reason: DropReason) {
        tracing::debug!(%transport, ?reason, "packet dropped");
    }

    fn on_high_noise(&mut self, transport: TransportKind, good: u64, bad: u64) {
        tracing::warn!(%transport, good, bad, "link is mostly noise");
    }
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("manet-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let store = Store::new(cfg.state_dir());
    let mut identity = store.load_or_create_identity()?;
    let mut changed = false;
    if let Some(callsign) = &cfg.node.callsign {
        if *callsign != identity.callsign {
            identity.callsign = callsign.clone();
            changed = true;
        }
    }
    if let Some(ip) = cfg.net.advertise_ip {
        let mac = link::socket_mac(SocketAddrV4::new(ip, cfg.net.listen_port));
        if identity.macs.insert(TransportKind::WifiAware, mac) != Some(mac) {
            changed = true;
        }
    }
    if changed {
        store.save_identity(&identity)?;
    }
    tracing::info!(
        address = %identity.address,
        callsign = %identity.callsign,
        state = %store.dir().display(),
        "starting manet-linux {}",
        VERSION
    );

    let local = identity.address;
    let mut core = MeshCore::new(identity, cfg.core.clone()).with_listener(Box::new(LogListener));
    if let Some(passphrase) = &cfg.crypto.passphrase {
        core.set_cipher(Box::new(PassphraseCipher::new(passphrase)));
    }
    match store.load_teammates() {
        Ok(list) => core.load_teammates(list),
        Err(e) => tracing::warn!(error = %e, "ignoring saved teammates"),
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (mut dispatcher, handle) = Dispatcher::new(core, store, deliver_tx);

        let listener =
            tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.net.listen_port)).await?;
        tracing::info!(port = cfg.net.listen_port, "data path listening");
        let events = handle.events.clone();
        tokio::spawn(async move {
            if let Err(e) = link::run_listener(listener, events).await {
                tracing::error!(error = %e, "data path listener stopped");
            }
        });

        if let Some(device) = &cfg.serial.device {
            if let Err(e) = link::open_serial(device, cfg.serial.baud, handle.events.clone()).await {
                tracing::error!(device = %device.display(), error = %e, "cannot open serial link");
            }
        }

        if cfg.net.discovery {
            let events = handle.events.clone();
            let (disc_port, listen_port) = (cfg.net.discovery_port, cfg.net.listen_port);
            tokio::spawn(async move {
                if let Err(e) = discovery::run_discovery(local, disc_port, listen_port, events).await
                {
                    tracing::error!(error = %e, "discovery stopped");
                }
            });
        }

        for peer in &cfg.net.peers {
            match peer {
                SocketAddr::V4(addr) => dispatcher.dial(*addr),
                SocketAddr::V6(addr) => tracing::warn!(%addr, "IPv6 peers are not supported"),
            }
        }

        let task = tokio::spawn(dispatcher.run());
        tokio::spawn(log_deliveries(deliver_rx));
        tokio::spawn(read_stdin(handle.control.clone()));

        shutdown_signal().await?;
        tracing::info!("shutting down");
        let (done_tx, done_rx) = oneshot::channel();
        if handle.control.send(Control::Shutdown(done_tx)).is_ok() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await;
        }
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, task).await;
        anyhow::Ok(())
    })?;
    Ok(())
}

async fn log_deliveries(mut rx: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = rx.recv().await {
        let origin = packet.header.origin;
        match &packet.payload {
            Payload::ChannelBytes { channel, data } => tracing::info!(
                %origin,
                channel = channel.as_deref().unwrap_or("-"),
                text = %String::from_utf8_lossy(data),
                "message"
            ),
            other => tracing::info!(%origin, kind = ?other.kind(), "packet received"),
        }
    }
}

async fn read_stdin(control: mpsc::UnboundedSender<Control>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match Command::parse(&line) {
            Ok(Some(cmd)) => {
                if control.send(cmd.into_control()).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring input"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
