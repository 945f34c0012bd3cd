//! Per-connection I/O: a reader task feeding the dispatcher and a writer task draining a queue.
//!
//! TCP carries the neighbor-awareness data path; a raw serial port carries the radio
//! peripheral link. Both hand raw bytes to the core, which owns all framing.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use manet_core::{ConnectionId, LinkRole, MacAddress, RemoteId, TransportKind};
use serialport::SerialPort;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

const READ_BUF: usize = 16 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const SERIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Events from link tasks to the dispatcher.
#[derive(Debug)]
pub enum LinkEvent {
    Opened {
        transport: TransportKind,
        remote: RemoteId,
        role: LinkRole,
        writer: mpsc::UnboundedSender<Vec<u8>>,
        close: oneshot::Sender<()>,
        /// The id the core assigned, or `None` if it refused the connection.
        reply: oneshot::Sender<Option<ConnectionId>>,
    },
    Bytes {
        id: ConnectionId,
        bytes: Vec<u8>,
    },
    /// A queued write reached the stream.
    Written {
        id: ConnectionId,
        len: usize,
    },
    WriteFailed {
        id: ConnectionId,
    },
    Closed {
        id: ConnectionId,
    },
    DialFailed {
        remote: RemoteId,
    },
    /// A peer announced itself on the LAN.
    Discovered {
        address: manet_core::Address,
        addr: SocketAddrV4,
    },
}

/// The data path has no radio MAC, so a dialable socket address stands in for one.
pub fn socket_mac(addr: SocketAddrV4) -> MacAddress {
    let ip = addr.ip().octets();
    let port = addr.port().to_be_bytes();
    MacAddress::new([ip[0], ip[1], ip[2], ip[3], port[0], port[1]])
}

pub fn mac_socket(mac: MacAddress) -> SocketAddrV4 {
    let b = mac.as_bytes();
    SocketAddrV4::new(
        Ipv4Addr::new(b[0], b[1], b[2], b[3]),
        u16::from_be_bytes([b[4], b[5]]),
    )
}

/// Register `stream` with the dispatcher and pump it until either side closes.
pub async fn run_stream<S>(
    stream: S,
    transport: TransportKind,
    remote: RemoteId,
    role: LinkRole,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (close_tx, mut close_rx) = oneshot::channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    let opened = LinkEvent::Opened {
        transport,
        remote: remote.clone(),
        role,
        writer: write_tx,
        close: close_tx,
        reply: reply_tx,
    };
    if events.send(opened).is_err() {
        return;
    }
    let id = match reply_rx.await {
        Ok(Some(id)) => id,
        _ => {
            tracing::debug!(%remote, "connection refused by core");
            return;
        }
    };

    let write_events = events.clone();
    tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            let res = match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            let event = match res {
                Ok(()) => LinkEvent::Written {
                    id,
                    len: bytes.len(),
                },
                Err(e) => {
                    tracing::debug!(connection = %id, error = %e, "write failed");
                    LinkEvent::WriteFailed { id }
                }
            };
            if write_events.send(event).is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buf = vec![0u8; READ_BUF];
    loop {
        tokio::select! {
            _ = &mut close_rx => break,
            r = reader.read(&mut buf) => match r {
                Ok(0) => break,
                Ok(n) => {
                    if events.send(LinkEvent::Bytes { id, bytes: buf[..n].to_vec() }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(connection = %id, error = %e, "read failed");
                    break;
                }
            }
        }
    }
    let _ = events.send(LinkEvent::Closed { id });
}

/// Accept data-path connections forever.
pub async fn run_listener(
    listener: TcpListener,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(%peer, "accepted");
        tokio::spawn(run_stream(
            stream,
            TransportKind::WifiAware,
            RemoteId::Handle(peer.to_string()),
            LinkRole::Server,
            events.clone(),
        ));
    }
}

/// Dial a data-path peer. The remote is named by its socket MAC so saved teammates match.
pub async fn dial(addr: SocketAddrV4, events: mpsc::UnboundedSender<LinkEvent>) {
    let remote = RemoteId::Mac(socket_mac(addr));
    let connect = TcpStream::connect(SocketAddr::V4(addr));
    match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            run_stream(
                stream,
                TransportKind::WifiAware,
                remote,
                LinkRole::Client,
                events,
            )
            .await;
        }
        Ok(Err(e)) => {
            tracing::debug!(%addr, error = %e, "dial failed");
            let _ = events.send(LinkEvent::DialFailed { remote });
        }
        Err(_) => {
            tracing::debug!(%addr, "dial timed out");
            let _ = events.send(LinkEvent::DialFailed { remote });
        }
    }
}

/// Open the radio peripheral's serial port raw at 8N1 and pump it.
pub async fn open_serial(
    path: &Path,
    baud: u32,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> std::io::Result<()> {
    let name = path.to_string_lossy();
    let builder = serialport::new(name.as_ref(), baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(SERIAL_TIMEOUT);
    let mut port = tokio_serial::SerialStream::open(&builder)?;
    // wakes boards that hold reset until DTR; then drop what they printed before we attached
    let _ = port.write_data_terminal_ready(true);
    let _ = port.clear(serialport::ClearBuffer::Input);
    tracing::info!(device = %path.display(), baud, "serial link open");
    tokio::spawn(run_stream(
        port,
        TransportKind::Sdr,
        RemoteId::Handle(path.display().to_string()),
        LinkRole::Client,
        events,
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_mac_roundtrip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 4, 17), 45679);
        let mac = socket_mac(addr);
        assert!(mac.is_valid());
        assert_eq!(mac.to_string(), "C0:A8:04:11:B2:6F");
        assert_eq!(mac_socket(mac), addr);
    }

    #[tokio::test]
    async fn refused_connection_ends_quietly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, _b) = tokio::io::duplex(64);
        let task = tokio::spawn(run_stream(
            a,
            TransportKind::WifiAware,
            RemoteId::Handle("x".into()),
            LinkRole::Server,
            tx,
        ));
        match rx.recv().await {
            Some(LinkEvent::Opened { reply, .. }) => {
                let _ = reply.send(None);
            }
            other => panic!("unexpected {other:?}"),
        }
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn bytes_flow_both_ways_and_close_unblocks_reader() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, mut b) = tokio::io::duplex(64);
        tokio::spawn(run_stream(
            a,
            TransportKind::Sdr,
            RemoteId::Handle("tty".into()),
            LinkRole::Client,
            tx,
        ));
        let (writer, close) = match rx.recv().await {
            Some(LinkEvent::Opened {
                writer,
                close,
                reply,
                ..
            }) => {
                reply.send(Some(ConnectionId(7))).unwrap();
                (writer, close)
            }
            other => panic!("unexpected {other:?}"),
        };
        b.write_all(b"hello").await.unwrap();
        match rx.recv().await {
            Some(LinkEvent::Bytes { id, bytes }) => {
                assert_eq!(id, ConnectionId(7));
                assert_eq!(bytes, b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        writer.send(b"world".to_vec()).unwrap();
        let mut got = [0u8; 5];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");
        assert!(matches!(
            rx.recv().await,
            Some(LinkEvent::Written { id: ConnectionId(7), len: 5 })
        ));

        close.send(()).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(LinkEvent::Closed { id: ConnectionId(7) })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serial_link_is_raw_8n1() {
        use std::io::{Read, Write};

        let (mut master, mut slave) = serialport::TTYPort::pair().unwrap();
        slave.set_exclusive(false).unwrap();
        let path = std::path::PathBuf::from(slave.name().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        open_serial(&path, 115_200, tx).await.unwrap();
        drop(slave);
        let writer = match rx.recv().await {
            Some(LinkEvent::Opened {
                transport,
                writer,
                reply,
                ..
            }) => {
                assert_eq!(transport, TransportKind::Sdr);
                reply.send(Some(ConnectionId(3))).unwrap();
                writer
            }
            other => panic!("unexpected {other:?}"),
        };

        // line discipline would turn \r into \n and eat the ^C
        let sent = b"a\nb\r\n\x03\x7f".to_vec();
        master.write_all(&sent).unwrap();
        let mut got = Vec::new();
        while got.len() < sent.len() {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(LinkEvent::Bytes { bytes, .. })) => got.extend(bytes),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, sent);

        writer.send(b"x\ny".to_vec()).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(LinkEvent::Written { len: 3, .. })
        ));
        let echoed = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            let mut buf = [0u8; 64];
            // the port times out once nothing more is pending
            while let Ok(n) = master.read(&mut buf) {
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            out
        })
        .await
        .unwrap();
        assert_eq!(echoed, b"x\ny", "no echo and no newline translation");
    }
}
