//! URTP ingest over UDP or TCP.
//!
//! UDP mode treats every datagram as one URTP frame. TCP mode accepts
//! a single Chuff client at a time — a new connection displaces the
//! current one — and recovers frames from the byte stream with the
//! reassembler. Either way, decoded frames go to the processor over a
//! bounded channel, so ingest blocks rather than outrunning it.

use anyhow::{Context, Result};
use chuff_common::{
    AudioFrame, MetricsContext, UrtpFrame, IP_HEADER_OVERHEAD, MAX_DATAGRAM_SIZE,
};
use socket2::{Domain, SockRef, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::reassembly::FrameAssembler;

/// Receive buffer for the single TCP audio stream.
const TCP_RECEIVE_BUFFER: usize = 30_000;

/// Runs the UDP ingest loop forever.
///
/// Datagrams failing header verification are counted and dropped;
/// transient socket errors are logged and reception continues.
///
/// # Errors
///
/// Returns error if the socket cannot be created or bound.
pub async fn run_udp(
    port: u16,
    frames: Sender<AudioFrame>,
    metrics: MetricsContext,
) -> Result<()> {
    // ---
    let socket = bind_udp(port)?;
    info!("UDP server listening for Chuffs on port {}", port);

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut received: u64 = 0;

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                warn!("error reading from UDP port {}: {}", port, e);
                continue;
            }
        };

        metrics.bytes_received_total.inc_by(len as u64);

        // One URTP frame per datagram.
        match UrtpFrame::deserialize(&buf[..len]) {
            Ok(frame) => {
                metrics.frames_received_total.inc();
                received += 1;
                if received % 100 == 0 {
                    debug!("received {} datagram(s), last from {}", received, peer);
                }

                if frames.send(frame.decode()).await.is_err() {
                    info!("processor channel closed, UDP ingest stopping");
                    return Ok(());
                }
            }
            Err(e) => {
                metrics.frames_rejected_total.inc();
                debug!("dropped invalid datagram from {}: {}", peer, e);
            }
        }
    }
}

/// Runs the TCP ingest loop forever.
///
/// Each accepted connection displaces the previous one; the stream is
/// fed through a fresh [`FrameAssembler`]. Read errors end only the
/// affected connection.
///
/// # Errors
///
/// Returns error if the listener cannot be bound.
pub async fn run_tcp(
    port: u16,
    frames: Sender<AudioFrame>,
    metrics: MetricsContext,
) -> Result<()> {
    // ---
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .await
        .with_context(|| format!("failed to listen for TCP connections on port {}", port))?;

    let mut current: Option<JoinHandle<()>> = None;

    loop {
        info!(
            "TCP server waiting for a [further] Chuff connection on port {}",
            port
        );

        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("error accepting connection: {}", e);
                continue;
            }
        };

        // Single client: a newcomer displaces the current connection.
        if let Some(previous) = current.take() {
            previous.abort();
        }

        if let Err(e) = stream.set_nodelay(true) {
            warn!("unable to switch off the Nagle algorithm: {}", e);
        }
        if let Err(e) = SockRef::from(&stream).set_recv_buffer_size(TCP_RECEIVE_BUFFER) {
            warn!("unable to set optimal read buffer size: {}", e);
        }

        info!("connection made by {}", peer);
        current = Some(tokio::spawn(pump_stream(
            stream,
            frames.clone(),
            metrics.clone(),
        )));
    }
}

/// Reads one connection's bytes into the reassembler until it closes.
async fn pump_stream(mut stream: TcpStream, frames: Sender<AudioFrame>, metrics: MetricsContext) {
    // ---
    let peer = match stream.peer_addr() {
        Ok(addr) => addr.to_string(),
        Err(_) => "unknown".to_string(),
    };

    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut assembled = Vec::new();

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                info!("[connection to {} closed]", peer);
                return;
            }
            Ok(len) => {
                metrics.bytes_received_total.inc_by(len as u64);
                assembler.feed(&buf[..len], &mut assembled);

                for frame in assembled.drain(..) {
                    metrics.frames_received_total.inc();
                    if frames.send(frame.decode()).await.is_err() {
                        info!("processor channel closed, TCP ingest stopping");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("error reading from {}: {}", peer, e);
                return;
            }
        }
    }
}

/// Binds the UDP socket with a receive buffer sized for one datagram
/// plus IP overhead.
fn bind_udp(port: u16) -> Result<UdpSocket> {
    // ---
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, None).context("failed to create UDP socket")?;

    if let Err(e) = socket.set_recv_buffer_size(MAX_DATAGRAM_SIZE + IP_HEADER_OVERHEAD) {
        warn!("unable to set optimal read buffer size: {}", e);
    }

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&SocketAddr::from(addr).into())
        .with_context(|| format!("failed to bind UDP socket to port {}", port))?;
    socket
        .set_nonblocking(true)
        .context("failed to make the UDP socket non-blocking")?;

    UdpSocket::from_std(socket.into()).context("failed to register the UDP socket with tokio")
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chuff_common::CodingScheme;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_udp_bind_ephemeral_port() {
        // ---
        assert!(bind_udp(0).is_ok());
    }

    #[tokio::test]
    async fn test_udp_frame_delivery() {
        // ---
        let (tx, mut rx) = mpsc::channel(4);

        let server = bind_udp(0).expect("bind failed");
        let addr = server.local_addr().expect("no local addr");

        // Re-create run_udp's receive path against the bound socket.
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (len, _) = server.recv_from(&mut buf).await.expect("recv failed");
            let frame = UrtpFrame::deserialize(&buf[..len]).expect("bad frame");
            tx.send(frame.decode()).await.expect("send failed");
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
        let payload = chuff_common::encode_pcm(&[1, 2, 3]);
        let frame = UrtpFrame::new(CodingScheme::Pcm16, 9, 180_000, payload);
        client
            .send_to(&frame.serialize(), addr)
            .await
            .expect("send failed");

        let decoded = rx.recv().await.expect("no frame received");
        assert_eq!(decoded.sequence, 9);
        assert_eq!(decoded.samples, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_tcp_stream_reassembly_end_to_end() {
        // ---
        let (tx, mut rx) = mpsc::channel(4);
        let metrics = MetricsContext::new("test").expect("metrics init failed");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept failed");
            pump_stream(stream, tx, metrics).await;
        });

        let mut client = TcpStream::connect(addr).await.expect("connect failed");
        let first = UrtpFrame::new(
            CodingScheme::Pcm16,
            1,
            20_000,
            chuff_common::encode_pcm(&[10, 20]),
        );
        let second = UrtpFrame::new(
            CodingScheme::Pcm16,
            2,
            40_000,
            chuff_common::encode_pcm(&[30]),
        );

        // Split the two frames at an arbitrary mid-header boundary.
        let mut bytes = first.serialize();
        bytes.extend_from_slice(&second.serialize());
        client.write_all(&bytes[..7]).await.expect("write failed");
        client.flush().await.expect("flush failed");
        client.write_all(&bytes[7..]).await.expect("write failed");
        drop(client);

        assert_eq!(rx.recv().await.expect("no frame").samples, vec![10, 20]);
        assert_eq!(rx.recv().await.expect("no frame").samples, vec![30]);
    }
}
