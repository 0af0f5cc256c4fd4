//! SOCKS5 UDP relay implementation.
//!
//! This module provides the relay connection behind SOCKS5 UDP ASSOCIATE.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::address::{encode_address, parse_address, NetLocation};
use crate::async_stream::AsyncStream;
use crate::types::AsyncPacketConn;
use crate::util::allocate_vec;

/// Maximum SOCKS5 UDP datagram size: 65535 minus the IPv4 + UDP header
/// allowance.
pub const MAX_UDP_PACKET_SIZE: usize = 65535 - 28;

/// Bound on datagrams queued between the socket reader task and the relay
/// consumer.
const PACKET_QUEUE_SIZE: usize = 64;

/// Parse a SOCKS5 UDP packet header.
///
/// Packet format:
/// ```text
/// +------+------+------+----------+----------+----------+
/// | RSV  | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +------+------+------+----------+----------+----------+
/// |  2   |  1   |  1   | Variable |    2     | Variable |
/// +------+------+------+----------+----------+----------+
/// ```
///
/// Returns the FRAG byte, the target location, and the payload offset.
pub fn parse_udp_packet(data: &[u8]) -> std::io::Result<(u8, NetLocation, usize)> {
    if data.len() < 3 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("SOCKS5 UDP packet too short: {} bytes", data.len()),
        ));
    }
    let frag = data[2];
    let (target, address_len) = parse_address(&data[3..])?;
    Ok((frag, target, 3 + address_len))
}

/// Encode a SOCKS5 UDP packet with the given address and payload.
pub fn encode_udp_packet(location: &NetLocation, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(3 + 1 + 16 + 2 + payload.len());
    packet.extend_from_slice(&[0, 0, 0]); // RSV + FRAG
    encode_address(Some(location), &mut packet)?;
    packet.extend_from_slice(payload);
    Ok(packet)
}

struct RelayState {
    /// First-seen client packet source; write-once.
    source_addr: Option<SocketAddr>,
    /// Target address from the first packet's header; write-once.
    target_addr: Option<NetLocation>,
    /// `00 00 00` plus the encoded target, built lazily on first reply.
    reply_prefix: Option<Vec<u8>>,
}

type SendFuture = Pin<Box<dyn Future<Output = std::io::Result<usize>> + Send>>;

/// The UDP side of a SOCKS5 association, exposed as a byte stream.
///
/// Reads yield the payloads of well-formed datagrams addressed to the
/// latched target; fragmented, malformed, and re-targeted datagrams are
/// dropped without affecting the latched state. Writes are framed with the
/// cached reply prefix and sent to the latched client source address.
///
/// A reader task pulls datagrams from the socket into a bounded queue and
/// latches the source and target from the first parseable packet, sending
/// the latched target on the one-shot channel at that point. Shutting the
/// relay down stops the reader (releasing the socket) and then shuts down
/// the write half of the TCP control stream.
pub struct UdpRelayConn {
    socket: Arc<dyn AsyncPacketConn>,
    control_write: WriteHalf<Box<dyn AsyncStream>>,
    state: Arc<Mutex<RelayState>>,
    receiver: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    cancel: CancellationToken,
    send_future: Option<SendFuture>,
}

impl UdpRelayConn {
    pub fn new(
        socket: Arc<dyn AsyncPacketConn>,
        control_write: WriteHalf<Box<dyn AsyncStream>>,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<NetLocation>) {
        let state = Arc::new(Mutex::new(RelayState {
            source_addr: None,
            target_addr: None,
            reply_prefix: None,
        }));
        let (first_packet_tx, first_packet_rx) = oneshot::channel();
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_SIZE);

        let reader_socket = socket.clone();
        let reader_state = state.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            run_packet_reader(
                reader_socket,
                reader_state,
                reader_cancel,
                packet_tx,
                first_packet_tx,
            )
            .await;
        });

        (
            Self {
                socket,
                control_write,
                state,
                receiver: packet_rx,
                cancel,
                send_future: None,
            },
            first_packet_rx,
        )
    }

    /// The first-seen client source address, once a datagram has arrived.
    pub fn source_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().source_addr
    }

    /// The latched target address, once a datagram has arrived.
    pub fn target_addr(&self) -> Option<NetLocation> {
        self.state.lock().unwrap().target_addr.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

async fn run_packet_reader(
    socket: Arc<dyn AsyncPacketConn>,
    state: Arc<Mutex<RelayState>>,
    cancel: CancellationToken,
    packet_tx: mpsc::Sender<std::io::Result<Vec<u8>>>,
    first_packet_tx: oneshot::Sender<NetLocation>,
) {
    let mut first_packet_tx = Some(first_packet_tx);
    loop {
        let mut buf = allocate_vec(MAX_UDP_PACKET_SIZE);
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => result,
        };

        match result {
            Ok((n, from_addr)) => {
                buf.truncate(n);
                {
                    let mut state = state.lock().unwrap();
                    if state.source_addr.is_none() {
                        state.source_addr = Some(from_addr);
                    }
                    if state.target_addr.is_none() {
                        // The first unfragmented, parseable packet defines
                        // the target for the rest of the association.
                        if let Ok((0, target, _)) = parse_udp_packet(&buf) {
                            state.target_addr = Some(target.clone());
                            if let Some(tx) = first_packet_tx.take() {
                                let _ = tx.send(target);
                            }
                        }
                    }
                }
                if packet_tx.send(Ok(buf)).await.is_err() {
                    // Consumer is gone, stop reading.
                    break;
                }
            }
            Err(e) => {
                log::debug!("UDP relay recv error: {}", e);
                let _ = packet_tx.send(Err(e)).await;
                break;
            }
        }
    }
}

impl AsyncRead for UdpRelayConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            let packet = match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(Ok(packet))) => packet,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                // Reader stopped (relay cancelled): clean EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            };

            let (frag, target, payload_offset) = match parse_udp_packet(&packet) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::debug!("UDP relay: dropping malformed packet: {}", e);
                    continue;
                }
            };
            if frag != 0 {
                log::debug!("UDP relay: dropping fragmented packet (frag={})", frag);
                continue;
            }

            let latched_target = this.state.lock().unwrap().target_addr.clone();
            match latched_target {
                Some(latched) if latched == target => {}
                Some(latched) => {
                    log::debug!(
                        "UDP relay: dropping packet for {} (association target is {})",
                        target,
                        latched
                    );
                    continue;
                }
                None => {
                    log::debug!("UDP relay: dropping packet, no target latched");
                    continue;
                }
            }

            let payload = &packet[payload_offset..];
            if payload.is_empty() {
                // The copy loop treats zero-byte reads as EOF.
                log::debug!("UDP relay: skipping empty payload");
                continue;
            }
            if payload.len() > buf.remaining() {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "UDP payload too large: {} > {}",
                        payload.len(),
                        buf.remaining()
                    ),
                )));
            }
            buf.put_slice(payload);
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncWrite for UdpRelayConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        let mut send_future: SendFuture = match this.send_future.take() {
            Some(send_future) => send_future,
            None => {
                let (source_addr, prefix) = {
                    let mut state = this.state.lock().unwrap();
                    let source_addr = match state.source_addr {
                        Some(addr) => addr,
                        None => {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::NotConnected,
                                "No client source address learned yet",
                            )));
                        }
                    };
                    let prefix = match state.reply_prefix.as_ref() {
                        Some(prefix) => prefix.clone(),
                        None => {
                            let target = match state.target_addr.clone() {
                                Some(target) => target,
                                None => {
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::NotConnected,
                                        "No target address latched yet",
                                    )));
                                }
                            };
                            let mut prefix = Vec::with_capacity(3 + 1 + 16 + 2);
                            prefix.extend_from_slice(&[0, 0, 0]);
                            encode_address(Some(&target), &mut prefix)?;
                            state.reply_prefix = Some(prefix.clone());
                            prefix
                        }
                    };
                    (source_addr, prefix)
                };

                let mut packet = Vec::with_capacity(prefix.len() + buf.len());
                packet.extend_from_slice(&prefix);
                packet.extend_from_slice(buf);

                let socket = this.socket.clone();
                Box::pin(async move { socket.send_to(&packet, source_addr).await })
            }
        };

        match send_future.as_mut().poll(cx) {
            Poll::Ready(result) => {
                result?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Pending => {
                this.send_future = Some(send_future);
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        // Stop the socket reader first, then close the TCP control side.
        this.cancel.cancel();
        Pin::new(&mut this.control_write).poll_shutdown(cx)
    }
}

impl Drop for UdpRelayConn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
