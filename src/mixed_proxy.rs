//! Mixed SOCKS5+SOCKS4+HTTP proxy server.
//!
//! One TCP listener serves all three protocols. The first byte of each
//! connection picks the engine:
//! - 0x05 = SOCKS5 (RFC 1928 specifies the version byte first)
//! - 0x04 = SOCKS4
//! - Anything else = HTTP
//!
//! The probe byte is not consumed: the selected engine reads the stream
//! from the very first byte.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::async_stream::{AsyncStream, PrefixedStream};
use crate::http_handler::HttpServer;
use crate::socks4_handler::{Socks4Server, VER_SOCKS4};
use crate::socks5_handler::{Socks5Server, VER_SOCKS5};
use crate::types::{
    default_listen_packet, default_proxy_dial, BytesPool, PacketForwardAddressFn, ProxyDialFn,
    ProxyListenPacketFn, UserHandler, DEFAULT_BIND_ADDRESS,
};

/// Multiprotocol proxy server. Configured with builder methods, then run
/// with [`MixedProxy::listen_and_serve`].
pub struct MixedProxy {
    bind_address: String,
    user_tcp_handler: Option<UserHandler>,
    user_udp_handler: Option<UserHandler>,
    proxy_dial: ProxyDialFn,
    proxy_listen_packet: ProxyListenPacketFn,
    packet_forward_address: Option<PacketForwardAddressFn>,
    bytes_pool: Option<Arc<dyn BytesPool>>,
    cancel: CancellationToken,
}

impl MixedProxy {
    pub fn new() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            user_tcp_handler: None,
            user_udp_handler: None,
            proxy_dial: default_proxy_dial(),
            proxy_listen_packet: default_listen_packet(),
            packet_forward_address: None,
            bytes_pool: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_bind_address(mut self, bind_address: &str) -> Self {
        self.bind_address = bind_address.to_string();
        self
    }

    /// One handler for every request, TCP and UDP alike.
    pub fn with_user_handler(mut self, handler: UserHandler) -> Self {
        self.user_tcp_handler = Some(handler.clone());
        self.user_udp_handler = Some(handler);
        self
    }

    /// Handler for CONNECT-style requests across all three protocols.
    pub fn with_user_tcp_handler(mut self, handler: UserHandler) -> Self {
        self.user_tcp_handler = Some(handler);
        self
    }

    /// Handler for SOCKS5 UDP associations.
    pub fn with_user_udp_handler(mut self, handler: UserHandler) -> Self {
        self.user_udp_handler = Some(handler);
        self
    }

    pub fn with_proxy_dial(mut self, proxy_dial: ProxyDialFn) -> Self {
        self.proxy_dial = proxy_dial;
        self
    }

    pub fn with_listen_packet(mut self, proxy_listen_packet: ProxyListenPacketFn) -> Self {
        self.proxy_listen_packet = proxy_listen_packet;
        self
    }

    pub fn with_packet_forward_address(
        mut self,
        packet_forward_address: PacketForwardAddressFn,
    ) -> Self {
        self.packet_forward_address = Some(packet_forward_address);
        self
    }

    pub fn with_bytes_pool(mut self, bytes_pool: Arc<dyn BytesPool>) -> Self {
        self.bytes_pool = Some(bytes_pool);
        self
    }

    /// Root cancellation scope: cancelling it closes the listener and
    /// propagates to in-flight tunnels and relays.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Bind the configured address and serve until accept fails
    /// irrecoverably or the cancellation scope fires.
    pub async fn listen_and_serve(self) -> std::io::Result<()> {
        let listener = match TcpListener::bind(&self.bind_address).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Error listening on {}: {}", self.bind_address, e);
                return Err(e);
            }
        };
        self.serve_with_listener(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve_with_listener(self, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        log::debug!("Serving on {} ...", local_addr);

        let socks5 = {
            let mut server = Socks5Server::new()
                .with_proxy_dial(self.proxy_dial.clone())
                .with_listen_packet(self.proxy_listen_packet.clone())
                .with_cancellation(self.cancel.clone())
                .with_udp_bind_ip(local_addr.ip());
            if let Some(handler) = self.user_tcp_handler.as_ref() {
                server = server.with_connect_handler(handler.clone());
            }
            if let Some(handler) = self.user_udp_handler.as_ref() {
                server = server.with_associate_handler(handler.clone());
            }
            if let Some(forward) = self.packet_forward_address.as_ref() {
                server = server.with_packet_forward_address(forward.clone());
            }
            if let Some(pool) = self.bytes_pool.as_ref() {
                server = server.with_bytes_pool(pool.clone());
            }
            Arc::new(server)
        };

        let socks4 = {
            let mut server = Socks4Server::new()
                .with_proxy_dial(self.proxy_dial.clone())
                .with_cancellation(self.cancel.clone());
            if let Some(handler) = self.user_tcp_handler.as_ref() {
                server = server.with_connect_handler(handler.clone());
            }
            if let Some(pool) = self.bytes_pool.as_ref() {
                server = server.with_bytes_pool(pool.clone());
            }
            Arc::new(server)
        };

        let http = {
            let mut server = HttpServer::new()
                .with_proxy_dial(self.proxy_dial.clone())
                .with_cancellation(self.cancel.clone());
            if let Some(handler) = self.user_tcp_handler.as_ref() {
                server = server.with_connect_handler(handler.clone());
            }
            if let Some(pool) = self.bytes_pool.as_ref() {
                server = server.with_bytes_pool(pool.clone());
            }
            Arc::new(server)
        };

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                log::error!("Failed to set TCP nodelay: {}", e);
            }

            let socks5 = socks5.clone();
            let socks4 = socks4.clone();
            let http = http.clone();
            tokio::spawn(async move {
                match handle_connection(stream, socks5, socks4, http).await {
                    Ok(()) => log::debug!("{} finished successfully", peer_addr),
                    Err(e) => log::error!("{} finished with error: {}", peer_addr, e),
                }
            });
        }
    }
}

impl Default for MixedProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Peek one byte to pick the protocol, then hand the stream over with the
/// byte still readable.
async fn handle_connection(
    mut stream: TcpStream,
    socks5: Arc<Socks5Server>,
    socks4: Arc<Socks4Server>,
    http: Arc<HttpServer>,
) -> std::io::Result<()> {
    let mut probe = [0u8; 1];
    stream.read_exact(&mut probe).await?;

    let stream: Box<dyn AsyncStream> =
        Box::new(PrefixedStream::new(probe.to_vec(), Box::new(stream)));

    match probe[0] {
        VER_SOCKS5 => socks5.serve_conn(stream).await,
        VER_SOCKS4 => socks4.serve_conn(stream).await,
        _ => {
            log::debug!("Detected HTTP protocol (first byte: 0x{:02x})", probe[0]);
            http.serve_conn(stream).await
        }
    }
}
