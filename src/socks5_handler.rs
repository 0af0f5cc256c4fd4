use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::address::{encode_address, read_address, NetLocation};
use crate::async_stream::AsyncStream;
use crate::socks5_udp_relay::UdpRelayConn;
use crate::tunnel::tunnel;
use crate::types::{
    default_listen_packet, default_packet_forward_address, default_proxy_dial, BytesPool, Network,
    PacketForwardAddressFn, PooledBuf, ProxyDialFn, ProxyListenPacketFn, ProxyRequest, UserHandler,
};
use crate::util::{allocate_vec, join_host_port};

pub const VER_SOCKS5: u8 = 0x05;

pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_INVALID: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_RULE_FAILURE: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub fn reply_description(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_RULE_FAILURE => "connection not allowed by ruleset",
        REPLY_NETWORK_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Map a dial error to a SOCKS5 reply code by error kind.
pub fn error_to_reply(err: &std::io::Error) -> u8 {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        std::io::ErrorKind::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
        _ => REPLY_HOST_UNREACHABLE,
    }
}

/// SOCKS5 server engine: no-auth method negotiation, CONNECT, and
/// UDP ASSOCIATE with a datagram relay.
pub struct Socks5Server {
    proxy_dial: ProxyDialFn,
    proxy_listen_packet: ProxyListenPacketFn,
    packet_forward_address: PacketForwardAddressFn,
    user_connect_handler: Option<UserHandler>,
    user_associate_handler: Option<UserHandler>,
    bytes_pool: Option<Arc<dyn BytesPool>>,
    cancel: CancellationToken,
    /// Interface the UDP relay socket binds on; normally the host the TCP
    /// listener is bound to.
    udp_bind_ip: IpAddr,
}

impl Socks5Server {
    pub fn new() -> Self {
        Self {
            proxy_dial: default_proxy_dial(),
            proxy_listen_packet: default_listen_packet(),
            packet_forward_address: default_packet_forward_address(),
            user_connect_handler: None,
            user_associate_handler: None,
            bytes_pool: None,
            cancel: CancellationToken::new(),
            udp_bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
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
        self.packet_forward_address = packet_forward_address;
        self
    }

    pub fn with_connect_handler(mut self, handler: UserHandler) -> Self {
        self.user_connect_handler = Some(handler);
        self
    }

    pub fn with_associate_handler(mut self, handler: UserHandler) -> Self {
        self.user_associate_handler = Some(handler);
        self
    }

    pub fn with_bytes_pool(mut self, bytes_pool: Arc<dyn BytesPool>) -> Self {
        self.bytes_pool = Some(bytes_pool);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_udp_bind_ip(mut self, udp_bind_ip: IpAddr) -> Self {
        self.udp_bind_ip = udp_bind_ip;
        self
    }

    /// Handle the SOCKS5 protocol on one accepted stream, starting at the
    /// version byte.
    pub async fn serve_conn(&self, mut stream: Box<dyn AsyncStream>) -> std::io::Result<()> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != VER_SOCKS5 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unsupported SOCKS version: {}", header[0]),
            ));
        }

        let method_len = header[1] as usize;
        if method_len < 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid method count: {}", method_len),
            ));
        }

        let mut methods = allocate_vec(method_len);
        stream.read_exact(&mut methods).await?;

        // Only "no authentication" is supported.
        if !methods.contains(&METHOD_NONE) {
            stream.write_all(&[VER_SOCKS5, METHOD_INVALID]).await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "No supported authentication method offered",
            ));
        }
        stream.write_all(&[VER_SOCKS5, METHOD_NONE]).await?;

        let mut request_header = [0u8; 3];
        stream.read_exact(&mut request_header).await?;
        if request_header[0] != VER_SOCKS5 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid SOCKS version in request: {}", request_header[0]),
            ));
        }
        let command = request_header[1];

        let destination = match read_address(&mut stream).await {
            Ok(destination) => destination,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    send_reply(&mut stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED, None).await?;
                }
                return Err(e);
            }
        };

        match command {
            CMD_CONNECT => self.handle_connect(stream, destination).await,
            CMD_UDP_ASSOCIATE => self.handle_associate(stream, destination).await,
            _ => {
                send_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
                Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Unsupported SOCKS5 command: {}", command),
                ))
            }
        }
    }

    async fn handle_connect(
        &self,
        mut stream: Box<dyn AsyncStream>,
        destination: NetLocation,
    ) -> std::io::Result<()> {
        if let Some(handler) = self.user_connect_handler.as_ref() {
            send_reply(&mut stream, REPLY_SUCCEEDED, None).await?;
            let request = ProxyRequest {
                stream,
                network: Network::Tcp,
                destination: destination.to_dial_string(),
                dest_host: destination.address().to_string(),
                dest_port: destination.port(),
            };
            return handler(request).await;
        }

        let dial_string = destination.to_dial_string();
        let dialed = match (self.proxy_dial)(Network::Tcp, dial_string.clone()).await {
            Ok(dialed) => dialed,
            Err(e) => {
                let code = error_to_reply(&e);
                log::debug!(
                    "SOCKS5 connect to {} failed ({}): {}",
                    dial_string,
                    reply_description(code),
                    e
                );
                send_reply(&mut stream, code, None).await?;
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("connect to {} failed: {}", dial_string, e),
                ));
            }
        };

        let bind_location = dialed.local_addr.map(NetLocation::from_socket_addr);
        send_reply(&mut stream, REPLY_SUCCEEDED, bind_location.as_ref()).await?;

        let mut target_stream = dialed.stream;
        let mut buf1 = PooledBuf::acquire(self.bytes_pool.as_ref());
        let mut buf2 = PooledBuf::acquire(self.bytes_pool.as_ref());
        tunnel(
            &mut target_stream,
            &mut stream,
            buf1.as_mut_slice(),
            buf2.as_mut_slice(),
            &self.cancel,
        )
        .await
    }

    async fn handle_associate(
        &self,
        mut stream: Box<dyn AsyncStream>,
        destination: NetLocation,
    ) -> std::io::Result<()> {
        let listen_addr = join_host_port(&self.udp_bind_ip.to_string(), 0);
        let socket = match (self.proxy_listen_packet)(Network::Udp, listen_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                send_reply(&mut stream, REPLY_GENERAL_FAILURE, None).await?;
                return Err(e);
            }
        };

        let local_addr = match socket.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                send_reply(&mut stream, REPLY_GENERAL_FAILURE, None).await?;
                return Err(e);
            }
        };
        let advertised =
            match (self.packet_forward_address)(&destination.to_dial_string(), local_addr) {
                Ok(advertised) => advertised,
                Err(e) => {
                    send_reply(&mut stream, REPLY_GENERAL_FAILURE, None).await?;
                    return Err(e);
                }
            };

        send_reply(
            &mut stream,
            REPLY_SUCCEEDED,
            Some(&NetLocation::from_socket_addr(advertised)),
        )
        .await?;
        log::debug!("SOCKS5 UDP relay listening on {}", advertised);

        // The association lives exactly as long as the TCP control stream:
        // reading it until EOF is the lifetime of the relay.
        let relay_cancel = self.cancel.child_token();
        let (mut control_read, control_write) = tokio::io::split(stream);
        let (relay, first_packet) =
            UdpRelayConn::new(socket, control_write, relay_cancel.clone());

        // Both the source and the target are only known once the first
        // datagram arrives, so wait for it, watching for teardown.
        let target = tokio::select! {
            _ = read_until_closed(&mut control_read) => {
                relay_cancel.cancel();
                return Ok(());
            }
            first = first_packet => match first {
                Ok(target) => target,
                Err(_) => {
                    // The socket reader died before any datagram arrived.
                    relay_cancel.cancel();
                    return Ok(());
                }
            },
        };

        if let Some(handler) = self.user_associate_handler.as_ref() {
            let request = ProxyRequest {
                stream: Box::new(relay),
                network: Network::Udp,
                destination: target.to_dial_string(),
                dest_host: target.address().to_string(),
                dest_port: target.port(),
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(request).await {
                    log::error!("SOCKS5 associate handler error: {}", e);
                }
            });

            read_until_closed(&mut control_read).await;
            relay_cancel.cancel();
            return Ok(());
        }

        let dial_string = target.to_dial_string();
        let dialed = match (self.proxy_dial)(Network::Udp, dial_string.clone()).await {
            Ok(dialed) => dialed,
            Err(e) => {
                relay_cancel.cancel();
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("udp connect to {} failed: {}", dial_string, e),
                ));
            }
        };

        let mut relay_stream: Box<dyn AsyncStream> = Box::new(relay);
        let mut target_stream = dialed.stream;
        let mut buf1 = PooledBuf::acquire(self.bytes_pool.as_ref());
        let mut buf2 = PooledBuf::acquire(self.bytes_pool.as_ref());
        let relay_tunnel = tunnel(
            &mut relay_stream,
            &mut target_stream,
            buf1.as_mut_slice(),
            buf2.as_mut_slice(),
            &relay_cancel,
        );

        tokio::select! {
            result = relay_tunnel => {
                relay_cancel.cancel();
                result
            }
            _ = read_until_closed(&mut control_read) => {
                relay_cancel.cancel();
                Ok(())
            }
        }
    }
}

impl Default for Socks5Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Reply format: version, code, reserved, then the bind address triple
/// (all-zero IPv4 when there is no bind address to report).
async fn send_reply(
    stream: &mut Box<dyn AsyncStream>,
    code: u8,
    bind_location: Option<&NetLocation>,
) -> std::io::Result<()> {
    let mut reply = Vec::with_capacity(3 + 1 + 16 + 2);
    reply.extend_from_slice(&[VER_SOCKS5, code, 0x00]);
    encode_address(bind_location, &mut reply)?;
    stream.write_all(&reply).await
}

/// Read the control stream until the client closes it (or it errors),
/// discarding anything received.
async fn read_until_closed<R>(stream: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_address;
    use crate::socks5_udp_relay::{encode_udp_packet, parse_udp_packet};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UdpSocket;

    fn capture_handler() -> (UserHandler, Arc<Mutex<Vec<(String, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let handler: UserHandler = Arc::new(move |request: ProxyRequest| {
            captured.lock().unwrap().push((
                request.network.as_str().to_string(),
                request.destination.clone(),
            ));
            Box::pin(async move { Ok(()) })
        });
        (handler, seen)
    }

    #[test]
    fn test_error_to_reply_mapping() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(error_to_reply(&refused), REPLY_CONNECTION_REFUSED);

        let unreachable =
            std::io::Error::new(std::io::ErrorKind::NetworkUnreachable, "unreachable");
        assert_eq!(error_to_reply(&unreachable), REPLY_NETWORK_UNREACHABLE);

        let other = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        assert_eq!(error_to_reply(&other), REPLY_HOST_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let server = Socks5Server::new();
        let (mut client, server_stream) = tokio::io::duplex(1024);
        let serve_task =
            tokio::spawn(async move { server.serve_conn(Box::new(server_stream)).await });

        // Offer username/password only.
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [VER_SOCKS5, METHOD_INVALID]);
        assert!(serve_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_connect_with_handler_replies_zero_bind() {
        let (handler, seen) = capture_handler();
        let server = Socks5Server::new().with_connect_handler(handler);

        let (mut client, server_stream) = tokio::io::duplex(1024);
        let serve_task =
            tokio::spawn(async move { server.serve_conn(Box::new(server_stream)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [VER_SOCKS5, METHOD_NONE]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        serve_task.await.unwrap().unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("tcp".to_string(), "127.0.0.1:80".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unsupported_command_reply() {
        let server = Socks5Server::new();
        let (mut client, server_stream) = tokio::io::duplex(1024);
        let serve_task =
            tokio::spawn(async move { server.serve_conn(Box::new(server_stream)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // BIND is not supported.
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
        assert!(serve_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_unknown_address_type_reply() {
        let server = Socks5Server::new();
        let (mut client, server_stream) = tokio::io::duplex(1024);
        let serve_task =
            tokio::spawn(async move { server.serve_conn(Box::new(server_stream)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // Address type 0x02 does not exist.
        client
            .write_all(&[0x05, 0x01, 0x00, 0x02, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_ADDRESS_TYPE_NOT_SUPPORTED);
        assert!(serve_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_embedded_connect_tunnels() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
        });

        let server = Socks5Server::new();
        let (mut client, server_stream) = tokio::io::duplex(1024);
        let serve_task =
            tokio::spawn(async move { server.serve_conn(Box::new(server_stream)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        match target_addr {
            SocketAddr::V4(addr) => request.extend_from_slice(&addr.ip().octets()),
            _ => unreachable!(),
        }
        request.extend_from_slice(&target_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        // Success reply carries the dialer's local endpoint.
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[0..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_ne!(&reply[8..10], &[0, 0]);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        serve_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_embedded_dial_refused_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let server = Socks5Server::new();
        let (mut client, server_stream) = tokio::io::duplex(1024);
        let serve_task =
            tokio::spawn(async move { server.serve_conn(Box::new(server_stream)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        match dead_addr {
            SocketAddr::V4(addr) => request.extend_from_slice(&addr.ip().octets()),
            _ => unreachable!(),
        }
        request.extend_from_slice(&dead_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_CONNECTION_REFUSED);
        assert!(serve_task.await.unwrap().is_err());
    }

    async fn negotiate_associate(
        client: &mut tokio::io::DuplexStream,
    ) -> SocketAddr {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0x00, 0x00])
            .await
            .unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[0..2], &[0x05, 0x00]);
        assert_eq!(reply[3], 0x01);
        let mut addr_bytes = [0u8; 6];
        client.read_exact(&mut addr_bytes).await.unwrap();

        let mut triple = vec![0x01];
        triple.extend_from_slice(&addr_bytes);
        let (location, _) = parse_address(&triple).unwrap();
        location.to_dial_string().parse().unwrap()
    }

    #[tokio::test]
    async fn test_udp_associate_relays_datagrams() {
        // Local UDP echo stands in for the destination.
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match echo.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let _ = echo.send_to(&buf[0..n], from).await;
                    }
                    Err(_) => break,
                }
            }
        });

        let server = Socks5Server::new();
        let (mut client, server_stream) = tokio::io::duplex(1024);
        let serve_task =
            tokio::spawn(async move { server.serve_conn(Box::new(server_stream)).await });

        let relay_addr = negotiate_associate(&mut client).await;

        let udp_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = NetLocation::from_str(&echo_addr.to_string(), None).unwrap();
        let datagram = encode_udp_packet(&target, b"echo me").unwrap();
        udp_client.send_to(&datagram, relay_addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, from) = tokio::time::timeout(
            Duration::from_secs(2),
            udp_client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(from, relay_addr);

        let (frag, reply_source, payload_offset) = parse_udp_packet(&buf[0..n]).unwrap();
        assert_eq!(frag, 0);
        assert_eq!(reply_source, target);
        assert_eq!(&buf[payload_offset..n], b"echo me");

        // Closing the control stream tears the association down.
        drop(client);
        tokio::time::timeout(Duration::from_secs(2), serve_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_udp_associate_handler_notified_after_first_packet() {
        let (handler, seen) = capture_handler();
        let server = Socks5Server::new().with_associate_handler(handler);
        let (mut client, server_stream) = tokio::io::duplex(1024);
        let serve_task =
            tokio::spawn(async move { server.serve_conn(Box::new(server_stream)).await });

        let relay_addr = negotiate_associate(&mut client).await;

        // No handler call before the first datagram.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());

        let udp_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = NetLocation::new(
            crate::address::Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8)),
            53,
        );
        let datagram = encode_udp_packet(&target, b"x").unwrap();
        udp_client.send_to(&datagram, relay_addr).await.unwrap();

        // Now the handler fires with a udp request for the latched target.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !seen.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("udp".to_string(), "8.8.8.8:53".to_string())]
        );

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), serve_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
