use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::async_stream::AsyncStream;
use crate::tunnel::tunnel;
use crate::types::{
    default_proxy_dial, BytesPool, Network, PooledBuf, ProxyDialFn, ProxyRequest, UserHandler,
};
use crate::util::join_host_port;

pub const VER_SOCKS4: u8 = 0x04;

pub const CMD_CONNECT: u8 = 0x01;

pub const REPLY_GRANTED: u8 = 0x5A;
pub const REPLY_REJECTED: u8 = 0x5B;

// NUL-terminated user-id and SOCKS4a hostname fields are capped at this
// many bytes.
const MAX_FIELD_LEN: usize = 255;

/// SOCKS4/SOCKS4a server engine: CONNECT only.
pub struct Socks4Server {
    proxy_dial: ProxyDialFn,
    user_connect_handler: Option<UserHandler>,
    bytes_pool: Option<Arc<dyn BytesPool>>,
    cancel: CancellationToken,
}

impl Socks4Server {
    pub fn new() -> Self {
        Self {
            proxy_dial: default_proxy_dial(),
            user_connect_handler: None,
            bytes_pool: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_proxy_dial(mut self, proxy_dial: ProxyDialFn) -> Self {
        self.proxy_dial = proxy_dial;
        self
    }

    pub fn with_connect_handler(mut self, handler: UserHandler) -> Self {
        self.user_connect_handler = Some(handler);
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

    /// Handle the SOCKS4 protocol on one accepted stream, starting at the
    /// version byte.
    pub async fn serve_conn(&self, mut stream: Box<dyn AsyncStream>) -> std::io::Result<()> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != VER_SOCKS4 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unsupported SOCKS version: {}", header[0]),
            ));
        }
        let command = header[1];

        let mut port_and_ip = [0u8; 6];
        stream.read_exact(&mut port_and_ip).await?;
        let port = u16::from_be_bytes([port_and_ip[0], port_and_ip[1]]);
        let ip = Ipv4Addr::new(port_and_ip[2], port_and_ip[3], port_and_ip[4], port_and_ip[5]);

        let user_id = match read_nul_terminated(&mut stream).await {
            Ok(user_id) => user_id,
            Err(e) => {
                send_reply(&mut stream, REPLY_REJECTED, None).await?;
                return Err(e);
            }
        };
        if !user_id.is_empty() {
            log::debug!("SOCKS4 request with user id: {}", user_id);
        }

        // 0.0.0.x (x != 0) is the SOCKS4a sentinel: the real destination is
        // a hostname following the user id.
        let octets = ip.octets();
        let host = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
            match read_nul_terminated(&mut stream).await {
                Ok(hostname) => hostname,
                Err(e) => {
                    send_reply(&mut stream, REPLY_REJECTED, None).await?;
                    return Err(e);
                }
            }
        } else {
            ip.to_string()
        };

        if command != CMD_CONNECT {
            send_reply(&mut stream, REPLY_REJECTED, None).await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unsupported SOCKS4 command: {}", command),
            ));
        }

        self.handle_connect(stream, host, port).await
    }

    async fn handle_connect(
        &self,
        mut stream: Box<dyn AsyncStream>,
        host: String,
        port: u16,
    ) -> std::io::Result<()> {
        let destination = join_host_port(&host, port);

        if let Some(handler) = self.user_connect_handler.as_ref() {
            send_reply(&mut stream, REPLY_GRANTED, None).await?;
            let request = ProxyRequest {
                stream,
                network: Network::Tcp,
                destination,
                dest_host: host,
                dest_port: port,
            };
            return handler(request).await;
        }

        let dialed = match (self.proxy_dial)(Network::Tcp, destination.clone()).await {
            Ok(dialed) => dialed,
            Err(e) => {
                send_reply(&mut stream, REPLY_REJECTED, None).await?;
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("connect to {} failed: {}", destination, e),
                ));
            }
        };
        send_reply(&mut stream, REPLY_GRANTED, dialed.local_addr).await?;

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
}

impl Default for Socks4Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Reply format: a null byte, the status, then the bind port and IPv4
/// address (zeroed when unavailable).
async fn send_reply(
    stream: &mut Box<dyn AsyncStream>,
    status: u8,
    bind_addr: Option<SocketAddr>,
) -> std::io::Result<()> {
    let (port, ip) = match bind_addr {
        Some(SocketAddr::V4(addr)) => (addr.port(), addr.ip().octets()),
        Some(SocketAddr::V6(addr)) => match addr.ip().to_ipv4_mapped() {
            Some(v4) => (addr.port(), v4.octets()),
            None => (0, [0u8; 4]),
        },
        None => (0, [0u8; 4]),
    };

    let mut reply = [0u8; 8];
    reply[1] = status;
    reply[2..4].copy_from_slice(&port.to_be_bytes());
    reply[4..8].copy_from_slice(&ip);
    stream.write_all(&reply).await
}

async fn read_nul_terminated<R>(stream: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let b = stream.read_u8().await?;
        if b == 0 {
            break;
        }
        if bytes.len() >= MAX_FIELD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "SOCKS4 string field too long",
            ));
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to decode SOCKS4 string field: {}", e),
        )
    })
}
