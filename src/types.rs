use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpStream, UdpSocket};

use crate::async_stream::AsyncStream;
use crate::udp_stream::UdpStream;
use crate::util::allocate_vec;

/// Default address the mixed proxy listens on.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:1080";

/// Default scratch buffer size for tunnel directions when no pool is set.
pub const DEFAULT_TUNNEL_BUFFER_SIZE: usize = 32 * 1024;

/// Transport of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully framed proxy request handed to a user handler.
///
/// The handler owns the client stream exclusively; the server does not
/// touch it again after the handler is invoked.
pub struct ProxyRequest {
    /// The live client stream, positioned just after the protocol handshake.
    pub stream: Box<dyn AsyncStream>,
    /// "tcp" for CONNECT-style requests, "udp" for SOCKS5 UDP associations.
    pub network: Network,
    /// Destination in dialable `host:port` form.
    pub destination: String,
    /// Destination host: an IP literal or a name.
    pub dest_host: String,
    /// Destination port.
    pub dest_port: u16,
}

impl ProxyRequest {
    /// Split the client stream into independently owned read and write
    /// halves.
    pub fn into_split(
        self,
    ) -> (
        ReadHalf<Box<dyn AsyncStream>>,
        WriteHalf<Box<dyn AsyncStream>>,
    ) {
        tokio::io::split(self.stream)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

/// A user-supplied request handler. Its error (if any) is logged by the
/// server and does not affect the listener.
pub type UserHandler = Arc<dyn Fn(ProxyRequest) -> HandlerFuture + Send + Sync>;

/// The result of a dial: the connected stream, and the local endpoint when
/// the transport has one (used for SOCKS bind-address replies).
pub struct DialedConn {
    pub stream: Box<dyn AsyncStream>,
    pub local_addr: Option<SocketAddr>,
}

pub type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<DialedConn>> + Send>>;

/// Establishes outbound transport connections. Replaceable for tests or for
/// routing over custom transports.
pub type ProxyDialFn = Arc<dyn Fn(Network, String) -> DialFuture + Send + Sync>;

/// The OS dialer: TCP connect, or a bound-and-connected UDP socket exposed
/// as a stream.
pub fn default_proxy_dial() -> ProxyDialFn {
    Arc::new(|network, address| {
        Box::pin(async move {
            match network {
                Network::Tcp => {
                    let stream = TcpStream::connect(address.as_str()).await?;
                    let local_addr = stream.local_addr().ok();
                    Ok(DialedConn {
                        stream: Box::new(stream),
                        local_addr,
                    })
                }
                Network::Udp => {
                    let target = lookup_host(address.as_str()).await?.next().ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("Lookup failed: {}", address),
                        )
                    })?;
                    let bind_addr: SocketAddr = if target.is_ipv6() {
                        (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into()
                    } else {
                        (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into()
                    };
                    let socket = UdpSocket::bind(bind_addr).await?;
                    socket.connect(target).await?;
                    let local_addr = socket.local_addr().ok();
                    Ok(DialedConn {
                        stream: Box::new(UdpStream::new(socket)),
                        local_addr,
                    })
                }
            }
        })
    })
}

/// A datagram socket as seen by the SOCKS5 UDP relay.
#[async_trait]
pub trait AsyncPacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize>;
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl AsyncPacketConn for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

pub type ListenPacketFuture =
    Pin<Box<dyn Future<Output = std::io::Result<Arc<dyn AsyncPacketConn>>> + Send>>;

/// Binds the UDP relay socket. Replaceable for tests or custom transports.
pub type ProxyListenPacketFn = Arc<dyn Fn(Network, String) -> ListenPacketFuture + Send + Sync>;

pub fn default_listen_packet() -> ProxyListenPacketFn {
    Arc::new(|_network, address| {
        Box::pin(async move {
            let socket = UdpSocket::bind(address.as_str()).await?;
            Ok(Arc::new(socket) as Arc<dyn AsyncPacketConn>)
        })
    })
}

/// Resolves the UDP relay address advertised to the client, given the
/// destination named in the ASSOCIATE request and the relay socket's local
/// address.
pub type PacketForwardAddressFn =
    Arc<dyn Fn(&str, SocketAddr) -> std::io::Result<SocketAddr> + Send + Sync>;

pub fn default_packet_forward_address() -> PacketForwardAddressFn {
    Arc::new(|_destination, local_addr| Ok(local_addr))
}

/// Supplier of temporary byte buffers for tunnel copies.
pub trait BytesPool: Send + Sync {
    fn get(&self) -> Vec<u8>;
    fn put(&self, buf: Vec<u8>);
}

/// A pool buffer that is returned to its pool when dropped, on every exit
/// path. Without a pool, a plain allocation is used and dropped normally.
pub struct PooledBuf {
    pool: Option<Arc<dyn BytesPool>>,
    buf: Option<Vec<u8>>,
}

impl PooledBuf {
    pub fn acquire(pool: Option<&Arc<dyn BytesPool>>) -> Self {
        match pool {
            Some(pool) => Self {
                pool: Some(pool.clone()),
                buf: Some(pool.get()),
            },
            None => Self {
                pool: None,
                buf: Some(allocate_vec(DEFAULT_TUNNEL_BUFFER_SIZE)),
            },
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let (Some(pool), Some(buf)) = (self.pool.take(), self.buf.take()) {
            pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct CountingPool {
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    impl BytesPool for CountingPool {
        fn get(&self) -> Vec<u8> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            vec![0u8; 128]
        }

        fn put(&self, _buf: Vec<u8>) {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_network_labels() {
        assert_eq!(Network::Tcp.as_str(), "tcp");
        assert_eq!(Network::Udp.as_str(), "udp");
    }

    #[test]
    fn test_pooled_buf_is_returned_on_drop() {
        let counting = Arc::new(CountingPool {
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        });
        let pool: Arc<dyn BytesPool> = counting.clone();
        {
            let mut buf = PooledBuf::acquire(Some(&pool));
            assert_eq!(buf.as_mut_slice().len(), 128);
        }
        assert_eq!(counting.gets.load(Ordering::SeqCst), 1);
        assert_eq!(counting.puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pooled_buf_without_pool() {
        let mut buf = PooledBuf::acquire(None);
        assert_eq!(buf.as_mut_slice().len(), DEFAULT_TUNNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_default_dial_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let dial = default_proxy_dial();
        let mut conn = dial(Network::Tcp, addr.to_string()).await.unwrap();
        assert!(conn.local_addr.is_some());

        let mut buf = [0u8; 2];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        accept_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_default_dial_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let dial = default_proxy_dial();
        let mut conn = dial(Network::Udp, addr.to_string()).await.unwrap();

        conn.stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[0..n], b"ping");
        assert_eq!(Some(from), conn.local_addr);
    }
}
