//! sandals - a multi-protocol forwarding proxy.
//!
//! One TCP listener accepts SOCKS5, SOCKS4/4a, and HTTP/HTTPS proxy
//! clients; the first byte of each connection picks the protocol engine
//! without being consumed. After the handshake, each engine either forwards
//! the connection itself or hands a fully framed [`ProxyRequest`] to a
//! user-supplied handler that owns the rest.
//!
//! # Embedded forwarding
//!
//! ```no_run
//! use sandals::MixedProxy;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     MixedProxy::new()
//!         .with_bind_address("127.0.0.1:1080")
//!         .listen_and_serve()
//!         .await
//! }
//! ```
//!
//! # Custom handler
//!
//! ```no_run
//! use std::sync::Arc;
//! use sandals::{MixedProxy, ProxyRequest, UserHandler};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let handler: UserHandler = Arc::new(|request: ProxyRequest| {
//!         Box::pin(async move {
//!             println!("request for {}", request.destination);
//!             // dial request.destination over any transport and relay
//!             Ok(())
//!         })
//!     });
//!
//!     MixedProxy::new()
//!         .with_user_handler(handler)
//!         .listen_and_serve()
//!         .await
//! }
//! ```

pub mod address;
pub mod async_stream;
pub mod http_handler;
pub mod line_reader;
pub mod mixed_proxy;
pub mod socks4_handler;
pub mod socks5_handler;
pub mod socks5_udp_relay;
pub mod tunnel;
pub mod types;
pub mod udp_stream;
mod util;

pub use address::{Address, NetLocation};
pub use async_stream::AsyncStream;
pub use http_handler::HttpServer;
pub use mixed_proxy::MixedProxy;
pub use socks4_handler::Socks4Server;
pub use socks5_handler::Socks5Server;
pub use types::{
    BytesPool, DialedConn, Network, PacketForwardAddressFn, ProxyDialFn, ProxyListenPacketFn,
    ProxyRequest, UserHandler, DEFAULT_BIND_ADDRESS,
};
