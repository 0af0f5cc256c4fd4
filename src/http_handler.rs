use std::sync::Arc;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::async_stream::{AsyncStream, PrefixedStream};
use crate::line_reader::LineReader;
use crate::tunnel::tunnel;
use crate::types::{
    default_proxy_dial, BytesPool, Network, PooledBuf, ProxyDialFn, ProxyRequest, UserHandler,
};

const CONNECTION_HEADER_PREFIX: &str = "connection: ";
const PROXY_CONNECTION_HEADER_PREFIX: &str = "proxy-connection: ";

const CONNECT_ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const MAX_REQUEST_LEN: usize = 16384;

/// HTTP proxy server engine: CONNECT and absolute-URI requests.
pub struct HttpServer {
    proxy_dial: ProxyDialFn,
    user_connect_handler: Option<UserHandler>,
    bytes_pool: Option<Arc<dyn BytesPool>>,
    cancel: CancellationToken,
}

impl HttpServer {
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

    /// Handle an HTTP proxy request on one accepted stream, starting at the
    /// request line.
    pub async fn serve_conn(&self, mut stream: Box<dyn AsyncStream>) -> std::io::Result<()> {
        let mut line_reader = LineReader::new();
        let line = line_reader.read_line(&mut stream).await?;
        if !line.ends_with(" HTTP/1.0") && !line.ends_with(" HTTP/1.1") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unrecognized http request: {line}"),
            ));
        }

        // GET = 3 (smaller than CONNECT)
        // HTTP/1.1 = 8
        // min address a.ab = 4
        // port 1
        // 3 spaces
        // total = 19
        if line.len() < 19 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid http request: {line}"),
            ));
        }

        if line.starts_with("CONNECT ") {
            let address = line[8..line.len() - 9].to_string();
            self.handle_connect(stream, line_reader, address).await
        } else {
            let request_line = line.to_string();
            self.handle_forward(stream, line_reader, request_line).await
        }
    }

    /// CONNECT: the destination is the request target, default port 443.
    async fn handle_connect(
        &self,
        mut stream: Box<dyn AsyncStream>,
        mut line_reader: LineReader,
        address: String,
    ) -> std::io::Result<()> {
        let location = NetLocation::from_str(&address, Some(443))?;

        // Drain request headers up to the empty line.
        loop {
            let line = line_reader.read_line(&mut stream).await?;
            if line.is_empty() {
                break;
            }
            debug!("Ignored HTTP CONNECT request header: {line}");
        }

        if let Some(handler) = self.user_connect_handler.as_ref() {
            stream.write_all(CONNECT_ESTABLISHED_RESPONSE).await?;
            let request = ProxyRequest {
                stream: wrap_with_leftover(stream, line_reader.unparsed_data()),
                network: Network::Tcp,
                destination: location.to_dial_string(),
                dest_host: location.address().to_string(),
                dest_port: location.port(),
            };
            return handler(request).await;
        }

        let dial_string = location.to_dial_string();
        let mut target_stream = match (self.proxy_dial)(Network::Tcp, dial_string.clone()).await {
            Ok(dialed) => dialed.stream,
            Err(e) => {
                write_service_unavailable(&mut stream, &e).await?;
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("connect to {} failed: {}", dial_string, e),
                ));
            }
        };

        stream.write_all(CONNECT_ESTABLISHED_RESPONSE).await?;

        let mut client_stream = wrap_with_leftover(stream, line_reader.unparsed_data());
        let mut buf1 = PooledBuf::acquire(self.bytes_pool.as_ref());
        let mut buf2 = PooledBuf::acquire(self.bytes_pool.as_ref());
        tunnel(
            &mut target_stream,
            &mut client_stream,
            buf1.as_mut_slice(),
            buf2.as_mut_slice(),
            &self.cancel,
        )
        .await
    }

    /// A plain proxied request with an absolute URI in the request line:
    ///
    /// ```text
    /// GET http://ipinfo.io/ HTTP/1.1
    /// <headers follow..>
    /// <empty line>
    /// ```
    ///
    /// The parsed request is re-serialized (original request line kept) and
    /// must reach the upstream before byte-level tunneling takes over.
    async fn handle_forward(
        &self,
        mut stream: Box<dyn AsyncStream>,
        mut line_reader: LineReader,
        request_line: String,
    ) -> std::io::Result<()> {
        let line = &request_line[0..request_line.len() - 9];

        let space_index = line.find(' ').ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unrecognized http request: {request_line}"),
            )
        })?;
        let url = &line[space_index + 1..];

        let (default_port, rest) = if let Some(rest) = url.strip_prefix("http://") {
            (80, rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (443, rest)
        } else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unsupported http forward url: {url}"),
            ));
        };

        let authority = match rest.find('/') {
            Some(i) => &rest[0..i],
            None => rest,
        };
        let location = NetLocation::from_str(authority, Some(default_port))?;

        let mut request = format!("{request_line}\r\n");

        // Collect headers up to the empty line, dropping hop-by-hop
        // connection headers: with them we would have to parse the upstream
        // response to know where it ends before serving another request, so
        // force Connection: close instead.
        loop {
            let line = line_reader.read_line(&mut stream).await?;
            if line.is_empty() {
                break;
            }

            let lowercase_line = line.to_ascii_lowercase();
            if lowercase_line.starts_with(CONNECTION_HEADER_PREFIX)
                || lowercase_line.starts_with(PROXY_CONNECTION_HEADER_PREFIX)
            {
                continue;
            }

            request.push_str(line);
            request.push_str("\r\n");

            if request.len() > MAX_REQUEST_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "HTTP request is too long",
                ));
            }
        }
        request.push_str("Connection: close\r\n\r\n");

        let mut initial_data = request.into_bytes();
        initial_data.extend_from_slice(line_reader.unparsed_data());

        if let Some(handler) = self.user_connect_handler.as_ref() {
            // The handler sees wire-form bytes: the re-serialized request is
            // served first, then reads fall through to the raw stream.
            let request = ProxyRequest {
                stream: Box::new(PrefixedStream::new(initial_data, stream)),
                network: Network::Tcp,
                destination: location.to_dial_string(),
                dest_host: location.address().to_string(),
                dest_port: location.port(),
            };
            return handler(request).await;
        }

        let dial_string = location.to_dial_string();
        let mut target_stream = match (self.proxy_dial)(Network::Tcp, dial_string.clone()).await {
            Ok(dialed) => dialed.stream,
            Err(e) => {
                write_service_unavailable(&mut stream, &e).await?;
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("connect to {} failed: {}", dial_string, e),
                ));
            }
        };

        // The upstream must observe the request that triggered the proxying
        // before raw tunneling takes over. No success line is written to the
        // client here: the upstream's own response is what it expects.
        target_stream.write_all(&initial_data).await?;

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

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

fn wrap_with_leftover(stream: Box<dyn AsyncStream>, leftover: &[u8]) -> Box<dyn AsyncStream> {
    if leftover.is_empty() {
        stream
    } else {
        Box::new(PrefixedStream::new(leftover.to_vec(), stream))
    }
}

async fn write_service_unavailable(
    stream: &mut Box<dyn AsyncStream>,
    err: &std::io::Error,
) -> std::io::Result<()> {
    let body = format!("{}\n", err);
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await
}
