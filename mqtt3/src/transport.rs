//! Transport layer abstraction for MQTT connections.
//!
//! A [`Connection`] is any bidirectional byte stream plus a cancellation
//! token. Sessions and clients only ever see this type, so TCP sockets,
//! in-memory duplex pipes and streams accepted by a host server are all
//! handled the same way.

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Byte stream a [`Connection`] can wrap.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream.
pub type BoxedStream = Box<dyn Stream>;

/// Default MQTT port for plain TCP.
pub const DEFAULT_PORT: u16 = 1883;

/// A bidirectional byte stream and the signal that closes it.
pub struct Connection {
    stream: BoxedStream,
    cancel: CancellationToken,
    peer: String,
}

impl Connection {
    /// Wrap a stream with a fresh cancellation token.
    pub fn new<S: Stream>(stream: S) -> Self {
        Self {
            stream: Box::new(stream),
            cancel: CancellationToken::new(),
            peer: "unknown".to_string(),
        }
    }

    /// Wrap an accepted or connected TCP socket.
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::new(stream).with_peer(peer)
    }

    /// Open a TCP connection.
    ///
    /// Accepts `host:port`, `host`, or the same prefixed with `tcp://` or
    /// `mqtt://`. TLS and WebSocket schemes are rejected.
    pub async fn tcp(addr: &str) -> Result<Self> {
        let target = resolve_addr(addr)?;
        debug!("Connecting to {}", target);
        let stream = TcpStream::connect(&target).await?;
        Ok(Self::from_tcp(stream))
    }

    /// Replace the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the peer label used in logs.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Token that closes this connection when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        ReadHalf<BoxedStream>,
        WriteHalf<BoxedStream>,
        CancellationToken,
        String,
    ) {
        let (reader, writer) = tokio::io::split(self.stream);
        (reader, writer, self.cancel, self.peer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Turn a broker address into a `host:port` string for `TcpStream::connect`.
pub fn resolve_addr(addr: &str) -> Result<String> {
    let rest = match addr.split_once("://") {
        None => addr,
        Some((scheme, rest)) => match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" => rest,
            "tls" | "ssl" | "mqtts" | "ws" | "wss" => {
                return Err(Error::Unsupported(format!("transport scheme '{}'", scheme)));
            }
            _ => return Err(Error::InvalidConfig(format!("unknown scheme in '{}'", addr))),
        },
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(Error::InvalidConfig(format!("missing host in '{}'", addr)));
    }

    let has_port = match rest.rsplit_once(':') {
        // Bare IPv6 literals contain colons but no brackets.
        Some((host, port)) => !port.is_empty() && (host.ends_with(']') || !host.contains(':')),
        None => false,
    };
    if has_port {
        Ok(rest.to_string())
    } else {
        Ok(format!("{}:{}", rest, DEFAULT_PORT))
    }
}
