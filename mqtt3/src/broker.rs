//! MQTT 3.1 / 3.1.1 broker.
//!
//! The broker owns the session [`Registry`] and runs one session per
//! [`Connection`]. Hosts either hand it connections they accepted
//! themselves through [`Broker::run`], or let [`Broker::serve`] run a TCP
//! accept loop.
//!
//! A PUBLISH is forwarded as the exact frame bytes the publisher sent to
//! every session with a matching filter, the publisher included.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{BufferWriter, Codec, Frame, MAX_PACKET_SIZE, Packet, Publish};
use crate::registry::Registry;
use crate::session;
use crate::topic;
use crate::transport::Connection;
use crate::types::{Handler, ProtocolVersion};

/// Callback type alias.
type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address (host:port) for [`Broker::serve`].
    pub addr: String,
    /// Maximum packet size accepted from a client.
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:1883")
    }
}

impl BrokerConfig {
    /// Create a new broker config.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Set the maximum packet size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }
}

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    handler: Option<Arc<dyn Handler>>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            handler: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Set the message handler, called for every accepted PUBLISH.
    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set the on_connect callback.
    pub fn on_connect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Set the on_disconnect callback.
    pub fn on_disconnect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        Broker {
            ctx: Arc::new(BrokerContext {
                config: self.config,
                handler: self.handler,
                on_connect: self.on_connect,
                on_disconnect: self.on_disconnect,
                registry: Registry::new(),
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(1),
            }),
            running: AtomicBool::new(false),
        }
    }
}

/// State shared by the broker and every session it runs.
pub(crate) struct BrokerContext {
    pub(crate) config: BrokerConfig,
    pub(crate) handler: Option<Arc<dyn Handler>>,
    pub(crate) on_connect: Option<Callback>,
    pub(crate) on_disconnect: Option<Callback>,
    pub(crate) registry: Registry,
    /// Parent of every session token.
    pub(crate) shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl BrokerContext {
    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Write `frame` to every live session subscribed to `topic`.
    ///
    /// Returns the number of sessions the frame was written to. A failed
    /// write closes the target session and does not affect the others.
    /// Fan-out stops as soon as `cancel` (the publisher's token) fires.
    pub(crate) async fn route(
        &self,
        topic: &str,
        frame: &Frame<'_>,
        cancel: &CancellationToken,
    ) -> usize {
        let sessions = self.registry.snapshot();
        let mut delivered = 0;

        for session in sessions.iter().filter(|s| s.is_subscribed(topic)) {
            let written = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Fan-out of {} stopped after {} sessions", topic, delivered);
                    break;
                }
                result = session.write_frame(frame) => result,
            };
            match written {
                Ok(()) => delivered += 1,
                Err(e) if e.is_disconnect() => {
                    trace!("Skipping closed session {} for {}", session, topic);
                }
                Err(e) => {
                    warn!("Failed to forward {} to {}: {}", topic, session, e);
                    session.close();
                }
            }
        }
        delivered
    }
}

/// MQTT 3.1 / 3.1.1 broker.
pub struct Broker {
    ctx: Arc<BrokerContext>,
    running: AtomicBool,
}

impl Broker {
    /// Create a new broker with the given config.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    /// Run one session over `conn` until it terminates.
    ///
    /// Returns `Ok(())` when the client disconnects, the stream closes or a
    /// cancellation token fires, and the protocol error otherwise.
    pub async fn run(&self, conn: Connection) -> Result<()> {
        session::run(Arc::clone(&self.ctx), conn).await
    }

    /// Accept TCP connections on the configured address until
    /// [`Broker::shutdown`] is called.
    pub async fn serve(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.ctx.config.addr).await?;
        info!("Broker listening on {}", self.ctx.config.addr);

        loop {
            let (stream, addr) = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    info!("Broker on {} shutting down", self.ctx.config.addr);
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            debug!("Accepted connection from {}", addr);

            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let conn = Connection::from_tcp(stream).with_peer(addr.to_string());
                if let Err(e) = session::run(ctx, conn).await {
                    debug!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }

    /// Publish a QoS 0 message from the broker itself.
    ///
    /// Returns the number of sessions it was delivered to.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<usize> {
        topic::validate_topic(topic)?;

        // A QoS 0 PUBLISH is byte-identical in 3.1 and 3.1.1.
        let packet = Packet::Publish(Publish::new(topic, payload));
        let mut out = BufferWriter::new();
        Codec::new(ProtocolVersion::V311).write_packet(&packet, &mut out)?;
        let (frame, _) = Frame::parse(out.written())?
            .ok_or_else(|| Error::protocol("encoded PUBLISH did not form a frame"))?;

        Ok(self.ctx.route(topic, &frame, &self.ctx.shutdown).await)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.ctx.registry.len()
    }

    /// The live session registry.
    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    /// Stop the accept loop and terminate every session.
    ///
    /// A broker that has been shut down cannot be restarted.
    pub fn shutdown(&self) {
        self.ctx.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }
}
