//! Server-side session: the life of one client connection.
//!
//! ```text
//! AwaitingVersion --CONNECT--> Running --DISCONNECT / error / cancel--> Terminated
//! ```
//!
//! The read side is owned by the task running [`run`]. The write side lives
//! in a [`SessionHandle`] shared through the registry, because other
//! sessions write forwarded PUBLISH frames into it during fan-out.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::BrokerContext;
use crate::error::{Error, Result};
use crate::protocol::{
    BufferWriter, Codec, ConnAck, Connect, Frame, FrameReader, Packet, Publish, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe, detect_version,
};
use crate::topic;
use crate::transport::{BoxedStream, Connection};
use crate::trie::SubscriptionIndex;
use crate::types::{Message, ProtocolVersion, QoS};

/// Upper bound on closing the write half of a terminated session.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Write half and its frame buffer; only touched under the handle's lock.
struct Outbound {
    writer: WriteHalf<BoxedStream>,
    buf: BufferWriter,
}

/// Shared side of a session: identity, subscriptions and the locked writer.
pub struct SessionHandle {
    id: u64,
    peer: String,
    client_id: OnceLock<String>,
    codec: Codec,
    subscriptions: RwLock<SubscriptionIndex>,
    outbound: Mutex<Outbound>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        id: u64,
        peer: String,
        codec: Codec,
        writer: WriteHalf<BoxedStream>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            client_id: OnceLock::new(),
            codec,
            subscriptions: RwLock::new(SubscriptionIndex::new()),
            outbound: Mutex::new(Outbound {
                writer,
                buf: BufferWriter::new(),
            }),
            cancel,
        }
    }

    /// Broker-local session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Client id from CONNECT, once the session is running.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.get().map(String::as_str)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.codec.version()
    }

    /// Whether any of this session's filters matches `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.read().matches(topic)
    }

    /// Ask the session to terminate.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write a frame unchanged.
    pub async fn write_frame(&self, frame: &Frame<'_>) -> Result<()> {
        self.write_with(|_, buf| frame.write_to(buf)).await
    }

    /// Encode and write a packet.
    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        trace!("Sending {} to {}", packet.name(), self);
        self.write_with(|codec, buf| codec.write_packet(packet, buf)).await
    }

    async fn write_with<F>(&self, fill: F) -> Result<()>
    where
        F: FnOnce(&Codec, &mut BufferWriter) -> Result<()>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut outbound = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.outbound.lock() => guard,
        };
        let Outbound { writer, buf } = &mut *outbound;

        buf.reset();
        fill(&self.codec, buf)?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                writer.write_all(buf.written()).await?;
                writer.flush().await
            } => result.map_err(Error::from),
        }
    }

    /// Close the write side.
    ///
    /// Called after the session is cancelled, so a writer holding the lock
    /// gives it up promptly. Still bounded, in case the stream never yields.
    async fn shutdown(&self) {
        let closed = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            let mut outbound = self.outbound.lock().await;
            outbound.writer.shutdown().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!("Shutdown of {} failed: {}", self, e),
            Err(_) => debug!("Shutdown of {} timed out", self),
        }
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(id) => write!(f, "{}", id),
            None => write!(f, "{} (#{})", self.peer, self.id),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("client_id", &self.client_id.get())
            .field("version", &self.codec.version())
            .finish()
    }
}

/// Removes the session from the registry and cancels it however `run` ends.
struct SessionGuard {
    ctx: Arc<BrokerContext>,
    handle: Arc<SessionHandle>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.handle.cancel.cancel();
        self.ctx.registry.remove(self.handle.id);
        if let Some(client_id) = self.handle.client_id() {
            info!("Client {} disconnected", client_id);
            if let Some(ref on_disconnect) = self.ctx.on_disconnect {
                on_disconnect(client_id);
            }
        }
    }
}

enum Flow {
    Continue,
    Disconnect,
}

/// Drive one connection until it terminates.
///
/// Orderly ends (DISCONNECT, peer closed, cancelled) return `Ok(())`.
pub(crate) async fn run(ctx: Arc<BrokerContext>, conn: Connection) -> Result<()> {
    let (mut reader, mut writer, conn_cancel, peer) = conn.into_parts();
    let cancel = ctx.shutdown.child_token();
    let mut frames = FrameReader::new(ctx.config.max_packet_size);

    // AwaitingVersion: the first frame fixes the protocol version.
    let first = read_frame(&mut frames, &mut reader, &conn_cancel, &cancel, None)
        .await
        .and_then(|frame| {
            let version = detect_version(&frame)?;
            let codec = Codec::new(version);
            match codec.decode(&frame)? {
                Packet::Connect(connect) => Ok((codec, connect)),
                other => Err(Error::protocol(format!("expected CONNECT, got {}", other.name()))),
            }
        });
    let (codec, connect) = match first {
        Ok(first) => first,
        Err(e) => {
            let _ = writer.shutdown().await;
            return finish(&peer, e);
        }
    };
    debug!("Detected {} from {}", codec.version(), peer);

    let handle = Arc::new(SessionHandle::new(
        ctx.next_session_id(),
        peer,
        codec,
        writer,
        cancel,
    ));
    ctx.registry.add(Arc::clone(&handle));
    link_cancel(conn_cancel.clone(), handle.cancel.clone());
    let _guard = SessionGuard {
        ctx: Arc::clone(&ctx),
        handle: Arc::clone(&handle),
    };

    let mut session = Session {
        ctx: &ctx,
        handle: &handle,
        keep_alive: None,
    };
    let result = session
        .serve(connect, &mut frames, &mut reader, &conn_cancel)
        .await;

    // Terminated: no new fan-out write may start on this transport.
    handle.close();
    ctx.registry.remove(handle.id);
    handle.shutdown().await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => finish(&handle.to_string(), e),
    }
}

/// Cancel the session token when the connection token fires.
///
/// Writers blocked on this session (other sessions fanning out to it)
/// only watch the session token, so connection cancellation must reach it.
/// The task ends with whichever token fires first.
fn link_cancel(conn_cancel: CancellationToken, session: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = conn_cancel.cancelled() => session.cancel(),
            _ = session.cancelled() => {}
        }
    });
}

fn finish(who: &str, err: Error) -> Result<()> {
    if err.is_disconnect() {
        debug!("Session {} ended: {}", who, err);
        return Ok(());
    }
    warn!("Session {} terminated: {}", who, err);
    Err(err)
}

/// Read the next frame, bounded by both cancellation tokens and the
/// keep-alive deadline.
async fn read_frame<'f, R>(
    frames: &'f mut FrameReader,
    reader: &mut R,
    conn_cancel: &CancellationToken,
    cancel: &CancellationToken,
    keep_alive: Option<Duration>,
) -> Result<Frame<'f>>
where
    R: AsyncRead + Unpin,
{
    let read = async move {
        match keep_alive {
            Some(limit) => tokio::time::timeout(limit, frames.next_frame(reader))
                .await
                .map_err(|_| Error::Timeout(format!("keep-alive expired after {:?}", limit)))?,
            None => frames.next_frame(reader).await,
        }
    };
    tokio::select! {
        _ = conn_cancel.cancelled() => Err(Error::Cancelled),
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = read => result,
    }
}

/// Read-side state of a running session.
struct Session<'a> {
    ctx: &'a BrokerContext,
    handle: &'a Arc<SessionHandle>,
    keep_alive: Option<Duration>,
}

impl Session<'_> {
    async fn serve(
        &mut self,
        connect: Connect,
        frames: &mut FrameReader,
        reader: &mut ReadHalf<BoxedStream>,
        conn_cancel: &CancellationToken,
    ) -> Result<()> {
        self.handle_connect(connect).await?;

        loop {
            let frame = read_frame(frames, reader, conn_cancel, &self.handle.cancel, self.keep_alive).await?;
            let packet = self.handle.codec.decode(&frame)?;
            trace!("Received {} from {}", packet.name(), self.handle);

            if let Flow::Disconnect = self.dispatch(packet, &frame).await? {
                debug!("Client {} sent DISCONNECT", self.handle);
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet, frame: &Frame<'_>) -> Result<Flow> {
        match packet {
            Packet::Connect(_) => {
                return Err(Error::protocol("second CONNECT on a running session"));
            }
            Packet::Publish(publish) => self.handle_publish(publish, frame).await?,
            Packet::PubRel(pkid) => self.handle.write_packet(&Packet::PubComp(pkid)).await?,
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await?,
            Packet::PingReq => self.handle.write_packet(&Packet::PingResp).await?,
            Packet::Disconnect => return Ok(Flow::Disconnect),
            other => {
                trace!("Ignoring {} from {}", other.name(), self.handle);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<()> {
        let client_id = if connect.client_id.is_empty() {
            format!("auto-{}", self.handle.id)
        } else {
            connect.client_id
        };
        // The guard only reports sessions whose id is set, so set it first.
        let _ = self.handle.client_id.set(client_id);

        if connect.keep_alive > 0 {
            // Disconnect if no packet arrives within 1.5 × keep_alive.
            self.keep_alive = Some(Duration::from_millis(connect.keep_alive as u64 * 1500));
        }

        self.handle
            .write_packet(&Packet::ConnAck(ConnAck::accepted()))
            .await?;

        info!(
            "Client {} connected ({}, keep_alive={}s, peer={})",
            self.handle,
            self.handle.protocol_version(),
            connect.keep_alive,
            self.handle.peer
        );
        if let Some(ref on_connect) = self.ctx.on_connect {
            if let Some(client_id) = self.handle.client_id() {
                on_connect(client_id);
            }
        }
        Ok(())
    }

    async fn handle_publish(&mut self, publish: Publish, frame: &Frame<'_>) -> Result<()> {
        topic::validate_topic(&publish.topic)?;

        match (publish.qos, publish.pkid) {
            (QoS::AtLeastOnce, Some(pkid)) => {
                self.handle.write_packet(&Packet::PubAck(pkid)).await?;
            }
            (QoS::ExactlyOnce, Some(pkid)) => {
                self.handle.write_packet(&Packet::PubRec(pkid)).await?;
            }
            _ => {}
        }

        let delivered = self
            .ctx
            .route(&publish.topic, frame, &self.handle.cancel)
            .await;
        trace!(
            "Routed {} ({} bytes) from {} to {} sessions",
            publish.topic,
            publish.payload.len(),
            self.handle,
            delivered
        );

        if let Some(ref handler) = self.ctx.handler {
            let msg = Message {
                topic: publish.topic,
                payload: publish.payload,
                qos: publish.qos,
                retain: publish.retain,
            };
            handler.handle(self.handle.client_id().unwrap_or_default(), &msg);
        }
        Ok(())
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<()> {
        let return_codes: Vec<SubscribeReturnCode> = {
            let mut index = self.handle.subscriptions.write();
            subscribe
                .filters
                .iter()
                .map(|filter| match index.subscribe(&filter.path) {
                    Ok(_) => {
                        debug!("Client {} subscribed to {}", self.handle, filter.path);
                        SubscribeReturnCode::Success(filter.qos)
                    }
                    Err(e) => {
                        warn!("Client {} rejected filter {:?}: {}", self.handle, filter.path, e);
                        SubscribeReturnCode::Failure
                    }
                })
                .collect()
        };

        self.handle
            .write_packet(&Packet::SubAck(SubAck {
                pkid: subscribe.pkid,
                return_codes,
            }))
            .await
    }

    async fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Result<()> {
        {
            let mut index = self.handle.subscriptions.write();
            for filter in &unsubscribe.topics {
                if index.unsubscribe(filter) {
                    debug!("Client {} unsubscribed from {}", self.handle, filter);
                } else {
                    trace!("Client {} was not subscribed to {}", self.handle, filter);
                }
            }
        }
        self.handle
            .write_packet(&Packet::UnsubAck(unsubscribe.pkid))
            .await
    }
}
