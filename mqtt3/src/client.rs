//! MQTT 3.1 / 3.1.1 client.
//!
//! One background task owns the read half. It answers inbound QoS 1/2
//! publishes, hands acknowledgements to the caller waiting on that packet
//! id, and queues application messages for [`Client::recv`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    BufferWriter, Codec, Connect, FrameReader, MAX_PACKET_SIZE, Packet, Publish, Subscribe,
    SubscribeReturnCode, TopicFilter, Unsubscribe,
};
use crate::topic;
use crate::transport::{BoxedStream, Connection};
use crate::types::{ConnectReturnCode, Message, ProtocolVersion, QoS};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker address, used by [`Client::connect_tcp`].
    pub addr: String,
    /// Client ID. Empty asks the broker to assign one (clean session only).
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep alive interval in seconds.
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Maximum packet size accepted from the broker.
    pub max_packet_size: usize,
    /// Protocol version.
    pub protocol_version: ProtocolVersion,
    /// Send PINGREQ every `keep_alive / 2` seconds.
    pub auto_keepalive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:1883", "")
    }
}

impl ClientConfig {
    /// Create a new client config (defaults to MQTT 3.1.1).
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            max_packet_size: MAX_PACKET_SIZE,
            protocol_version: ProtocolVersion::V311,
            auto_keepalive: true,
        }
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set protocol version.
    pub fn with_protocol(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Enable or disable automatic keep-alive.
    pub fn with_auto_keepalive(mut self, enabled: bool) -> Self {
        self.auto_keepalive = enabled;
        self
    }

    /// Set the maximum packet size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() && !self.clean_session {
            return Err(Error::InvalidConfig(
                "empty client id requires clean session".to_string(),
            ));
        }
        if self.max_packet_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "max packet size {} is too small",
                self.max_packet_size
            )));
        }
        Ok(())
    }

    fn connect_packet(&self) -> Connect {
        Connect {
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive,
            clean_session: self.clean_session,
            username: self.username.clone(),
            password: self.password.clone().map(Bytes::from),
            will: None,
        }
    }
}

struct Outbound {
    writer: WriteHalf<BoxedStream>,
    buf: BufferWriter,
}

/// State shared between the client handle, its read task and its
/// keep-alive task.
struct Shared {
    client_id: String,
    codec: Codec,
    outbound: Mutex<Outbound>,
    /// Callers waiting for an acknowledgement, by packet id.
    pending: SyncMutex<HashMap<u16, oneshot::Sender<Packet>>>,
    /// Active subscription filters.
    filters: SyncMutex<HashSet<String>>,
    next_pkid: AtomicU16,
    cancel: CancellationToken,
}

impl Shared {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        let mut outbound = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.outbound.lock() => guard,
        };
        let Outbound { writer, buf } = &mut *outbound;

        buf.reset();
        self.codec.write_packet(packet, buf)?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                writer.write_all(buf.written()).await?;
                writer.flush().await
            } => result.map_err(Error::from),
        }
    }

    /// Take a packet id no other request is waiting on, with the slot its
    /// acknowledgement is delivered to. Wraps around and never returns 0.
    fn reserve(&self) -> Result<PendingAck<'_>> {
        let mut pending = self.pending.lock();
        for _ in 0..=u16::MAX {
            let pkid = self.next_pkid.fetch_add(1, Ordering::Relaxed);
            if pkid == 0 || pending.contains_key(&pkid) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(pkid, tx);
            return Ok(PendingAck {
                shared: self,
                pkid,
                rx,
            });
        }
        Err(Error::protocol("every packet id is awaiting an acknowledgement"))
    }

    fn complete(&self, pkid: u16, ack: Packet) {
        match self.pending.lock().remove(&pkid) {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => trace!("Dropping {} for unknown pkid={}", ack.name(), pkid),
        }
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.filters.lock().iter().any(|f| topic::matches(topic, f))
    }
}

/// A packet id held by one request. Released when the acknowledgement
/// arrives or the request is dropped.
struct PendingAck<'a> {
    shared: &'a Shared,
    pkid: u16,
    rx: oneshot::Receiver<Packet>,
}

impl PendingAck<'_> {
    /// Send `packet` and wait for the acknowledgement carrying this id.
    async fn send(mut self, packet: &Packet) -> Result<Packet> {
        self.shared.write_packet(packet).await?;
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(Error::Cancelled),
            ack = &mut self.rx => ack.map_err(|_| Error::ConnectionClosed),
        }
    }
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.pkid);
    }
}

/// MQTT 3.1 / 3.1.1 client.
pub struct Client {
    shared: Arc<Shared>,
    messages: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Client {
    /// Open a TCP connection to `config.addr` and connect.
    pub async fn connect_tcp(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::tcp(&config.addr).await?;
        Self::connect(conn, config).await
    }

    /// Connect over an established connection.
    ///
    /// Sends CONNECT and waits for CONNACK. A refused CONNACK yields
    /// [`Error::ConnectionRefused`].
    pub async fn connect(conn: Connection, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            "Connecting to {} as {:?} ({})",
            conn.peer(),
            config.client_id,
            config.protocol_version
        );

        let (mut reader, mut writer, cancel, _) = conn.into_parts();
        let codec = Codec::new(config.protocol_version);

        let mut buf = BufferWriter::new();
        codec.write_packet(&Packet::Connect(config.connect_packet()), &mut buf)?;
        writer.write_all(buf.written()).await?;
        writer.flush().await?;

        let mut frames = FrameReader::new(config.max_packet_size);
        let packet = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            frame = frames.next_frame(&mut reader) => codec.decode(&frame?)?,
        };
        match packet {
            Packet::ConnAck(connack) => {
                if connack.code != ConnectReturnCode::Accepted {
                    return Err(Error::ConnectionRefused(format!("{:?}", connack.code)));
                }
                debug!(
                    "Connected successfully, session_present={}",
                    connack.session_present
                );
            }
            other => {
                return Err(Error::UnexpectedPacket {
                    expected: "ConnAck".to_string(),
                    got: format!("{:?}", other),
                });
            }
        }

        let shared = Arc::new(Shared {
            client_id: config.client_id,
            codec,
            outbound: Mutex::new(Outbound { writer, buf }),
            pending: SyncMutex::new(HashMap::new()),
            filters: SyncMutex::new(HashSet::new()),
            next_pkid: AtomicU16::new(1),
            cancel,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_task(Arc::clone(&shared), frames, reader, tx));

        if config.auto_keepalive && config.keep_alive > 0 {
            let interval = Duration::from_secs((config.keep_alive / 2).max(1) as u64);
            tokio::spawn(keepalive_task(Arc::clone(&shared), interval));
            debug!("Started auto keepalive task (interval={:?})", interval);
        }

        Ok(Self {
            shared,
            messages: Mutex::new(rx),
        })
    }

    /// Get the client ID.
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.shared.codec.version()
    }

    /// Publish a message (QoS 0, fire and forget).
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_with_retain(topic, payload, false).await
    }

    /// Publish a QoS 0 message with retain flag.
    pub async fn publish_with_retain(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        retain: bool,
    ) -> Result<()> {
        topic::validate_topic(topic)?;
        let publish = Publish::new(topic, payload).with_retain(retain);
        trace!("Publishing to {} ({} bytes)", topic, publish.payload.len());
        self.shared.write_packet(&Packet::Publish(publish)).await
    }

    /// Publish at QoS 1 and wait for the PUBACK.
    ///
    /// Returns the acknowledged packet id.
    pub async fn publish_qos1(&self, topic: &str, payload: impl Into<Bytes>) -> Result<u16> {
        topic::validate_topic(topic)?;
        let ack = self.shared.reserve()?;
        let pkid = ack.pkid;
        let publish = Publish::new(topic, payload).with_qos(QoS::AtLeastOnce, Some(pkid));
        trace!("Publishing to {} at QoS 1, pkid={}", topic, pkid);

        match ack.send(&Packet::Publish(publish)).await? {
            Packet::PubAck(acked) => Ok(acked),
            other => Err(Error::UnexpectedPacket {
                expected: "PubAck".to_string(),
                got: format!("{:?}", other),
            }),
        }
    }

    /// Subscribe to topic filters.
    ///
    /// Returns the broker's return code for each filter, in order. Filters
    /// the broker refused are not tracked.
    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<Vec<SubscribeReturnCode>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }
        for (filter, _) in filters {
            topic::validate_filter(filter)?;
        }

        let ack = self.shared.reserve()?;
        let pkid = ack.pkid;
        debug!("Subscribing to {:?} with pkid={}", filters, pkid);

        // Track filters before sending so publishes that race the SUBACK
        // are not dropped.
        let added: Vec<String> = {
            let mut active = self.shared.filters.lock();
            filters
                .iter()
                .filter(|(f, _)| active.insert(f.to_string()))
                .map(|(f, _)| f.to_string())
                .collect()
        };

        let packet = Packet::Subscribe(Subscribe {
            pkid,
            filters: filters
                .iter()
                .map(|(path, qos)| TopicFilter::new(*path, *qos))
                .collect(),
        });
        let result = match ack.send(&packet).await {
            Ok(Packet::SubAck(suback)) => Ok(suback.return_codes),
            Ok(other) => Err(Error::UnexpectedPacket {
                expected: "SubAck".to_string(),
                got: format!("{:?}", other),
            }),
            Err(e) => Err(e),
        };

        let mut active = self.shared.filters.lock();
        match result {
            Ok(codes) => {
                debug!("Received SubAck for pkid={}: {:?}", pkid, codes);
                for ((filter, _), code) in filters.iter().zip(&codes) {
                    if *code == SubscribeReturnCode::Failure && added.iter().any(|a| a == filter) {
                        active.remove(*filter);
                    }
                }
                Ok(codes)
            }
            Err(e) => {
                for filter in &added {
                    active.remove(filter);
                }
                Err(e)
            }
        }
    }

    /// Unsubscribe from topic filters.
    pub async fn unsubscribe(&self, filters: &[&str]) -> Result<()> {
        if filters.is_empty() {
            return Ok(());
        }

        let ack = self.shared.reserve()?;
        let pkid = ack.pkid;
        debug!("Unsubscribing from {:?} with pkid={}", filters, pkid);

        let packet = Packet::Unsubscribe(Unsubscribe {
            pkid,
            topics: filters.iter().map(|f| f.to_string()).collect(),
        });
        match ack.send(&packet).await? {
            Packet::UnsubAck(_) => {
                let mut active = self.shared.filters.lock();
                for filter in filters {
                    active.remove(*filter);
                }
                Ok(())
            }
            other => Err(Error::UnexpectedPacket {
                expected: "UnsubAck".to_string(),
                got: format!("{:?}", other),
            }),
        }
    }

    /// Receive the next message.
    ///
    /// Fails with [`Error::ConnectionClosed`] once the connection is gone
    /// and every queued message has been read.
    pub async fn recv(&self) -> Result<Message> {
        let mut messages = self.messages.lock().await;
        messages.recv().await.ok_or(Error::ConnectionClosed)
    }

    /// Receive a message with timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Send a ping request.
    pub async fn ping(&self) -> Result<()> {
        trace!("Sending PingReq");
        self.shared.write_packet(&Packet::PingReq).await
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) -> Result<()> {
        debug!("Disconnecting {}", self.shared.client_id);
        let result = self.shared.write_packet(&Packet::Disconnect).await;
        self.shared.outbound.lock().await.writer.shutdown().await.ok();
        self.shared.cancel.cancel();
        result
    }

    /// Check if the client is still running (not disconnected).
    pub fn is_running(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Background task owning the read half.
async fn read_task(
    shared: Arc<Shared>,
    mut frames: FrameReader,
    mut reader: ReadHalf<BoxedStream>,
    messages: mpsc::UnboundedSender<Message>,
) {
    let result = read_loop(&shared, &mut frames, &mut reader, &messages).await;
    match result {
        Err(e) if e.is_disconnect() => debug!("Client {} read loop ended: {}", shared.client_id, e),
        Err(e) => warn!("Client {} read loop failed: {}", shared.client_id, e),
        Ok(()) => {}
    }

    shared.cancel.cancel();
    // Dropping the senders wakes every waiter with ConnectionClosed.
    shared.pending.lock().clear();
}

async fn read_loop(
    shared: &Shared,
    frames: &mut FrameReader,
    reader: &mut ReadHalf<BoxedStream>,
    messages: &mpsc::UnboundedSender<Message>,
) -> Result<()> {
    loop {
        let packet = tokio::select! {
            _ = shared.cancel.cancelled() => return Err(Error::Cancelled),
            frame = frames.next_frame(reader) => shared.codec.decode(&frame?)?,
        };
        trace!("Received {}", packet.name());

        match packet {
            Packet::Publish(publish) => {
                match (publish.qos, publish.pkid) {
                    (QoS::AtLeastOnce, Some(pkid)) => {
                        shared.write_packet(&Packet::PubAck(pkid)).await?;
                    }
                    (QoS::ExactlyOnce, Some(pkid)) => {
                        shared.write_packet(&Packet::PubRec(pkid)).await?;
                    }
                    _ => {}
                }

                if !shared.is_subscribed(&publish.topic) {
                    trace!("Dropping message on {} (no matching filter)", publish.topic);
                    continue;
                }
                let msg = Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                };
                if messages.send(msg).is_err() {
                    return Err(Error::Cancelled);
                }
            }
            Packet::PubRel(pkid) => shared.write_packet(&Packet::PubComp(pkid)).await?,
            Packet::PubAck(pkid) => shared.complete(pkid, Packet::PubAck(pkid)),
            Packet::SubAck(suback) => shared.complete(suback.pkid, Packet::SubAck(suback)),
            Packet::UnsubAck(pkid) => shared.complete(pkid, Packet::UnsubAck(pkid)),
            Packet::PingResp => trace!("Received PingResp"),
            Packet::Disconnect => return Err(Error::ConnectionClosed),
            other => trace!("Ignoring packet: {:?}", other),
        }
    }
}

/// Background task for automatic keep-alive.
async fn keepalive_task(shared: Arc<Shared>, interval: Duration) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                trace!("Keepalive task stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = shared.write_packet(&Packet::PingReq).await {
            if !e.is_disconnect() {
                warn!("Keepalive ping failed: {}", e);
                shared.cancel.cancel();
            }
            return;
        }
        trace!("Keepalive ping sent");
    }
}
