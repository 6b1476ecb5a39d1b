//! Common types for mqtt3.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// MQTT protocol version.
///
/// Only the 3.x family is spoken. A CONNECT asking for level 5 is answered
/// with [`Error::Unsupported`] before the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (protocol name "MQIsdp", level 3)
    V310,
    /// MQTT 3.1.1 (protocol name "MQTT", level 4)
    #[default]
    V311,
}

impl ProtocolVersion {
    /// Protocol name carried in CONNECT.
    pub const fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V310 => "MQIsdp",
            ProtocolVersion::V311 => "MQTT",
        }
    }

    /// Protocol level byte carried in CONNECT.
    pub const fn level(self) -> u8 {
        match self {
            ProtocolVersion::V310 => 3,
            ProtocolVersion::V311 => 4,
        }
    }

    /// Resolve a (name, level) pair read from a CONNECT body.
    pub fn from_name_and_level(name: &str, level: u8) -> Result<Self> {
        match (name, level) {
            ("MQTT", 4) => Ok(ProtocolVersion::V311),
            ("MQIsdp", 3) => Ok(ProtocolVersion::V310),
            ("MQTT", 5) => Err(Error::Unsupported("MQTT 5.0".to_string())),
            _ => Err(Error::protocol(format!(
                "protocol '{}' level {} is not supported",
                name, level
            ))),
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V310 => write!(f, "MQTT 3.1"),
            ProtocolVersion::V311 => write!(f, "MQTT 3.1.1"),
        }
    }
}

/// Quality of Service level.
///
/// QoS 0 and 1 are fully handled. QoS 2 handshake packets are encoded,
/// decoded and acknowledged but no exactly-once state is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery.
    AtLeastOnce = 1,
    /// Exactly once delivery.
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse a QoS level; 3 is malformed.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(Error::protocol(format!("invalid QoS level {}", other))),
        }
    }
}

/// MQTT control packet type (high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Resolve the packet type from a fixed header byte.
    pub fn from_header(header: u8) -> Result<Self> {
        let kind = header >> 4;
        Ok(match kind {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return Err(Error::protocol(format!("invalid packet type {}", kind))),
        })
    }

    /// Build a fixed header byte with the given low-nibble flags.
    pub const fn header(self, flags: u8) -> u8 {
        ((self as u8) << 4) | (flags & 0x0F)
    }
}

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUserNameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => {
                return Err(Error::protocol(format!(
                    "invalid connect return code {}",
                    other
                )));
            }
        })
    }
}

/// Application message as seen by handlers and client receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Delivery QoS.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Set QoS.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

/// Observer of every PUBLISH the broker accepts.
pub trait Handler: Send + Sync {
    /// Handle an incoming message.
    ///
    /// Called after the message has been routed to subscribers.
    fn handle(&self, client_id: &str, msg: &Message);
}

/// Function-based handler.
impl<F> Handler for F
where
    F: Fn(&str, &Message) + Send + Sync,
{
    fn handle(&self, client_id: &str, msg: &Message) {
        self(client_id, msg)
    }
}
