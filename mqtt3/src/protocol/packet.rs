//! MQTT 3.x control packets.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::{ConnectReturnCode, PacketType, QoS};

/// A decoded MQTT 3.x control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Short upper-case name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// CONNECT packet.
///
/// The protocol name and level are not stored here: they are fixed by the
/// [`Codec`](super::Codec) version that reads or writes the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<LastWill>,
}

impl Connect {
    /// A clean-session CONNECT with no credentials or will.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: 60,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Last Will and Testament.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet. `session_present` is always false on MQTT 3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn accepted() -> Self {
        Self {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        }
    }
}

/// PUBLISH packet.
///
/// `pkid` must be present exactly when `qos` is above 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub pkid: Option<u16>,
}

impl Publish {
    /// A QoS 0 publish.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            pkid: None,
        }
    }

    /// Set the QoS together with the packet id it requires.
    pub fn with_qos(mut self, qos: QoS, pkid: Option<u16>) -> Self {
        self.qos = qos;
        self.pkid = pkid;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Check that `pkid`, `qos` and `dup` are consistent.
    pub fn validate(&self) -> Result<()> {
        match (self.qos, self.pkid) {
            (QoS::AtMostOnce, Some(_)) => {
                return Err(Error::protocol("QoS 0 PUBLISH must not carry a packet id"));
            }
            (QoS::AtMostOnce, None) => {
                if self.dup {
                    return Err(Error::protocol("QoS 0 PUBLISH must not set DUP"));
                }
            }
            (_, None) => return Err(Error::protocol("QoS > 0 PUBLISH requires a packet id")),
            (_, Some(0)) => return Err(Error::protocol("packet id must be non-zero")),
            (_, Some(_)) => {}
        }
        Ok(())
    }
}

/// Topic filter with requested QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub path: String,
    pub qos: QoS,
}

impl TopicFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            qos,
        }
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<TopicFilter>,
}

/// SUBACK packet: one return code per requested filter, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// SUBACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SubscribeReturnCode::Success(QoS::AtMostOnce)),
            1 => Ok(SubscribeReturnCode::Success(QoS::AtLeastOnce)),
            2 => Ok(SubscribeReturnCode::Success(QoS::ExactlyOnce)),
            0x80 => Ok(SubscribeReturnCode::Failure),
            other => Err(Error::protocol(format!(
                "invalid SUBACK return code {:#04x}",
                other
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_validate() {
        assert!(Publish::new("a", "x").validate().is_ok());
        assert!(
            Publish::new("a", "x")
                .with_qos(QoS::AtLeastOnce, Some(7))
                .validate()
                .is_ok()
        );
        assert!(
            Publish::new("a", "x")
                .with_qos(QoS::AtLeastOnce, None)
                .validate()
                .is_err()
        );
        assert!(
            Publish::new("a", "x")
                .with_qos(QoS::AtMostOnce, Some(1))
                .validate()
                .is_err()
        );
        assert!(
            Publish::new("a", "x")
                .with_qos(QoS::ExactlyOnce, Some(0))
                .validate()
                .is_err()
        );

        let mut dup = Publish::new("a", "x");
        dup.dup = true;
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_suback_codes() {
        assert_eq!(
            SubscribeReturnCode::from_u8(1).unwrap(),
            SubscribeReturnCode::Success(QoS::AtLeastOnce)
        );
        assert_eq!(
            SubscribeReturnCode::from_u8(0x80).unwrap(),
            SubscribeReturnCode::Failure
        );
        assert!(SubscribeReturnCode::from_u8(3).is_err());
        assert_eq!(SubscribeReturnCode::Failure.to_u8(), 0x80);
    }

    #[test]
    fn test_packet_names() {
        assert_eq!(Packet::PingReq.name(), "PINGREQ");
        assert_eq!(Packet::PubRel(3).packet_type(), PacketType::PubRel);
    }
}
