//! MQTT 3.1 / 3.1.1 packet codec.
//!
//! The two versions differ only in the CONNECT protocol name/level and in
//! the first CONNACK byte (reserved on 3.1, session-present on 3.1.1), so
//! one [`Codec`] parameterized by [`ProtocolVersion`] handles both.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::{ConnectReturnCode, PacketType, ProtocolVersion, QoS};

use super::buffer::BufferWriter;
use super::MAX_REMAINING_LENGTH;
use super::codec::{
    BodyReader, MAX_VARIABLE_INT_LEN, variable_int_digits, write_binary, write_string, write_u8,
    write_u16,
};
use super::frame::Frame;
use super::packet::*;

const CONNECT_RESERVED: u8 = 0x01;
const CONNECT_CLEAN_SESSION: u8 = 0x02;
const CONNECT_WILL: u8 = 0x04;
const CONNECT_WILL_RETAIN: u8 = 0x20;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_USERNAME: u8 = 0x80;

/// Fixed-header flags required on SUBSCRIBE, UNSUBSCRIBE and PUBREL.
const FLAGS_QOS1: u8 = 0x02;

/// Read only the protocol name and level of a CONNECT frame.
///
/// The frame is left untouched so it can be decoded in full afterwards.
pub fn detect_version(frame: &Frame<'_>) -> Result<ProtocolVersion> {
    if frame.packet_type()? != PacketType::Connect {
        return Err(Error::protocol(format!(
            "expected CONNECT as first packet, got header {:#04x}",
            frame.header()
        )));
    }
    let mut r = body_reader(frame)?;
    let name = r.read_string()?;
    let level = r.read_u8()?;
    ProtocolVersion::from_name_and_level(name, level)
}

fn body_reader<'f>(frame: &'f Frame<'_>) -> Result<BodyReader<'f>> {
    if frame.body().is_empty() {
        return Err(Error::protocol("data required but not present"));
    }
    Ok(BodyReader::new(frame.body()))
}

/// Packet codec for one protocol version.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    version: ProtocolVersion,
}

impl Codec {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    // ========================================================================
    // Decode
    // ========================================================================

    /// Decode a frame into a packet. Decoding is all-or-nothing.
    pub fn decode(&self, frame: &Frame<'_>) -> Result<Packet> {
        let packet = match frame.packet_type()? {
            PacketType::Connect => Packet::Connect(self.decode_connect(frame)?),
            PacketType::ConnAck => Packet::ConnAck(self.decode_connack(frame)?),
            PacketType::Publish => Packet::Publish(decode_publish(frame)?),
            PacketType::PubAck => Packet::PubAck(decode_pkid(frame)?),
            PacketType::PubRec => Packet::PubRec(decode_pkid(frame)?),
            PacketType::PubRel => Packet::PubRel(decode_pkid(frame)?),
            PacketType::PubComp => Packet::PubComp(decode_pkid(frame)?),
            PacketType::Subscribe => Packet::Subscribe(decode_subscribe(frame)?),
            PacketType::SubAck => Packet::SubAck(decode_suback(frame)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(decode_unsubscribe(frame)?),
            PacketType::UnsubAck => Packet::UnsubAck(decode_pkid(frame)?),
            PacketType::PingReq => expect_empty(frame, Packet::PingReq)?,
            PacketType::PingResp => expect_empty(frame, Packet::PingResp)?,
            PacketType::Disconnect => expect_empty(frame, Packet::Disconnect)?,
        };
        Ok(packet)
    }

    fn decode_connect(&self, frame: &Frame<'_>) -> Result<Connect> {
        let mut r = body_reader(frame)?;

        let name = r.read_string()?;
        let level = r.read_u8()?;
        let version = ProtocolVersion::from_name_and_level(name, level)?;
        if version != self.version {
            return Err(Error::protocol(format!(
                "CONNECT for {} on a {} session",
                version, self.version
            )));
        }

        let flags = r.read_u8()?;
        if flags & CONNECT_RESERVED != 0 {
            return Err(Error::protocol("CONNECT reserved flag is set"));
        }
        let clean_session = flags & CONNECT_CLEAN_SESSION != 0;
        let will_qos = QoS::from_u8((flags >> 3) & 0x03)?;
        let will_retain = flags & CONNECT_WILL_RETAIN != 0;
        let has_will = flags & CONNECT_WILL != 0;
        if !has_will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(Error::protocol("will QoS/retain set without a will"));
        }
        let has_username = flags & CONNECT_USERNAME != 0;
        let has_password = flags & CONNECT_PASSWORD != 0;
        if has_password && !has_username {
            return Err(Error::protocol("password present without username"));
        }

        let keep_alive = r.read_u16()?;
        let client_id = r.read_string()?.to_string();
        if client_id.is_empty() && !clean_session {
            return Err(Error::protocol(
                "empty client id requires a clean session",
            ));
        }

        let will = if has_will {
            let topic = r.read_string()?.to_string();
            let payload = Bytes::copy_from_slice(r.read_binary()?);
            Some(LastWill {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };
        let username = if has_username {
            Some(r.read_string()?.to_string())
        } else {
            None
        };
        let password = if has_password {
            Some(Bytes::copy_from_slice(r.read_binary()?))
        } else {
            None
        };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session,
            username,
            password,
            will,
        })
    }

    fn decode_connack(&self, frame: &Frame<'_>) -> Result<ConnAck> {
        let mut r = body_reader(frame)?;
        let first = r.read_u8()?;
        let code = ConnectReturnCode::from_u8(r.read_u8()?)?;
        let session_present = match self.version {
            ProtocolVersion::V310 => false,
            ProtocolVersion::V311 => first & 0x01 != 0,
        };
        Ok(ConnAck {
            session_present,
            code,
        })
    }

    // ========================================================================
    // Encode
    // ========================================================================

    /// Encode the body of `packet` into `out` and return its fixed header
    /// byte. The same invariants as [`Codec::decode`] are checked first, so
    /// nothing is written for an invalid packet.
    pub fn encode(&self, packet: &Packet, out: &mut BufferWriter) -> Result<u8> {
        let header = match packet {
            Packet::Connect(p) => {
                self.encode_connect(p, out)?;
                PacketType::Connect.header(0)
            }
            Packet::ConnAck(p) => {
                let first = match self.version {
                    ProtocolVersion::V310 => 0,
                    ProtocolVersion::V311 => p.session_present as u8,
                };
                write_u8(out, first);
                write_u8(out, p.code as u8);
                PacketType::ConnAck.header(0)
            }
            Packet::Publish(p) => {
                p.validate()?;
                write_string(out, &p.topic)?;
                if let Some(pkid) = p.pkid {
                    write_u16(out, pkid);
                }
                out.put_slice(&p.payload);
                let mut flags = (p.qos as u8) << 1;
                if p.dup {
                    flags |= 0x08;
                }
                if p.retain {
                    flags |= 0x01;
                }
                PacketType::Publish.header(flags)
            }
            Packet::PubAck(pkid) => {
                write_u16(out, *pkid);
                PacketType::PubAck.header(0)
            }
            Packet::PubRec(pkid) => {
                write_u16(out, *pkid);
                PacketType::PubRec.header(0)
            }
            Packet::PubRel(pkid) => {
                write_u16(out, *pkid);
                PacketType::PubRel.header(FLAGS_QOS1)
            }
            Packet::PubComp(pkid) => {
                write_u16(out, *pkid);
                PacketType::PubComp.header(0)
            }
            Packet::Subscribe(p) => {
                if p.filters.is_empty() {
                    return Err(Error::protocol("SUBSCRIBE requires at least one filter"));
                }
                write_u16(out, p.pkid);
                for filter in &p.filters {
                    write_string(out, &filter.path)?;
                    write_u8(out, filter.qos as u8);
                }
                PacketType::Subscribe.header(FLAGS_QOS1)
            }
            Packet::SubAck(p) => {
                if p.return_codes.is_empty() {
                    return Err(Error::protocol("SUBACK requires at least one return code"));
                }
                write_u16(out, p.pkid);
                for code in &p.return_codes {
                    write_u8(out, code.to_u8());
                }
                PacketType::SubAck.header(0)
            }
            Packet::Unsubscribe(p) => {
                if p.topics.is_empty() {
                    return Err(Error::protocol("UNSUBSCRIBE requires at least one filter"));
                }
                write_u16(out, p.pkid);
                for topic in &p.topics {
                    write_string(out, topic)?;
                }
                PacketType::Unsubscribe.header(FLAGS_QOS1)
            }
            Packet::UnsubAck(pkid) => {
                write_u16(out, *pkid);
                PacketType::UnsubAck.header(0)
            }
            Packet::PingReq => PacketType::PingReq.header(0),
            Packet::PingResp => PacketType::PingResp.header(0),
            Packet::Disconnect => PacketType::Disconnect.header(0),
        };
        Ok(header)
    }

    fn encode_connect(&self, p: &Connect, out: &mut BufferWriter) -> Result<()> {
        if p.password.is_some() && p.username.is_none() {
            return Err(Error::protocol("password present without username"));
        }
        if p.client_id.is_empty() && !p.clean_session {
            return Err(Error::protocol(
                "empty client id requires a clean session",
            ));
        }

        let mut flags = 0u8;
        if p.clean_session {
            flags |= CONNECT_CLEAN_SESSION;
        }
        if let Some(will) = &p.will {
            flags |= CONNECT_WILL | ((will.qos as u8) << 3);
            if will.retain {
                flags |= CONNECT_WILL_RETAIN;
            }
        }
        if p.username.is_some() {
            flags |= CONNECT_USERNAME;
        }
        if p.password.is_some() {
            flags |= CONNECT_PASSWORD;
        }

        write_string(out, self.version.protocol_name())?;
        write_u8(out, self.version.level());
        write_u8(out, flags);
        write_u16(out, p.keep_alive);
        write_string(out, &p.client_id)?;
        if let Some(will) = &p.will {
            write_string(out, &will.topic)?;
            write_binary(out, &will.payload)?;
        }
        if let Some(username) = &p.username {
            write_string(out, username)?;
        }
        if let Some(password) = &p.password {
            write_binary(out, password)?;
        }
        Ok(())
    }

    /// Encode `packet` as a complete frame appended to `out`.
    ///
    /// The body is encoded in place after a slot sized for the longest
    /// remaining length, and moved down once its real length is known. On
    /// error `out` is left as it was.
    pub fn write_packet(&self, packet: &Packet, out: &mut BufferWriter) -> Result<()> {
        const SLOT: usize = 1 + MAX_VARIABLE_INT_LEN;

        let start = out.len();
        out.claim(SLOT);
        out.commit(SLOT);
        let header = match self.encode(packet, out) {
            Ok(header) => header,
            Err(e) => {
                out.truncate(start);
                return Err(e);
            }
        };

        let body_len = out.len() - start - SLOT;
        let Some(len) = u32::try_from(body_len)
            .ok()
            .filter(|len| *len <= MAX_REMAINING_LENGTH)
        else {
            out.truncate(start);
            return Err(Error::protocol(format!(
                "{} body of {} bytes is too large",
                packet.name(),
                body_len
            )));
        };

        let (digits, n) = variable_int_digits(len);
        let mut head = [0u8; SLOT];
        head[0] = header;
        head[1..=n].copy_from_slice(&digits[..n]);
        out.fill_reserved(start, start + SLOT, &head[..=n]);
        Ok(())
    }
}

fn expect_empty(frame: &Frame<'_>, packet: Packet) -> Result<Packet> {
    if !frame.body().is_empty() {
        return Err(Error::protocol(format!(
            "{} must not carry a body",
            packet.name()
        )));
    }
    Ok(packet)
}

/// Body of the acknowledgement packets: exactly a packet id.
fn decode_pkid(frame: &Frame<'_>) -> Result<u16> {
    match frame.body() {
        [] => Err(Error::protocol("data required but not present")),
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        body => Err(Error::protocol(format!(
            "packet id body must be 2 bytes, got {}",
            body.len()
        ))),
    }
}

fn decode_publish(frame: &Frame<'_>) -> Result<Publish> {
    let flags = frame.flags();
    let qos = QoS::from_u8((flags >> 1) & 0x03)?;
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;

    let mut r = body_reader(frame)?;
    let topic = r.read_string()?.to_string();
    let pkid = match qos {
        QoS::AtMostOnce => None,
        _ => match r.read_u16()? {
            0 => return Err(Error::protocol("packet id must be non-zero")),
            id => Some(id),
        },
    };
    let payload = Bytes::copy_from_slice(r.read_rest());

    Ok(Publish {
        topic,
        payload,
        qos,
        retain,
        dup,
        pkid,
    })
}

fn decode_subscribe(frame: &Frame<'_>) -> Result<Subscribe> {
    let mut r = body_reader(frame)?;
    let pkid = r.read_u16()?;
    let mut filters = Vec::new();
    while !r.is_empty() {
        let path = r.read_string()?.to_string();
        let requested = r.read_u8()?;
        if requested & 0xFC != 0 {
            return Err(Error::protocol("SUBSCRIBE options reserved bits are set"));
        }
        filters.push(TopicFilter {
            path,
            qos: QoS::from_u8(requested)?,
        });
    }
    if filters.is_empty() {
        return Err(Error::protocol("SUBSCRIBE requires at least one filter"));
    }
    Ok(Subscribe { pkid, filters })
}

fn decode_suback(frame: &Frame<'_>) -> Result<SubAck> {
    let mut r = body_reader(frame)?;
    let pkid = r.read_u16()?;
    let mut return_codes = Vec::new();
    while !r.is_empty() {
        return_codes.push(SubscribeReturnCode::from_u8(r.read_u8()?)?);
    }
    if return_codes.is_empty() {
        return Err(Error::protocol("SUBACK requires at least one return code"));
    }
    Ok(SubAck { pkid, return_codes })
}

fn decode_unsubscribe(frame: &Frame<'_>) -> Result<Unsubscribe> {
    let mut r = body_reader(frame)?;
    let pkid = r.read_u16()?;
    let mut topics = Vec::new();
    while !r.is_empty() {
        topics.push(r.read_string()?.to_string());
    }
    if topics.is_empty() {
        return Err(Error::protocol("UNSUBSCRIBE requires at least one filter"));
    }
    Ok(Unsubscribe { pkid, topics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::write_frame;

    fn round_trip(codec: Codec, packet: Packet) -> Packet {
        let mut out = BufferWriter::new();
        codec.write_packet(&packet, &mut out).unwrap();
        let (frame, consumed) = Frame::parse(out.written()).unwrap().unwrap();
        assert_eq!(consumed, out.len());
        codec.decode(&frame).unwrap()
    }

    fn connect_frame(name: &str, level: u8) -> Vec<u8> {
        let mut body = BufferWriter::new();
        write_string(&mut body, name).unwrap();
        write_u8(&mut body, level);
        write_u8(&mut body, CONNECT_CLEAN_SESSION);
        write_u16(&mut body, 30);
        write_string(&mut body, "c1").unwrap();
        let mut out = BufferWriter::new();
        write_frame(0x10, body.written(), &mut out).unwrap();
        out.written().to_vec()
    }

    #[test]
    fn test_connect_bytes_v311() {
        let codec = Codec::new(ProtocolVersion::V311);
        let mut out = BufferWriter::new();
        codec
            .write_packet(&Packet::Connect(Connect::new("c1")), &mut out)
            .unwrap();
        assert_eq!(
            out.written(),
            &[
                0x10, 14, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 60, 0x00, 0x02,
                b'c', b'1'
            ]
        );
    }

    #[test]
    fn test_connect_edge_cases() {
        for version in [ProtocolVersion::V310, ProtocolVersion::V311] {
            let codec = Codec::new(version);

            let mut empty_id = Connect::new("");
            assert_eq!(
                round_trip(codec, Packet::Connect(empty_id.clone())),
                Packet::Connect(empty_id.clone())
            );
            empty_id.clean_session = false;
            let mut out = BufferWriter::new();
            assert!(
                codec
                    .write_packet(&Packet::Connect(empty_id), &mut out)
                    .is_err()
            );
            assert!(out.is_empty());

            let full = Connect {
                client_id: "dev-42".into(),
                keep_alive: 10,
                clean_session: false,
                username: Some("user".into()),
                password: Some(Bytes::from_static(b"secret")),
                will: Some(LastWill {
                    topic: "dev/42/status".into(),
                    payload: Bytes::from_static(b"offline"),
                    qos: QoS::AtLeastOnce,
                    retain: true,
                }),
            };
            assert_eq!(
                round_trip(codec, Packet::Connect(full.clone())),
                Packet::Connect(full)
            );
        }
    }

    #[test]
    fn test_password_without_username() {
        let codec = Codec::new(ProtocolVersion::V311);
        let mut connect = Connect::new("c1");
        connect.password = Some(Bytes::from_static(b"pw"));
        let mut out = BufferWriter::new();
        assert!(matches!(
            codec.write_packet(&Packet::Connect(connect), &mut out),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_connect_reserved_flag() {
        let mut bytes = connect_frame("MQTT", 4);
        bytes[9] |= CONNECT_RESERVED;
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        let err = Codec::new(ProtocolVersion::V311).decode(&frame).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_connack_layout_per_version() {
        let ack = Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Accepted,
        });

        let mut out = BufferWriter::new();
        Codec::new(ProtocolVersion::V311)
            .write_packet(&ack, &mut out)
            .unwrap();
        assert_eq!(out.written(), &[0x20, 0x02, 0x01, 0x00]);

        out.reset();
        Codec::new(ProtocolVersion::V310)
            .write_packet(&ack, &mut out)
            .unwrap();
        assert_eq!(out.written(), &[0x20, 0x02, 0x00, 0x00]);

        let decoded = round_trip(Codec::new(ProtocolVersion::V310), ack);
        assert_eq!(decoded, Packet::ConnAck(ConnAck::accepted()));
    }

    #[test]
    fn test_publish_qos_variants() {
        let codec = Codec::new(ProtocolVersion::V311);
        let qos0 = Publish::new("a/b", Bytes::from_static(&[1, 2, 3]));
        assert_eq!(
            round_trip(codec, Packet::Publish(qos0.clone())),
            Packet::Publish(qos0)
        );

        let empty = Publish::new("a/b", Bytes::new()).with_qos(QoS::AtLeastOnce, Some(9));
        assert_eq!(
            round_trip(codec, Packet::Publish(empty.clone())),
            Packet::Publish(empty)
        );

        let mut qos2 = Publish::new("a/b", "x")
            .with_qos(QoS::ExactlyOnce, Some(65535))
            .with_retain(true);
        qos2.dup = true;
        assert_eq!(
            round_trip(codec, Packet::Publish(qos2.clone())),
            Packet::Publish(qos2)
        );

        let mut out = BufferWriter::new();
        let missing = Publish::new("a/b", "x").with_qos(QoS::AtLeastOnce, None);
        assert!(codec.write_packet(&Packet::Publish(missing), &mut out).is_err());
    }

    #[test]
    fn test_publish_qos3_rejected() {
        let bytes = [0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01];
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        let err = Codec::new(ProtocolVersion::V311).decode(&frame).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_subscribe_family() {
        let codec = Codec::new(ProtocolVersion::V311);
        let sub = Packet::Subscribe(Subscribe {
            pkid: 1,
            filters: vec![
                TopicFilter::new("a/+", QoS::AtMostOnce),
                TopicFilter::new("b/#", QoS::AtLeastOnce),
            ],
        });
        assert_eq!(round_trip(codec, sub.clone()), sub);

        let ack = Packet::SubAck(SubAck {
            pkid: 1,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtMostOnce),
                SubscribeReturnCode::Failure,
            ],
        });
        assert_eq!(round_trip(codec, ack.clone()), ack);

        let unsub = Packet::Unsubscribe(Unsubscribe {
            pkid: 2,
            topics: vec!["a/+".into()],
        });
        assert_eq!(round_trip(codec, unsub.clone()), unsub);

        let mut out = BufferWriter::new();
        let empty = Packet::Subscribe(Subscribe {
            pkid: 3,
            filters: vec![],
        });
        assert!(codec.write_packet(&empty, &mut out).is_err());

        // pkid only, no filters
        let bytes = [0x82, 0x02, 0x00, 0x03];
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        assert!(matches!(codec.decode(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_acks_and_empty_packets() {
        let codec = Codec::new(ProtocolVersion::V311);
        for packet in [
            Packet::PubAck(1),
            Packet::PubRec(2),
            Packet::PubRel(3),
            Packet::PubComp(4),
            Packet::UnsubAck(5),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ] {
            assert_eq!(round_trip(codec, packet.clone()), packet);
        }

        let mut out = BufferWriter::new();
        codec.write_packet(&Packet::PubRel(3), &mut out).unwrap();
        assert_eq!(out.written(), &[0x62, 0x02, 0x00, 0x03]);
    }

    #[test]
    fn test_empty_body_rejected() {
        let codec = Codec::new(ProtocolVersion::V311);
        for header in [0x10, 0x20, 0x30, 0x40, 0x82, 0x90, 0xA2, 0xB0] {
            let bytes = [header, 0x00];
            let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
            let err = codec.decode(&frame).unwrap_err();
            assert!(
                err.to_string().contains("data required but not present"),
                "header {:#04x}: {}",
                header,
                err
            );
        }
    }

    #[test]
    fn test_ack_body_must_be_packet_id() {
        let codec = Codec::new(ProtocolVersion::V311);
        for header in [0x40, 0x50, 0x62, 0x70, 0xB0] {
            for body in [&[0x00][..], &[0x00, 0x01, 0x02][..]] {
                let mut bytes = vec![header, body.len() as u8];
                bytes.extend_from_slice(body);
                let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
                let err = codec.decode(&frame).unwrap_err();
                assert!(
                    err.to_string().contains("must be 2 bytes"),
                    "header {:#04x} body {:?}: {}",
                    header,
                    body,
                    err
                );
            }
        }
    }

    #[test]
    fn test_write_packet_appends_in_place() {
        let codec = Codec::new(ProtocolVersion::V311);
        let mut out = BufferWriter::new();
        codec.write_packet(&Packet::PingResp, &mut out).unwrap();
        codec.write_packet(&Packet::PubAck(7), &mut out).unwrap();

        // 200-byte body: the remaining length takes two bytes.
        let publish = Packet::Publish(Publish::new("t", vec![9u8; 197]));
        codec.write_packet(&publish, &mut out).unwrap();
        let capacity = out.capacity();

        assert_eq!(&out.written()[..6], &[0xD0, 0x00, 0x40, 0x02, 0x00, 0x07]);
        assert_eq!(&out.written()[6..9], &[0x30, 0xC8, 0x01]);
        assert_eq!(out.len(), 6 + 3 + 200);
        let (frame, consumed) = Frame::parse(&out.written()[6..]).unwrap().unwrap();
        assert_eq!(consumed, 203);
        assert_eq!(codec.decode(&frame).unwrap(), publish);

        // A reset writer serves the next packet from the same storage.
        out.reset();
        codec.write_packet(&Packet::PubAck(8), &mut out).unwrap();
        assert_eq!(out.written(), &[0x40, 0x02, 0x00, 0x08]);
        assert_eq!(out.capacity(), capacity);
    }

    #[test]
    fn test_write_packet_error_leaves_output() {
        let codec = Codec::new(ProtocolVersion::V311);
        let mut out = BufferWriter::new();
        codec.write_packet(&Packet::PingReq, &mut out).unwrap();

        let long_topic = "t".repeat(70_000);
        let publish = Packet::Publish(Publish::new(long_topic, "x"));
        assert!(codec.write_packet(&publish, &mut out).is_err());
        assert_eq!(out.written(), &[0xC0, 0x00]);
    }

    #[test]
    fn test_invalid_packet_type() {
        let codec = Codec::new(ProtocolVersion::V311);
        for header in [0x00, 0xF0] {
            let bytes = [header, 0x00];
            let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
            assert!(matches!(codec.decode(&frame), Err(Error::Protocol(_))));
        }
    }

    #[test]
    fn test_detect_version() {
        let bytes = connect_frame("MQTT", 4);
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(detect_version(&frame).unwrap(), ProtocolVersion::V311);

        let bytes = connect_frame("MQIsdp", 3);
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(detect_version(&frame).unwrap(), ProtocolVersion::V310);
        // Detection leaves the frame decodable.
        let packet = Codec::new(ProtocolVersion::V310).decode(&frame).unwrap();
        assert!(matches!(packet, Packet::Connect(c) if c.client_id == "c1" && c.keep_alive == 30));

        let bytes = connect_frame("MQTT", 5);
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        assert!(matches!(detect_version(&frame), Err(Error::Unsupported(_))));

        let bytes = [0xC0, 0x00];
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        assert!(matches!(detect_version(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_bogus_protocol_name() {
        let bytes = connect_frame("BOGUS", 4);
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        assert!(matches!(detect_version(&frame), Err(Error::Protocol(_))));
        for version in [ProtocolVersion::V310, ProtocolVersion::V311] {
            let result = Codec::new(version).decode(&frame);
            assert!(matches!(result, Err(Error::Protocol(_))));
        }
    }

    #[test]
    fn test_connect_version_mismatch() {
        let bytes = connect_frame("MQIsdp", 3);
        let (frame, _) = Frame::parse(&bytes).unwrap().unwrap();
        assert!(Codec::new(ProtocolVersion::V311).decode(&frame).is_err());
    }
}
