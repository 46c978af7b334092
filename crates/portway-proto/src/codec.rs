//! Codec for encoding/decoding control-channel frames
//!
//! Frame layout:
//!
//! ```text
//!  offset  size  field
//!    0      1    version (=1)
//!    1      1    message type
//!    2      4    tunnel id (big-endian)
//!    6      4    payload length N (big-endian)
//!   10      N    payload bytes
//! ```
//!
//! Strings inside payloads are a big-endian u16 length followed by UTF-8
//! bytes. Decoding is incremental: [`FrameCodec::decode`] returns `Ok(None)`
//! until a whole frame is buffered, so arbitrarily concatenated frames parse
//! back to the same sequence.

use crate::messages::{Frame, Message, Proto, RuleSpec, MAX_PAYLOAD, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const HEADER_LEN: usize = 10;

/// Codec errors. All of these are channel-fatal except `Ok(None)` from a
/// short read, which simply means more bytes are needed.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("truncated {0} payload")]
    Truncated(&'static str),

    #[error("{0} payload has {1} trailing bytes")]
    TrailingBytes(&'static str, usize),

    #[error("invalid utf-8 in {0} field")]
    InvalidString(&'static str),

    #[error("invalid protocol name {0:?}")]
    InvalidProto(String),
}

/// Frame codec for the control channel.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame to its wire representation.
    pub fn encode(frame: &Frame) -> Result<Bytes, CodecError> {
        let payload = encode_payload(&frame.message);
        if payload.len() > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(frame.message.kind());
        buf.put_u32(frame.tunnel_id);
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was consumed,
    /// `Ok(None)` if more data is needed, `Err` on a malformed frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let kind = buf[1];
        let tunnel_id = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let length = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;

        if length > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(length));
        }

        if buf.len() < HEADER_LEN + length {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(length).freeze();
        let message = decode_payload(kind, payload)?;

        Ok(Some(Frame { tunnel_id, message }))
    }

    /// Decode every complete frame buffered in `buf`.
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();
        while let Some(frame) = Self::decode(buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Decode exactly one frame from a complete message and reject trailing
    /// bytes. Used where the transport already preserves message boundaries.
    pub fn decode_message(data: &[u8]) -> Result<Frame, CodecError> {
        let mut buf = BytesMut::from(data);
        match Self::decode(&mut buf)? {
            Some(frame) if buf.is_empty() => Ok(frame),
            Some(frame) => Err(CodecError::TrailingBytes(
                frame.message.kind_name(),
                buf.len(),
            )),
            None => Err(CodecError::Truncated("frame")),
        }
    }
}

fn encode_payload(message: &Message) -> BytesMut {
    let mut buf = BytesMut::new();
    match message {
        Message::Auth { token, name } => {
            put_str(&mut buf, token);
            put_str(&mut buf, name);
        }
        Message::AuthAck {
            success,
            agent_id,
            error,
        } => {
            buf.put_u8(*success as u8);
            put_str(&mut buf, agent_id);
            put_str(&mut buf, error);
        }
        Message::Heartbeat | Message::Close => {}
        Message::Connect { proto, host, port } => {
            put_str(&mut buf, proto.as_str());
            put_str(&mut buf, host);
            buf.put_u16(*port);
        }
        Message::ConnectAck { success, error } => {
            buf.put_u8(*success as u8);
            put_str(&mut buf, error);
        }
        Message::Data(data) | Message::IcmpData(data) => {
            buf.extend_from_slice(data);
        }
        Message::UdpData {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            data,
        } => {
            put_str(&mut buf, src_ip);
            buf.put_u16(*src_port);
            put_str(&mut buf, dst_ip);
            buf.put_u16(*dst_port);
            buf.extend_from_slice(data);
        }
        Message::RuleAssign(spec) => {
            put_str(&mut buf, &spec.rule_id);
            put_str(&mut buf, &spec.name);
            put_str(&mut buf, spec.proto.as_str());
            buf.put_u16(spec.listen_port);
            put_str(&mut buf, &spec.target_host);
            buf.put_u16(spec.target_port);
        }
        Message::RuleRevoke { rule_id } => {
            put_str(&mut buf, rule_id);
        }
        Message::TunnelOpen { rule_id } => {
            put_str(&mut buf, rule_id);
        }
    }
    buf
}

fn decode_payload(kind: u8, mut payload: Bytes) -> Result<Message, CodecError> {
    let message = match kind {
        Message::AUTH => {
            let token = get_str(&mut payload, "auth")?;
            let name = get_str(&mut payload, "auth")?;
            Message::Auth { token, name }
        }
        Message::AUTH_ACK => {
            let success = get_bool(&mut payload, "auth-ack")?;
            let agent_id = get_str(&mut payload, "auth-ack")?;
            let error = get_str(&mut payload, "auth-ack")?;
            Message::AuthAck {
                success,
                agent_id,
                error,
            }
        }
        Message::HEARTBEAT => Message::Heartbeat,
        Message::CONNECT => {
            let proto = get_proto(&mut payload, "connect")?;
            let host = get_str(&mut payload, "connect")?;
            let port = get_u16(&mut payload, "connect")?;
            Message::Connect { proto, host, port }
        }
        Message::CONNECT_ACK => {
            let success = get_bool(&mut payload, "connect-ack")?;
            let error = get_str(&mut payload, "connect-ack")?;
            Message::ConnectAck { success, error }
        }
        Message::DATA => return Ok(Message::Data(payload)),
        Message::CLOSE => Message::Close,
        Message::UDP_DATA => {
            let src_ip = get_str(&mut payload, "udp-data")?;
            let src_port = get_u16(&mut payload, "udp-data")?;
            let dst_ip = get_str(&mut payload, "udp-data")?;
            let dst_port = get_u16(&mut payload, "udp-data")?;
            return Ok(Message::UdpData {
                src_ip,
                src_port,
                dst_ip,
                dst_port,
                data: payload,
            });
        }
        Message::ICMP_DATA => return Ok(Message::IcmpData(payload)),
        Message::RULE_ASSIGN => {
            let spec = RuleSpec {
                rule_id: get_str(&mut payload, "rule-assign")?,
                name: get_str(&mut payload, "rule-assign")?,
                proto: get_proto(&mut payload, "rule-assign")?,
                listen_port: get_u16(&mut payload, "rule-assign")?,
                target_host: get_str(&mut payload, "rule-assign")?,
                target_port: get_u16(&mut payload, "rule-assign")?,
            };
            Message::RuleAssign(spec)
        }
        Message::RULE_REVOKE => Message::RuleRevoke {
            rule_id: get_str(&mut payload, "rule-revoke")?,
        },
        Message::TUNNEL_OPEN => Message::TunnelOpen {
            rule_id: get_str(&mut payload, "tunnel-open")?,
        },
        other => return Err(CodecError::UnknownType(other)),
    };

    if !payload.is_empty() {
        return Err(CodecError::TrailingBytes(
            message.kind_name(),
            payload.len(),
        ));
    }
    Ok(message)
}

fn put_str(buf: &mut BytesMut, s: &str) {
    // Field strings are operator-supplied names and hostnames; u16 length
    // is ample and enforced at rule creation.
    let len = s.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

fn get_str(payload: &mut Bytes, ctx: &'static str) -> Result<String, CodecError> {
    let len = get_u16(payload, ctx)? as usize;
    if payload.remaining() < len {
        return Err(CodecError::Truncated(ctx));
    }
    let raw = payload.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidString(ctx))
}

fn get_u16(payload: &mut Bytes, ctx: &'static str) -> Result<u16, CodecError> {
    if payload.remaining() < 2 {
        return Err(CodecError::Truncated(ctx));
    }
    Ok(payload.get_u16())
}

fn get_bool(payload: &mut Bytes, ctx: &'static str) -> Result<bool, CodecError> {
    if payload.remaining() < 1 {
        return Err(CodecError::Truncated(ctx));
    }
    Ok(payload.get_u8() != 0)
}

fn get_proto(payload: &mut Bytes, ctx: &'static str) -> Result<Proto, CodecError> {
    let name = get_str(payload, ctx)?;
    Proto::from_str(&name).ok_or(CodecError::InvalidProto(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let encoded = FrameCodec::encode(&frame).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = FrameCodec::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_encode_decode_auth() {
        let frame = Frame::auth("secret-token", "edge-box");
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_encode_decode_connect() {
        let frame = Frame::connect(42, Proto::Tcp, "10.0.0.5", 8080);
        let decoded = roundtrip(frame.clone());
        assert_eq!(decoded.tunnel_id, 42);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_encode_decode_data() {
        let frame = Frame::data(7, Bytes::from_static(b"hello\n"));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_encode_decode_udp_data() {
        let frame = Frame::udp_data(
            ("192.168.1.9", 50123),
            ("10.0.0.5", 5353),
            Bytes::from_static(b"ping"),
        );
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_encode_decode_rule_assign() {
        let frame = Frame::new(
            0,
            Message::RuleAssign(RuleSpec {
                rule_id: "r1".into(),
                name: "ssh to db host".into(),
                proto: Proto::Tcp,
                listen_port: 2222,
                target_host: "db.internal".into(),
                target_port: 22,
            }),
        );
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_empty_payload_messages() {
        for frame in [Frame::heartbeat(), Frame::close(9)] {
            let encoded = FrameCodec::encode(&frame).unwrap();
            assert_eq!(encoded.len(), 10);
            let mut buf = BytesMut::from(encoded.as_ref());
            assert_eq!(FrameCodec::decode(&mut buf).unwrap(), Some(frame));
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = FrameCodec::encode(&Frame::auth("t", "n")).unwrap();

        // Header only, then byte by byte until complete.
        let mut buf = BytesMut::from(&encoded[..9]);
        assert!(FrameCodec::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[9..encoded.len() - 1]);
        assert!(FrameCodec::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert!(FrameCodec::decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_concatenated_frames_preserve_boundaries() {
        let frames = vec![
            Frame::heartbeat(),
            Frame::connect(1, Proto::Udp, "example.test", 53),
            Frame::data(1, Bytes::from(vec![0u8; 4096])),
            Frame::close(1),
        ];

        let mut buf = BytesMut::new();
        for frame in &frames {
            buf.extend_from_slice(&FrameCodec::encode(frame).unwrap());
        }

        let decoded = FrameCodec::decode_all(&mut buf).unwrap();
        assert_eq!(decoded, frames);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reject_oversize_payload() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(Message::DATA);
        buf.put_u32(1);
        buf.put_u32((MAX_PAYLOAD + 1) as u32);
        assert!(matches!(
            FrameCodec::decode(&mut buf),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_reject_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(200);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(matches!(
            FrameCodec::decode(&mut buf),
            Err(CodecError::UnknownType(200))
        ));
    }

    #[test]
    fn test_reject_bad_version() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u8(Message::HEARTBEAT);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(matches!(
            FrameCodec::decode(&mut buf),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_reject_truncated_string_field() {
        // Auth frame whose payload claims a longer token than it carries.
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(Message::AUTH);
        buf.put_u32(0);
        buf.put_u32(4);
        buf.put_u16(400);
        buf.put_u16(0);
        assert!(matches!(
            FrameCodec::decode(&mut buf),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_decode_message_rejects_trailing_bytes() {
        let mut raw = FrameCodec::encode(&Frame::heartbeat()).unwrap().to_vec();
        raw.push(0xff);
        assert!(matches!(
            FrameCodec::decode_message(&raw),
            Err(CodecError::TrailingBytes(_, 1))
        ));
    }

    #[test]
    fn test_connect_ack_failure_roundtrip() {
        let frame = Frame::connect_err(3, "connection refused");
        let decoded = roundtrip(frame);
        match decoded.message {
            Message::ConnectAck { success, error } => {
                assert!(!success);
                assert_eq!(error, "connection refused");
            }
            other => panic!("expected ConnectAck, got {:?}", other),
        }
    }
}
