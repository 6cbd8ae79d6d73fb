//! Wire frame codec (component B). Nine tagged frame kinds, each a tag byte followed by
//! length-prefixed fields. A `Frame` is exactly what one [`Connection::write_message`] /
//! [`read_message`](crate::transport::Connection) call carries — transports that lack
//! native message framing are responsible for delimiting these bytes on the wire, not
//! this module.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::{ensure, ResultExt, Snafu};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::types::{Protocol, TargetAddr};

/// Frames larger than this are a fatal protocol error, regardless of how much of the
/// buffer has already arrived.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtoError {
    #[snafu(display("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"))]
    FrameTooLarge { len: usize },

    #[snafu(display("unknown frame tag {value:#04x}"))]
    UnknownTag { value: u8 },

    #[snafu(display("unknown address type {value:#04x}"))]
    UnknownAddressType { value: u8 },

    #[snafu(display("unknown protocol byte {value:#04x}"))]
    UnknownProtocol { value: u8 },

    #[snafu(display("address field is not valid utf-8"))]
    Utf8 { source: std::string::FromUtf8Error },

    #[snafu(display("a domain name is not a valid peer socket address"))]
    DomainNotAPeerAddress,

    #[snafu(display("io error: {source}"), context(false))]
    Io { source: std::io::Error },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
enum Tag {
    Connect = 0x01,
    ConnectAck = 0x02,
    Data = 0x03,
    Close = 0x04,
    PortOpen = 0x05,
    PortOpenAck = 0x06,
    PortAccept = 0x07,
    Ping = 0x08,
    Pong = 0x09,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// One message exchanged over a tunnel connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Connect {
        conn_id: Uuid,
        protocol: Protocol,
        target: TargetAddr,
    },
    ConnectAck {
        conn_id: Uuid,
        ok: bool,
        err_msg: Option<String>,
    },
    Data {
        conn_id: Uuid,
        payload: Bytes,
    },
    Close {
        conn_id: Uuid,
        err_msg: Option<String>,
    },
    PortOpen {
        remote_port: u16,
        protocol: Protocol,
        local_host: String,
        local_port: u16,
    },
    PortOpenAck {
        remote_port: u16,
        protocol: Protocol,
        ok: bool,
        err_msg: Option<String>,
    },
    PortAccept {
        conn_id: Uuid,
        remote_port: u16,
        remote_peer_addr: SocketAddr,
    },
    Ping,
    Pong,
}

impl Frame {
    fn tag(&self) -> Tag {
        match self {
            Frame::Connect { .. } => Tag::Connect,
            Frame::ConnectAck { .. } => Tag::ConnectAck,
            Frame::Data { .. } => Tag::Data,
            Frame::Close { .. } => Tag::Close,
            Frame::PortOpen { .. } => Tag::PortOpen,
            Frame::PortOpenAck { .. } => Tag::PortOpenAck,
            Frame::PortAccept { .. } => Tag::PortAccept,
            Frame::Ping => Tag::Ping,
            Frame::Pong => Tag::Pong,
        }
    }
}

/// Encodes or decodes one complete [`Frame`] from one complete message buffer, as
/// delivered by a [`Connection`](crate::transport::Connection) whose transport already
/// provides message atomicity (WebSocket, gRPC streaming, length-framed QUIC).
#[derive(Default, Clone, Copy)]
pub struct FrameCodec;

pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(frame.tag().into());
    encode_body(frame, &mut buf);
    buf.freeze()
}

pub fn decode_frame(mut data: Bytes) -> Result<Frame, ProtoError> {
    ensure!(data.len() <= MAX_FRAME_LEN, FrameTooLargeSnafu { len: data.len() });
    ensure!(!data.is_empty(), UnknownTagSnafu { value: 0u8 });
    let tag = Tag::from(data.get_u8());
    if let Tag::Unknown(value) = tag {
        return UnknownTagSnafu { value }.fail();
    }
    decode_body(tag, &mut data)
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let bytes = encode_frame(&item);
        ensure!(bytes.len() <= MAX_FRAME_LEN, FrameTooLargeSnafu { len: bytes.len() });
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
        if src.is_empty() {
            return Ok(None);
        }
        let tag = Tag::from(src[0]);
        if let Tag::Unknown(value) = tag {
            return UnknownTagSnafu { value }.fail();
        }
        let Some(body_len) = peek_body_len(tag, &src[1..]) else {
            return Ok(None);
        };
        ensure!(1 + body_len <= MAX_FRAME_LEN, FrameTooLargeSnafu { len: 1 + body_len });
        if src.len() < 1 + body_len {
            return Ok(None);
        }
        src.advance(1);
        let mut body = src.split_to(body_len).freeze();
        Ok(Some(decode_body(tag, &mut body)?))
    }
}

// ---- peeking (read-only length discovery; never mutates the input) ----

fn peek_string_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total = 2 + len;
    (buf.len() >= total).then_some(total)
}

fn peek_opt_string_len(buf: &[u8]) -> Option<usize> {
    let present = *buf.first()?;
    if present == 0 {
        Some(1)
    } else {
        peek_string_len(buf.get(1..)?).map(|n| 1 + n)
    }
}

fn peek_addr_len(buf: &[u8]) -> Option<usize> {
    match *buf.first()? {
        0 => {
            let dlen = *buf.get(1)? as usize;
            let total = 2 + dlen + 2;
            (buf.len() >= total).then_some(total)
        }
        1 => (buf.len() >= 7).then_some(7),
        2 => (buf.len() >= 19).then_some(19),
        // unknown type: one byte is enough to know decode_body will reject it.
        _ => Some(1),
    }
}

fn peek_body_len(tag: Tag, buf: &[u8]) -> Option<usize> {
    match tag {
        Tag::Connect => {
            if buf.len() < 17 {
                return None;
            }
            peek_addr_len(&buf[17..]).map(|n| 17 + n)
        }
        Tag::ConnectAck => {
            if buf.len() < 17 {
                return None;
            }
            peek_opt_string_len(&buf[17..]).map(|n| 17 + n)
        }
        Tag::Data => {
            if buf.len() < 20 {
                return None;
            }
            let len = u32::from_be_bytes(buf[16..20].try_into().unwrap()) as usize;
            let total = 20 + len;
            (buf.len() >= total).then_some(total)
        }
        Tag::Close => {
            if buf.len() < 16 {
                return None;
            }
            peek_opt_string_len(&buf[16..]).map(|n| 16 + n)
        }
        Tag::PortOpen => {
            if buf.len() < 3 {
                return None;
            }
            let host_len = peek_string_len(&buf[3..])?;
            let total = 3 + host_len + 2;
            (buf.len() >= total).then_some(total)
        }
        Tag::PortOpenAck => {
            if buf.len() < 4 {
                return None;
            }
            peek_opt_string_len(&buf[4..]).map(|n| 4 + n)
        }
        Tag::PortAccept => {
            if buf.len() < 18 {
                return None;
            }
            peek_addr_len(&buf[18..]).map(|n| 18 + n)
        }
        Tag::Ping | Tag::Pong => Some(0),
        Tag::Unknown(_) => Some(0),
    }
}

// ---- decode (operates on an exactly-sized, already-complete body) ----

fn read_uuid(body: &mut Bytes) -> Uuid {
    let mut raw = [0u8; 16];
    body.copy_to_slice(&mut raw);
    Uuid::from_bytes(raw)
}

fn read_protocol(body: &mut Bytes) -> Result<Protocol, ProtoError> {
    match body.get_u8() {
        0 => Ok(Protocol::Tcp),
        1 => Ok(Protocol::Udp),
        value => UnknownProtocolSnafu { value }.fail(),
    }
}

fn read_string(body: &mut Bytes) -> Result<String, ProtoError> {
    let len = body.get_u16() as usize;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).context(Utf8Snafu)
}

fn read_opt_string(body: &mut Bytes) -> Result<Option<String>, ProtoError> {
    if body.get_u8() == 0 {
        Ok(None)
    } else {
        Ok(Some(read_string(body)?))
    }
}

fn read_addr(body: &mut Bytes) -> Result<TargetAddr, ProtoError> {
    match body.get_u8() {
        0 => {
            let len = body.get_u8() as usize;
            let raw = body.split_to(len);
            let domain = String::from_utf8(raw.to_vec()).context(Utf8Snafu)?;
            let port = body.get_u16();
            Ok(TargetAddr::Domain(domain, port))
        }
        1 => {
            let mut raw = [0u8; 4];
            body.copy_to_slice(&mut raw);
            let port = body.get_u16();
            Ok(TargetAddr::IPv4(Ipv4Addr::from(raw), port))
        }
        2 => {
            let mut raw = [0u8; 16];
            body.copy_to_slice(&mut raw);
            let port = body.get_u16();
            Ok(TargetAddr::IPv6(Ipv6Addr::from(raw), port))
        }
        value => UnknownAddressTypeSnafu { value }.fail(),
    }
}

fn read_socket_addr(body: &mut Bytes) -> Result<SocketAddr, ProtoError> {
    match read_addr(body)? {
        TargetAddr::IPv4(ip, port) => Ok(SocketAddr::from((ip, port))),
        TargetAddr::IPv6(ip, port) => Ok(SocketAddr::from((ip, port))),
        TargetAddr::Domain(..) => DomainNotAPeerAddressSnafu.fail(),
    }
}

fn decode_body(tag: Tag, body: &mut Bytes) -> Result<Frame, ProtoError> {
    Ok(match tag {
        Tag::Connect => {
            let conn_id = read_uuid(body);
            let protocol = read_protocol(body)?;
            let target = read_addr(body)?;
            Frame::Connect { conn_id, protocol, target }
        }
        Tag::ConnectAck => {
            let conn_id = read_uuid(body);
            let ok = body.get_u8() != 0;
            let err_msg = read_opt_string(body)?;
            Frame::ConnectAck { conn_id, ok, err_msg }
        }
        Tag::Data => {
            let conn_id = read_uuid(body);
            let len = body.get_u32() as usize;
            let payload = body.split_to(len);
            Frame::Data { conn_id, payload }
        }
        Tag::Close => {
            let conn_id = read_uuid(body);
            let err_msg = read_opt_string(body)?;
            Frame::Close { conn_id, err_msg }
        }
        Tag::PortOpen => {
            let remote_port = body.get_u16();
            let protocol = read_protocol(body)?;
            let local_host = read_string(body)?;
            let local_port = body.get_u16();
            Frame::PortOpen { remote_port, protocol, local_host, local_port }
        }
        Tag::PortOpenAck => {
            let remote_port = body.get_u16();
            let protocol = read_protocol(body)?;
            let ok = body.get_u8() != 0;
            let err_msg = read_opt_string(body)?;
            Frame::PortOpenAck { remote_port, protocol, ok, err_msg }
        }
        Tag::PortAccept => {
            let conn_id = read_uuid(body);
            let remote_port = body.get_u16();
            let remote_peer_addr = read_socket_addr(body)?;
            Frame::PortAccept { conn_id, remote_port, remote_peer_addr }
        }
        Tag::Ping => Frame::Ping,
        Tag::Pong => Frame::Pong,
        Tag::Unknown(value) => return UnknownTagSnafu { value }.fail(),
    })
}

// ---- encode ----

fn put_uuid(buf: &mut BytesMut, id: Uuid) {
    buf.put_slice(id.as_bytes());
}

fn put_protocol(buf: &mut BytesMut, protocol: Protocol) {
    buf.put_u8(match protocol {
        Protocol::Tcp => 0,
        Protocol::Udp => 1,
    });
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_opt_string(buf: &mut BytesMut, s: &Option<String>) {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
    }
}

fn put_addr(buf: &mut BytesMut, addr: &TargetAddr) {
    match addr {
        TargetAddr::Domain(host, port) => {
            buf.put_u8(0);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host.as_bytes());
            buf.put_u16(*port);
        }
        TargetAddr::IPv4(ip, port) => {
            buf.put_u8(1);
            buf.put_slice(&ip.octets());
            buf.put_u16(*port);
        }
        TargetAddr::IPv6(ip, port) => {
            buf.put_u8(2);
            buf.put_slice(&ip.octets());
            buf.put_u16(*port);
        }
    }
}

fn put_socket_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => put_addr(buf, &TargetAddr::IPv4(*v4.ip(), v4.port())),
        SocketAddr::V6(v6) => put_addr(buf, &TargetAddr::IPv6(*v6.ip(), v6.port())),
    }
}

fn encode_body(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Connect { conn_id, protocol, target } => {
            put_uuid(buf, *conn_id);
            put_protocol(buf, *protocol);
            put_addr(buf, target);
        }
        Frame::ConnectAck { conn_id, ok, err_msg } => {
            put_uuid(buf, *conn_id);
            buf.put_u8(*ok as u8);
            put_opt_string(buf, err_msg);
        }
        Frame::Data { conn_id, payload } => {
            put_uuid(buf, *conn_id);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
        }
        Frame::Close { conn_id, err_msg } => {
            put_uuid(buf, *conn_id);
            put_opt_string(buf, err_msg);
        }
        Frame::PortOpen { remote_port, protocol, local_host, local_port } => {
            buf.put_u16(*remote_port);
            put_protocol(buf, *protocol);
            put_string(buf, local_host);
            buf.put_u16(*local_port);
        }
        Frame::PortOpenAck { remote_port, protocol, ok, err_msg } => {
            buf.put_u16(*remote_port);
            put_protocol(buf, *protocol);
            buf.put_u8(*ok as u8);
            put_opt_string(buf, err_msg);
        }
        Frame::PortAccept { conn_id, remote_port, remote_peer_addr } => {
            put_uuid(buf, *conn_id);
            buf.put_u16(*remote_port);
            put_socket_addr(buf, *remote_peer_addr);
        }
        Frame::Ping | Frame::Pong => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn roundtrip(frame: Frame) {
        let encoded = encode_frame(&frame);
        let decoded = decode_frame(encoded).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrips_every_frame_kind() {
        let conn_id = Uuid::new_v4();
        roundtrip(Frame::Connect {
            conn_id,
            protocol: Protocol::Tcp,
            target: TargetAddr::Domain("example.com".into(), 443),
        });
        roundtrip(Frame::Connect {
            conn_id,
            protocol: Protocol::Udp,
            target: TargetAddr::IPv4(Ipv4Addr::new(10, 0, 0, 1), 53),
        });
        roundtrip(Frame::ConnectAck { conn_id, ok: true, err_msg: None });
        roundtrip(Frame::ConnectAck {
            conn_id,
            ok: false,
            err_msg: Some("refused".into()),
        });
        roundtrip(Frame::Data {
            conn_id,
            payload: Bytes::from_static(b"hello"),
        });
        roundtrip(Frame::Close { conn_id, err_msg: None });
        roundtrip(Frame::PortOpen {
            remote_port: 8080,
            protocol: Protocol::Tcp,
            local_host: "127.0.0.1".into(),
            local_port: 80,
        });
        roundtrip(Frame::PortOpenAck {
            remote_port: 8080,
            protocol: Protocol::Tcp,
            ok: true,
            err_msg: None,
        });
        roundtrip(Frame::PortAccept {
            conn_id,
            remote_port: 8080,
            remote_peer_addr: SocketAddr::from(([203, 0, 113, 9], 51422)),
        });
        roundtrip(Frame::Ping);
        roundtrip(Frame::Pong);
    }

    #[test]
    fn decoder_waits_for_a_full_frame_split_across_calls() {
        let mut codec = FrameCodec;
        let frame = Frame::Data {
            conn_id: Uuid::new_v4(),
            payload: Bytes::from(vec![7u8; 4096]),
        };
        let full = encode_frame(&frame);

        let mut buf = BytesMut::new();
        buf.put_slice(&full[..full.len() / 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&full[full.len() / 2..]);
        let decoded = codec.decode(&mut buf).unwrap().expect("now complete");
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected_without_partial_consumption() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(Tag::Data.into());
        put_uuid(&mut buf, Uuid::new_v4());
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ProtoError::FrameTooLarge { .. })));
    }

    #[test]
    fn unknown_tag_is_a_fatal_protocol_error() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(0xEE);
        assert!(matches!(codec.decode(&mut buf), Err(ProtoError::UnknownTag { value: 0xEE })));
    }
}
